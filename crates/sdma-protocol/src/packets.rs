//! SDMA packet layouts and encoders.
//!
//! Every encoder takes the destination dword slice, zeroes the packet's
//! footprint, fills in the fields and returns the number of dwords written.
//! The destination must be at least `SIZE_DWORDS` long for the packet; a
//! shorter slice is a caller bug and panics.

use core::mem::size_of;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::generation::SdmaGeneration;

pub const SDMA_OP_NOP: u32 = 0;
pub const SDMA_OP_COPY: u32 = 1;
pub const SDMA_OP_FENCE: u32 = 5;
pub const SDMA_OP_TRAP: u32 = 6;
pub const SDMA_OP_POLL_REGMEM: u32 = 8;
pub const SDMA_OP_ATOMIC: u32 = 10;
pub const SDMA_OP_CONST_FILL: u32 = 11;
pub const SDMA_OP_TIMESTAMP: u32 = 13;
pub const SDMA_OP_GCR: u32 = 17;

pub const SDMA_SUBOP_COPY_LINEAR: u32 = 0;
pub const SDMA_SUBOP_COPY_LINEAR_RECT: u32 = 4;
pub const SDMA_SUBOP_TIMESTAMP_GET_GLOBAL: u32 = 2;
pub const SDMA_SUBOP_USER_GCR: u32 = 1;

pub const SDMA_ATOMIC_ADD64: u32 = 47;

/// `fillsize` selector for 32-bit fill patterns.
pub const SDMA_FILL_WIDTH_DWORD: u32 = 2;

/// `retry_count` value that makes a poll retry forever.
pub const SDMA_POLL_RETRY_INFINITE: u32 = 0xFFF;
pub const SDMA_POLL_INTERVAL_DEFAULT: u32 = 0x04;
pub const SDMA_HDP_FLUSH_INTERVAL: u32 = 10;

pub const SDMA_TRAP_INT_CTX_MASK: u32 = 0x0FFF_FFFF;

// Header bit positions for opcode-specific fields.
const NOP_COUNT_SHIFT: u32 = 16;
const NOP_COUNT_MASK: u32 = 0x3FFF;
const FILL_SIZE_SHIFT: u32 = 30;
const ATOMIC_LOOP_BIT: u32 = 1 << 16;
const ATOMIC_OP_SHIFT: u32 = 25;
const POLL_HDP_FLUSH_BIT: u32 = 1 << 26;
const POLL_FUNC_SHIFT: u32 = 28;
const POLL_MEM_BIT: u32 = 1 << 31;
const RECT_ELEMENT_SHIFT: u32 = 29;

/// Rectangle limits of `COPY_LINEAR_RECT`, in elements.
pub const RECT_MAX_X: u32 = 1 << 14;
pub const RECT_MAX_Y: u32 = 1 << 14;
pub const RECT_MAX_Z: u32 = 1 << 11;
pub const RECT_MAX_PITCH: u32 = 1 << 19;
pub const RECT_MAX_SLICE_PITCH: u32 = 1 << 28;

#[inline]
pub const fn header(op: u32, sub_op: u32) -> u32 {
    (op & 0xFF) | ((sub_op & 0xFF) << 8)
}

#[inline]
pub const fn header_op(dw0: u32) -> u32 {
    dw0 & 0xFF
}

#[inline]
pub const fn header_sub_op(dw0: u32) -> u32 {
    (dw0 >> 8) & 0xFF
}

#[inline]
pub const fn lo32(v: u64) -> u32 {
    v as u32
}

#[inline]
pub const fn hi32(v: u64) -> u32 {
    (v >> 32) as u32
}

#[inline]
pub const fn join64(lo: u32, hi: u32) -> u64 {
    (hi as u64) << 32 | lo as u64
}

macro_rules! packet_sizes {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $ty {
                pub const SIZE_BYTES: usize = size_of::<$ty>();
                pub const SIZE_DWORDS: usize = size_of::<$ty>() / 4;
            }
        )*
    };
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SdmaPktCopyLinear {
    pub header: u32,
    pub count: u32,
    /// `dst_sw` in bits 17:16, `src_sw` in bits 25:24.
    pub parameter: u32,
    pub src_addr_lo: u32,
    pub src_addr_hi: u32,
    pub dst_addr_lo: u32,
    pub dst_addr_hi: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SdmaPktCopyLinearRect {
    pub header: u32,
    pub src_addr_lo: u32,
    pub src_addr_hi: u32,
    /// `src_offset_x` in 13:0, `src_offset_y` in 29:16.
    pub src_offset_xy: u32,
    /// `src_offset_z` in 10:0, `src_pitch - 1` in 31:13.
    pub src_offset_z_pitch: u32,
    pub src_slice_pitch: u32,
    pub dst_addr_lo: u32,
    pub dst_addr_hi: u32,
    pub dst_offset_xy: u32,
    pub dst_offset_z_pitch: u32,
    pub dst_slice_pitch: u32,
    /// `rect_x - 1` in 13:0, `rect_y - 1` in 29:16.
    pub rect_xy: u32,
    /// `rect_z - 1` in 10:0, `dst_sw` in 17:16, `src_sw` in 25:24.
    pub rect_z: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SdmaPktConstFill {
    pub header: u32,
    pub dst_addr_lo: u32,
    pub dst_addr_hi: u32,
    pub data: u32,
    pub count: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SdmaPktFence {
    pub header: u32,
    pub addr_lo: u32,
    pub addr_hi: u32,
    pub data: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SdmaPktTrap {
    pub header: u32,
    pub int_ctx: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SdmaPktPollRegmem {
    pub header: u32,
    pub addr_lo: u32,
    pub addr_hi: u32,
    pub value: u32,
    pub mask: u32,
    /// `interval` in 15:0, `retry_count` in 27:16.
    pub dw5: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SdmaPktAtomic {
    pub header: u32,
    pub addr_lo: u32,
    pub addr_hi: u32,
    pub src_data_lo: u32,
    pub src_data_hi: u32,
    pub cmp_data_lo: u32,
    pub cmp_data_hi: u32,
    pub loop_interval: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SdmaPktTimestamp {
    pub header: u32,
    pub addr_lo: u32,
    pub addr_hi: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SdmaPktGcr {
    pub header: u32,
    /// `base_va` bits 31:7 in place.
    pub word1: u32,
    /// `base_va` bits 47:32 in 15:0, `gcr_control[15:0]` in 31:16.
    pub word2: u32,
    /// `gcr_control[18:16]` in 2:0, `limit_va` bits 31:7 in place.
    pub word3: u32,
    /// `limit_va` bits 47:32 in 15:0, `vmid` in 27:24.
    pub word4: u32,
}

packet_sizes!(
    SdmaPktCopyLinear,
    SdmaPktCopyLinearRect,
    SdmaPktConstFill,
    SdmaPktFence,
    SdmaPktTrap,
    SdmaPktPollRegmem,
    SdmaPktAtomic,
    SdmaPktTimestamp,
    SdmaPktGcr,
);

/// An HDP flush is a `POLL_REGMEM` with the flush bit set.
pub const SDMA_HDP_FLUSH_SIZE_BYTES: usize = SdmaPktPollRegmem::SIZE_BYTES;
pub const SDMA_NOP_SIZE_BYTES: usize = 4;

const _: () = {
    assert!(SdmaPktCopyLinear::SIZE_BYTES == 28);
    assert!(SdmaPktCopyLinearRect::SIZE_BYTES == 52);
    assert!(SdmaPktConstFill::SIZE_BYTES == 20);
    assert!(SdmaPktFence::SIZE_BYTES == 16);
    assert!(SdmaPktTrap::SIZE_BYTES == 8);
    assert!(SdmaPktPollRegmem::SIZE_BYTES == 24);
    assert!(SdmaPktAtomic::SIZE_BYTES == 32);
    assert!(SdmaPktTimestamp::SIZE_BYTES == 12);
    assert!(SdmaPktGcr::SIZE_BYTES == 20);
};

/// Comparison applied by `POLL_REGMEM`: `(*addr & mask) <func> value`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollFunc {
    Always = 0,
    Less = 1,
    LessEqual = 2,
    Equal = 3,
    NotEqual = 4,
    GreaterEqual = 5,
    Greater = 6,
}

impl PollFunc {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Always),
            1 => Some(Self::Less),
            2 => Some(Self::LessEqual),
            3 => Some(Self::Equal),
            4 => Some(Self::NotEqual),
            5 => Some(Self::GreaterEqual),
            6 => Some(Self::Greater),
            _ => None,
        }
    }

    pub fn matches(self, observed: u32, reference: u32) -> bool {
        match self {
            Self::Always => true,
            Self::Less => observed < reference,
            Self::LessEqual => observed <= reference,
            Self::Equal => observed == reference,
            Self::NotEqual => observed != reference,
            Self::GreaterEqual => observed >= reference,
            Self::Greater => observed > reference,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollParams {
    pub addr: u64,
    pub reference: u32,
    pub mask: u32,
    pub func: PollFunc,
    pub interval: u32,
    pub retry_count: u32,
}

impl PollParams {
    /// Wait forever until the dword at `addr` equals `reference`.
    pub const fn until_equal(addr: u64, reference: u32) -> Self {
        Self {
            addr,
            reference,
            mask: u32::MAX,
            func: PollFunc::Equal,
            interval: SDMA_POLL_INTERVAL_DEFAULT,
            retry_count: SDMA_POLL_RETRY_INFINITE,
        }
    }
}

/// MMIO register offsets (in dwords) the engine uses to request an HDP flush
/// and to observe its completion, plus the per-engine reference mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HdpFlushRegisters {
    pub request: u32,
    pub done: u32,
    pub reference_mask: u32,
}

bitflags! {
    /// `gcr_control` field of the GCR packet (19 bits).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct GcrControl: u32 {
        const GLI_INV = 1 << 0;
        const GLM_WB = 1 << 4;
        const GLM_INV = 1 << 5;
        const GLK_WB = 1 << 6;
        const GLK_INV = 1 << 7;
        const GLV_INV = 1 << 8;
        const GL1_INV = 1 << 9;
        const GL2_US = 1 << 10;
        const GL2_DISCARD = 1 << 13;
        const GL2_INV = 1 << 14;
        const GL2_WB = 1 << 15;
        const SEQ_PARALLEL = 1 << 16;
        const SEQ_FORWARD = 1 << 17;
    }
}

impl GcrControl {
    /// Write back and invalidate every cache level so other agents observe
    /// the engine's writes.
    pub const fn full_invalidate() -> Self {
        Self::GLM_WB
            .union(Self::GLM_INV)
            .union(Self::GLK_INV)
            .union(Self::GLV_INV)
            .union(Self::GL1_INV)
            .union(Self::GL2_INV)
            .union(Self::GL2_WB)
    }
}

/// Highest virtual address a GCR range can name (48-bit VA, 128-byte granularity).
pub const GCR_LIMIT_VA_MAX: u64 = 0x0000_FFFF_FFFF_FF80;
const GCR_VA_LO_MASK: u32 = 0xFFFF_FF80;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

/// One `COPY_LINEAR_RECT` packet. Offsets, pitches and extents are in
/// elements of `1 << element_log2` bytes; pitches and extents are the real
/// values (the encoder applies the hardware's minus-one convention).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyRectPacket {
    pub element_log2: u32,
    pub src_addr: u64,
    pub src_offset: Dim3,
    pub src_pitch: u32,
    pub src_slice_pitch: u32,
    pub dst_addr: u64,
    pub dst_offset: Dim3,
    pub dst_pitch: u32,
    pub dst_slice_pitch: u32,
    pub rect: Dim3,
}

#[inline]
fn packet_slot<T: Pod>(dst: &mut [u32]) -> &mut T {
    let slot = &mut dst[..size_of::<T>() / 4];
    slot.fill(0);
    &mut bytemuck::cast_slice_mut::<u32, T>(slot)[0]
}

/// Extra dwords a NOP header says follow it.
pub fn nop_extra_dwords(dw0: u32) -> u32 {
    (dw0 >> NOP_COUNT_SHIFT) & NOP_COUNT_MASK
}

pub fn encode_copy_linear<G: SdmaGeneration>(
    dst: &mut [u32],
    dst_addr: u64,
    src_addr: u64,
    bytes: u32,
) -> usize {
    assert!(bytes > 0 && bytes <= G::MAX_SINGLE_COPY_BYTES);
    let pkt = packet_slot::<SdmaPktCopyLinear>(dst);
    pkt.header = header(SDMA_OP_COPY, SDMA_SUBOP_COPY_LINEAR);
    pkt.count = G::count_field(bytes);
    pkt.src_addr_lo = lo32(src_addr);
    pkt.src_addr_hi = hi32(src_addr);
    pkt.dst_addr_lo = lo32(dst_addr);
    pkt.dst_addr_hi = hi32(dst_addr);
    SdmaPktCopyLinear::SIZE_DWORDS
}

pub fn encode_copy_linear_rect(dst: &mut [u32], rect: &CopyRectPacket) -> usize {
    assert!(rect.element_log2 <= 4);
    assert!(rect.rect.x >= 1 && rect.rect.x <= RECT_MAX_X);
    assert!(rect.rect.y >= 1 && rect.rect.y <= RECT_MAX_Y);
    assert!(rect.rect.z >= 1 && rect.rect.z <= RECT_MAX_Z);
    assert!(rect.src_pitch >= 1 && rect.src_pitch <= RECT_MAX_PITCH);
    assert!(rect.dst_pitch >= 1 && rect.dst_pitch <= RECT_MAX_PITCH);
    assert!(rect.src_slice_pitch >= 1 && rect.src_slice_pitch <= RECT_MAX_SLICE_PITCH);
    assert!(rect.dst_slice_pitch >= 1 && rect.dst_slice_pitch <= RECT_MAX_SLICE_PITCH);

    let pkt = packet_slot::<SdmaPktCopyLinearRect>(dst);
    pkt.header = header(SDMA_OP_COPY, SDMA_SUBOP_COPY_LINEAR_RECT)
        | (rect.element_log2 << RECT_ELEMENT_SHIFT);
    pkt.src_addr_lo = lo32(rect.src_addr);
    pkt.src_addr_hi = hi32(rect.src_addr);
    pkt.src_offset_xy = pack_xy(rect.src_offset.x, rect.src_offset.y);
    pkt.src_offset_z_pitch = pack_z_pitch(rect.src_offset.z, rect.src_pitch);
    pkt.src_slice_pitch = (rect.src_slice_pitch - 1) & (RECT_MAX_SLICE_PITCH - 1);
    pkt.dst_addr_lo = lo32(rect.dst_addr);
    pkt.dst_addr_hi = hi32(rect.dst_addr);
    pkt.dst_offset_xy = pack_xy(rect.dst_offset.x, rect.dst_offset.y);
    pkt.dst_offset_z_pitch = pack_z_pitch(rect.dst_offset.z, rect.dst_pitch);
    pkt.dst_slice_pitch = (rect.dst_slice_pitch - 1) & (RECT_MAX_SLICE_PITCH - 1);
    pkt.rect_xy = pack_xy(rect.rect.x - 1, rect.rect.y - 1);
    pkt.rect_z = (rect.rect.z - 1) & (RECT_MAX_Z - 1);
    SdmaPktCopyLinearRect::SIZE_DWORDS
}

#[inline]
fn pack_xy(x: u32, y: u32) -> u32 {
    (x & (RECT_MAX_X - 1)) | ((y & (RECT_MAX_Y - 1)) << 16)
}

#[inline]
fn pack_z_pitch(z: u32, pitch: u32) -> u32 {
    (z & (RECT_MAX_Z - 1)) | (((pitch - 1) & (RECT_MAX_PITCH - 1)) << 13)
}

pub(crate) fn unpack_xy(v: u32) -> (u32, u32) {
    (v & (RECT_MAX_X - 1), (v >> 16) & (RECT_MAX_Y - 1))
}

pub(crate) fn unpack_z_pitch(v: u32) -> (u32, u32) {
    (v & (RECT_MAX_Z - 1), ((v >> 13) & (RECT_MAX_PITCH - 1)) + 1)
}

pub(crate) fn rect_element_log2(dw0: u32) -> u32 {
    dw0 >> RECT_ELEMENT_SHIFT
}

/// Fill `bytes` bytes at `dst_addr` with the 32-bit pattern `value`.
pub fn encode_const_fill<G: SdmaGeneration>(
    dst: &mut [u32],
    dst_addr: u64,
    value: u32,
    bytes: u32,
) -> usize {
    assert!(bytes > 0 && bytes <= G::MAX_SINGLE_FILL_BYTES && bytes % 4 == 0);
    let pkt = packet_slot::<SdmaPktConstFill>(dst);
    pkt.header =
        header(SDMA_OP_CONST_FILL, 0) | (SDMA_FILL_WIDTH_DWORD << FILL_SIZE_SHIFT);
    pkt.dst_addr_lo = lo32(dst_addr);
    pkt.dst_addr_hi = hi32(dst_addr);
    pkt.data = value;
    pkt.count = G::count_field(bytes);
    SdmaPktConstFill::SIZE_DWORDS
}

pub(crate) fn fill_width(dw0: u32) -> u32 {
    dw0 >> FILL_SIZE_SHIFT
}

pub fn encode_fence(dst: &mut [u32], addr: u64, value: u32) -> usize {
    let pkt = packet_slot::<SdmaPktFence>(dst);
    pkt.header = header(SDMA_OP_FENCE, 0);
    pkt.addr_lo = lo32(addr);
    pkt.addr_hi = hi32(addr);
    pkt.data = value;
    SdmaPktFence::SIZE_DWORDS
}

pub fn encode_trap(dst: &mut [u32], int_ctx: u32) -> usize {
    let pkt = packet_slot::<SdmaPktTrap>(dst);
    pkt.header = header(SDMA_OP_TRAP, 0);
    pkt.int_ctx = int_ctx & SDMA_TRAP_INT_CTX_MASK;
    SdmaPktTrap::SIZE_DWORDS
}

pub fn encode_poll_regmem(dst: &mut [u32], poll: &PollParams) -> usize {
    let pkt = packet_slot::<SdmaPktPollRegmem>(dst);
    pkt.header =
        header(SDMA_OP_POLL_REGMEM, 0) | ((poll.func as u32) << POLL_FUNC_SHIFT) | POLL_MEM_BIT;
    pkt.addr_lo = lo32(poll.addr);
    pkt.addr_hi = hi32(poll.addr);
    pkt.value = poll.reference;
    pkt.mask = poll.mask;
    pkt.dw5 = (poll.interval & 0xFFFF) | ((poll.retry_count & 0xFFF) << 16);
    SdmaPktPollRegmem::SIZE_DWORDS
}

/// Register-mode poll with the HDP flush bit: the engine writes the flush
/// request register and waits for the done register to match the mask.
pub fn encode_hdp_flush(dst: &mut [u32], regs: &HdpFlushRegisters) -> usize {
    let pkt = packet_slot::<SdmaPktPollRegmem>(dst);
    pkt.header = header(SDMA_OP_POLL_REGMEM, 0)
        | POLL_HDP_FLUSH_BIT
        | ((PollFunc::Equal as u32) << POLL_FUNC_SHIFT);
    pkt.addr_lo = regs.done << 2;
    pkt.addr_hi = regs.request << 2;
    pkt.value = regs.reference_mask;
    pkt.mask = regs.reference_mask;
    pkt.dw5 = SDMA_HDP_FLUSH_INTERVAL | (SDMA_POLL_RETRY_INFINITE << 16);
    SdmaPktPollRegmem::SIZE_DWORDS
}

pub(crate) fn poll_header_fields(dw0: u32) -> (bool, u32, bool) {
    (
        dw0 & POLL_HDP_FLUSH_BIT != 0,
        (dw0 >> POLL_FUNC_SHIFT) & 0x7,
        dw0 & POLL_MEM_BIT != 0,
    )
}

pub fn encode_atomic(dst: &mut [u32], addr: u64, op: u32, src: u64, cmp: u64) -> usize {
    let pkt = packet_slot::<SdmaPktAtomic>(dst);
    pkt.header = header(SDMA_OP_ATOMIC, 0) | ((op & 0x7F) << ATOMIC_OP_SHIFT);
    pkt.addr_lo = lo32(addr);
    pkt.addr_hi = hi32(addr);
    pkt.src_data_lo = lo32(src);
    pkt.src_data_hi = hi32(src);
    pkt.cmp_data_lo = lo32(cmp);
    pkt.cmp_data_hi = hi32(cmp);
    SdmaPktAtomic::SIZE_DWORDS
}

/// 64-bit add of all-ones: decrements the signal value at `addr` by one.
pub fn encode_atomic_decrement(dst: &mut [u32], addr: u64) -> usize {
    encode_atomic(dst, addr, SDMA_ATOMIC_ADD64, u64::MAX, 0)
}

pub(crate) fn atomic_header_fields(dw0: u32) -> (u32, bool) {
    (dw0 >> ATOMIC_OP_SHIFT, dw0 & ATOMIC_LOOP_BIT != 0)
}

/// Capture the engine's global timestamp counter into the 64-bit slot at `addr`.
pub fn encode_timestamp(dst: &mut [u32], addr: u64) -> usize {
    let pkt = packet_slot::<SdmaPktTimestamp>(dst);
    pkt.header = header(SDMA_OP_TIMESTAMP, SDMA_SUBOP_TIMESTAMP_GET_GLOBAL);
    pkt.addr_lo = lo32(addr);
    pkt.addr_hi = hi32(addr);
    SdmaPktTimestamp::SIZE_DWORDS
}

pub fn encode_gcr(dst: &mut [u32], base_va: u64, limit_va: u64, control: GcrControl) -> usize {
    let bits = control.bits();
    let pkt = packet_slot::<SdmaPktGcr>(dst);
    pkt.header = header(SDMA_OP_GCR, SDMA_SUBOP_USER_GCR);
    pkt.word1 = lo32(base_va) & GCR_VA_LO_MASK;
    pkt.word2 = (hi32(base_va) & 0xFFFF) | ((bits & 0xFFFF) << 16);
    pkt.word3 = ((bits >> 16) & 0x7) | (lo32(limit_va) & GCR_VA_LO_MASK);
    pkt.word4 = hi32(limit_va) & 0xFFFF;
    SdmaPktGcr::SIZE_DWORDS
}

pub(crate) fn gcr_fields(pkt: &SdmaPktGcr) -> (u64, u64, GcrControl) {
    let base = join64(pkt.word1 & GCR_VA_LO_MASK, pkt.word2 & 0xFFFF);
    let limit = join64(pkt.word3 & GCR_VA_LO_MASK, pkt.word4 & 0xFFFF);
    let bits = (pkt.word2 >> 16) | ((pkt.word3 & 0x7) << 16);
    (base, limit, GcrControl::from_bits_retain(bits))
}
