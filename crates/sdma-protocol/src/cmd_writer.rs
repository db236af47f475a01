//! Packet builder for one submission.
//!
//! Packets are encoded one at a time into a small stack buffer and handed to
//! a [`PacketSink`]: a `Vec<u32>` for tests and offline streams, or a
//! reserved ring range on the submission path. The size helpers (`*_bytes`)
//! return exactly what the matching append method produces, saturating
//! instead of overflowing, so a caller can reject or reserve before encoding.

use core::marker::PhantomData;

use crate::generation::SdmaGeneration;
use crate::packets::*;

/// Largest packet the writer emits, in dwords.
const MAX_PACKET_DWORDS: usize = 16;

const _: () = {
    assert!(SdmaPktCopyLinearRect::SIZE_DWORDS <= MAX_PACKET_DWORDS);
    assert!(SdmaPktAtomic::SIZE_DWORDS <= MAX_PACKET_DWORDS);
    assert!(SdmaPktCopyLinear::SIZE_DWORDS <= MAX_PACKET_DWORDS);
};

/// Destination for encoded packets, in stream order.
pub trait PacketSink {
    fn push_dwords(&mut self, dwords: &[u32]);
}

impl PacketSink for Vec<u32> {
    fn push_dwords(&mut self, dwords: &[u32]) {
        self.extend_from_slice(dwords);
    }
}

#[derive(Debug, Clone)]
pub struct SdmaCmdWriter<G: SdmaGeneration, S: PacketSink = Vec<u32>> {
    sink: S,
    len_bytes: usize,
    _gen: PhantomData<G>,
}

impl<G: SdmaGeneration> Default for SdmaCmdWriter<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: SdmaGeneration> SdmaCmdWriter<G> {
    pub fn new() -> Self {
        Self::with_sink(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.sink.is_empty()
    }

    pub fn as_dwords(&self) -> &[u32] {
        &self.sink
    }
}

impl<G: SdmaGeneration, S: PacketSink> SdmaCmdWriter<G, S> {
    pub fn with_sink(sink: S) -> Self {
        Self {
            sink,
            len_bytes: 0,
            _gen: PhantomData,
        }
    }

    /// Bytes emitted so far.
    pub fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    fn emit(&mut self, dwords: usize, encode: impl FnOnce(&mut [u32]) -> usize) {
        let mut packet = [0u32; MAX_PACKET_DWORDS];
        let written = encode(&mut packet[..dwords]);
        debug_assert_eq!(written, dwords);
        self.sink.push_dwords(&packet[..dwords]);
        self.len_bytes += dwords * 4;
    }

    // Size calculators.

    pub fn copy_linear_bytes(size: u64) -> u64 {
        Self::split_bytes(size, G::MAX_SINGLE_COPY_BYTES, SdmaPktCopyLinear::SIZE_BYTES)
    }

    pub fn const_fill_bytes(size: u64) -> u64 {
        Self::split_bytes(size, G::MAX_SINGLE_FILL_BYTES, SdmaPktConstFill::SIZE_BYTES)
    }

    pub fn copy_rect_bytes(tiles: usize) -> u64 {
        (tiles as u64).saturating_mul(SdmaPktCopyLinearRect::SIZE_BYTES as u64)
    }

    /// Two 32-bit polls per 64-bit signal value.
    pub fn signal_wait_bytes(signals: usize) -> u64 {
        (signals as u64).saturating_mul(2 * SdmaPktPollRegmem::SIZE_BYTES as u64)
    }

    fn split_bytes(size: u64, max: u32, packet: usize) -> u64 {
        size.div_ceil(u64::from(max)).saturating_mul(packet as u64)
    }

    // Packet appenders.

    /// Linear copy of `size` bytes, split into as many packets as the
    /// generation's single-copy limit requires.
    pub fn copy_linear(&mut self, dst: u64, src: u64, size: u64) {
        let max = u64::from(G::MAX_SINGLE_COPY_BYTES);
        let mut done = 0u64;
        while done < size {
            let chunk = (size - done).min(max) as u32;
            self.emit(SdmaPktCopyLinear::SIZE_DWORDS, |slot| {
                encode_copy_linear::<G>(slot, dst + done, src + done, chunk)
            });
            done += u64::from(chunk);
        }
    }

    /// Fill `size` bytes (a multiple of four) with `value`.
    pub fn const_fill(&mut self, dst: u64, value: u32, size: u64) {
        assert_eq!(size % 4, 0, "fill size must be a dword multiple");
        let max = u64::from(G::MAX_SINGLE_FILL_BYTES);
        let mut done = 0u64;
        while done < size {
            let chunk = (size - done).min(max) as u32;
            self.emit(SdmaPktConstFill::SIZE_DWORDS, |slot| {
                encode_const_fill::<G>(slot, dst + done, value, chunk)
            });
            done += u64::from(chunk);
        }
    }

    pub fn copy_rect(&mut self, rect: &CopyRectPacket) {
        self.emit(SdmaPktCopyLinearRect::SIZE_DWORDS, |slot| {
            encode_copy_linear_rect(slot, rect)
        });
    }

    pub fn fence(&mut self, addr: u64, value: u32) {
        self.emit(SdmaPktFence::SIZE_DWORDS, |slot| encode_fence(slot, addr, value));
    }

    pub fn trap(&mut self, int_ctx: u32) {
        self.emit(SdmaPktTrap::SIZE_DWORDS, |slot| encode_trap(slot, int_ctx));
    }

    pub fn poll_regmem(&mut self, poll: &PollParams) {
        self.emit(SdmaPktPollRegmem::SIZE_DWORDS, |slot| encode_poll_regmem(slot, poll));
    }

    /// Block until the 64-bit value at `addr` reads zero: low half first,
    /// then high half.
    pub fn wait_signal_zero(&mut self, addr: u64) {
        self.poll_regmem(&PollParams::until_equal(addr, 0));
        self.poll_regmem(&PollParams::until_equal(addr + 4, 0));
    }

    pub fn hdp_flush(&mut self, regs: &HdpFlushRegisters) {
        self.emit(SdmaPktPollRegmem::SIZE_DWORDS, |slot| encode_hdp_flush(slot, regs));
    }

    pub fn atomic_decrement(&mut self, addr: u64) {
        self.emit(SdmaPktAtomic::SIZE_DWORDS, |slot| encode_atomic_decrement(slot, addr));
    }

    pub fn timestamp(&mut self, addr: u64) {
        self.emit(SdmaPktTimestamp::SIZE_DWORDS, |slot| encode_timestamp(slot, addr));
    }

    pub fn gcr(&mut self, base_va: u64, limit_va: u64, control: GcrControl) {
        self.emit(SdmaPktGcr::SIZE_DWORDS, |slot| {
            encode_gcr(slot, base_va, limit_va, control)
        });
    }
}
