use core::marker::PhantomData;

use crate::generation::SdmaGeneration;
use crate::packets::*;

/// One decoded packet, fields already converted out of the hardware encoding
/// (counts are byte counts, pitches and extents are real values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdmaCommand {
    /// `dwords` covers the whole NOP, header included.
    Nop { dwords: u32 },
    CopyLinear { dst: u64, src: u64, bytes: u32 },
    CopyLinearRect(CopyRectPacket),
    ConstFill { dst: u64, value: u32, bytes: u32 },
    Fence { addr: u64, value: u32 },
    Trap { int_ctx: u32 },
    PollRegmem(PollParams),
    HdpFlush(HdpFlushRegisters),
    Atomic { addr: u64, op: u32, src: u64, cmp: u64, looped: bool },
    Timestamp { addr: u64 },
    Gcr { base: u64, limit: u64, control: GcrControl },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SdmaDecodeError {
    #[error("packet truncated: need {needed} dwords, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unknown opcode {op} (sub-op {sub_op})")]
    UnknownOpcode { op: u32, sub_op: u32 },
    #[error("unsupported fill width selector {0}")]
    BadFillWidth(u32),
    #[error("invalid poll function {0}")]
    BadPollFunc(u32),
    #[error("invalid rect element size log2 {0}")]
    BadElementSize(u32),
    #[error("zero-length transfer")]
    ZeroCount,
}

pub type Result<T> = core::result::Result<T, SdmaDecodeError>;

fn read_packet<T: bytemuck::Pod>(buf: &[u32]) -> Result<T> {
    let needed = core::mem::size_of::<T>() / 4;
    if buf.len() < needed {
        return Err(SdmaDecodeError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(bytemuck::pod_read_unaligned(bytemuck::cast_slice(&buf[..needed])))
}

/// Decode the packet at the start of `buf`. Returns the command and the
/// number of dwords it occupies.
pub fn decode_command<G: SdmaGeneration>(buf: &[u32]) -> Result<(SdmaCommand, usize)> {
    Decoder::<G>::new().decode(buf)
}

struct Decoder<G>(PhantomData<G>);

impl<G: SdmaGeneration> Decoder<G> {
    fn new() -> Self {
        Self(PhantomData)
    }

    fn decode(&self, buf: &[u32]) -> Result<(SdmaCommand, usize)> {
        let Some(&dw0) = buf.first() else {
            return Err(SdmaDecodeError::Truncated {
                needed: 1,
                available: 0,
            });
        };
        let op = header_op(dw0);
        let sub_op = header_sub_op(dw0);
        match (op, sub_op) {
            (SDMA_OP_NOP, _) => {
                let dwords = nop_extra_dwords(dw0) + 1;
                if buf.len() < dwords as usize {
                    return Err(SdmaDecodeError::Truncated {
                        needed: dwords as usize,
                        available: buf.len(),
                    });
                }
                Ok((SdmaCommand::Nop { dwords }, dwords as usize))
            }
            (SDMA_OP_COPY, SDMA_SUBOP_COPY_LINEAR) => {
                let pkt: SdmaPktCopyLinear = read_packet(buf)?;
                let bytes = G::bytes_from_count(pkt.count);
                if bytes == 0 {
                    return Err(SdmaDecodeError::ZeroCount);
                }
                Ok((
                    SdmaCommand::CopyLinear {
                        dst: join64(pkt.dst_addr_lo, pkt.dst_addr_hi),
                        src: join64(pkt.src_addr_lo, pkt.src_addr_hi),
                        bytes,
                    },
                    SdmaPktCopyLinear::SIZE_DWORDS,
                ))
            }
            (SDMA_OP_COPY, SDMA_SUBOP_COPY_LINEAR_RECT) => {
                let pkt: SdmaPktCopyLinearRect = read_packet(buf)?;
                Ok((
                    SdmaCommand::CopyLinearRect(self.rect(&pkt)?),
                    SdmaPktCopyLinearRect::SIZE_DWORDS,
                ))
            }
            (SDMA_OP_CONST_FILL, _) => {
                let pkt: SdmaPktConstFill = read_packet(buf)?;
                let width = fill_width(pkt.header);
                if width != SDMA_FILL_WIDTH_DWORD {
                    return Err(SdmaDecodeError::BadFillWidth(width));
                }
                let bytes = G::bytes_from_count(pkt.count);
                if bytes == 0 {
                    return Err(SdmaDecodeError::ZeroCount);
                }
                Ok((
                    SdmaCommand::ConstFill {
                        dst: join64(pkt.dst_addr_lo, pkt.dst_addr_hi),
                        value: pkt.data,
                        bytes,
                    },
                    SdmaPktConstFill::SIZE_DWORDS,
                ))
            }
            (SDMA_OP_FENCE, _) => {
                let pkt: SdmaPktFence = read_packet(buf)?;
                Ok((
                    SdmaCommand::Fence {
                        addr: join64(pkt.addr_lo, pkt.addr_hi),
                        value: pkt.data,
                    },
                    SdmaPktFence::SIZE_DWORDS,
                ))
            }
            (SDMA_OP_TRAP, _) => {
                let pkt: SdmaPktTrap = read_packet(buf)?;
                Ok((
                    SdmaCommand::Trap {
                        int_ctx: pkt.int_ctx & SDMA_TRAP_INT_CTX_MASK,
                    },
                    SdmaPktTrap::SIZE_DWORDS,
                ))
            }
            (SDMA_OP_POLL_REGMEM, _) => {
                let pkt: SdmaPktPollRegmem = read_packet(buf)?;
                let (hdp_flush, func, mem_poll) = poll_header_fields(pkt.header);
                let func = PollFunc::from_u32(func).ok_or(SdmaDecodeError::BadPollFunc(func))?;
                let cmd = if hdp_flush && !mem_poll {
                    SdmaCommand::HdpFlush(HdpFlushRegisters {
                        request: pkt.addr_hi >> 2,
                        done: pkt.addr_lo >> 2,
                        reference_mask: pkt.mask,
                    })
                } else {
                    SdmaCommand::PollRegmem(PollParams {
                        addr: join64(pkt.addr_lo, pkt.addr_hi),
                        reference: pkt.value,
                        mask: pkt.mask,
                        func,
                        interval: pkt.dw5 & 0xFFFF,
                        retry_count: (pkt.dw5 >> 16) & 0xFFF,
                    })
                };
                Ok((cmd, SdmaPktPollRegmem::SIZE_DWORDS))
            }
            (SDMA_OP_ATOMIC, _) => {
                let pkt: SdmaPktAtomic = read_packet(buf)?;
                let (op, looped) = atomic_header_fields(pkt.header);
                Ok((
                    SdmaCommand::Atomic {
                        addr: join64(pkt.addr_lo, pkt.addr_hi),
                        op,
                        src: join64(pkt.src_data_lo, pkt.src_data_hi),
                        cmp: join64(pkt.cmp_data_lo, pkt.cmp_data_hi),
                        looped,
                    },
                    SdmaPktAtomic::SIZE_DWORDS,
                ))
            }
            (SDMA_OP_TIMESTAMP, SDMA_SUBOP_TIMESTAMP_GET_GLOBAL) => {
                let pkt: SdmaPktTimestamp = read_packet(buf)?;
                Ok((
                    SdmaCommand::Timestamp {
                        addr: join64(pkt.addr_lo, pkt.addr_hi),
                    },
                    SdmaPktTimestamp::SIZE_DWORDS,
                ))
            }
            (SDMA_OP_GCR, SDMA_SUBOP_USER_GCR) if G::USE_GCR => {
                let pkt: SdmaPktGcr = read_packet(buf)?;
                let (base, limit, control) = gcr_fields(&pkt);
                Ok((
                    SdmaCommand::Gcr {
                        base,
                        limit,
                        control,
                    },
                    SdmaPktGcr::SIZE_DWORDS,
                ))
            }
            _ => Err(SdmaDecodeError::UnknownOpcode { op, sub_op }),
        }
    }

    fn rect(&self, pkt: &SdmaPktCopyLinearRect) -> Result<CopyRectPacket> {
        let element_log2 = rect_element_log2(pkt.header);
        if element_log2 > 4 {
            return Err(SdmaDecodeError::BadElementSize(element_log2));
        }
        let (sx, sy) = unpack_xy(pkt.src_offset_xy);
        let (sz, src_pitch) = unpack_z_pitch(pkt.src_offset_z_pitch);
        let (dx, dy) = unpack_xy(pkt.dst_offset_xy);
        let (dz, dst_pitch) = unpack_z_pitch(pkt.dst_offset_z_pitch);
        let (rx, ry) = unpack_xy(pkt.rect_xy);
        let rz = pkt.rect_z & (RECT_MAX_Z - 1);
        Ok(CopyRectPacket {
            element_log2,
            src_addr: join64(pkt.src_addr_lo, pkt.src_addr_hi),
            src_offset: Dim3::new(sx, sy, sz),
            src_pitch,
            src_slice_pitch: (pkt.src_slice_pitch & (RECT_MAX_SLICE_PITCH - 1)) + 1,
            dst_addr: join64(pkt.dst_addr_lo, pkt.dst_addr_hi),
            dst_offset: Dim3::new(dx, dy, dz),
            dst_pitch,
            dst_slice_pitch: (pkt.dst_slice_pitch & (RECT_MAX_SLICE_PITCH - 1)) + 1,
            rect: Dim3::new(rx + 1, ry + 1, rz + 1),
        })
    }
}
