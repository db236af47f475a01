//! Per-queue packet execution.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sdma_blit::{AddressSpace, HostRegion, MemoryError, QueueId, QueueResource};
use sdma_protocol::packets::{SDMA_ATOMIC_ADD64, SDMA_POLL_RETRY_INFINITE};
use sdma_protocol::{decode_command, CopyRectPacket, SdmaCommand, SdmaDecodeError, SdmaGeneration};
use thiserror::Error;
use tracing::{error, trace};

/// Why a queue stopped consuming its ring.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SimFault {
    #[error("malformed packet at ring index {index}: {source}")]
    Decode {
        index: u64,
        #[source]
        source: SdmaDecodeError,
    },
    #[error("memory fault at ring index {index}: {source}")]
    Memory {
        index: u64,
        #[source]
        source: MemoryError,
    },
    #[error("unsupported atomic op {op} at ring index {index}")]
    UnsupportedAtomic { index: u64, op: u32 },
}

/// Counters for one simulated queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Engine read position as a monotonic byte index.
    pub read_index: u64,
    pub packets: u64,
    pub nops: u64,
    pub copies: u64,
    pub rect_copies: u64,
    pub fills: u64,
    pub bytes_moved: u64,
    pub fences: u64,
    pub atomics: u64,
    pub timestamps: u64,
    pub hdp_flushes: u64,
    pub cache_invalidates: u64,
    pub traps: u64,
    /// Times an unsatisfied poll was re-evaluated.
    pub poll_retries: u64,
    pub doorbells: u64,
}

pub(crate) struct QueueState {
    pub(crate) id: QueueId,
    pub(crate) ring: HostRegion,
    pub(crate) regs: QueueResource,
    pub(crate) stop: AtomicBool,
    pub(crate) stats: Mutex<QueueStats>,
    pub(crate) traps: Mutex<Vec<u32>>,
    pub(crate) fault: Mutex<Option<SimFault>>,
}

impl QueueState {
    pub(crate) fn new(id: QueueId, ring: HostRegion, regs: QueueResource) -> Self {
        Self {
            id,
            ring,
            regs,
            stop: AtomicBool::new(false),
            stats: Mutex::new(QueueStats::default()),
            traps: Mutex::new(Vec::new()),
            fault: Mutex::new(None),
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut QueueStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }

    pub(crate) fn snapshot(&self) -> QueueStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn fault(&self) -> Option<SimFault> {
        self.fault.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn traps(&self) -> Vec<u32> {
        self.traps.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Controls shared by every queue of one simulator.
pub(crate) struct EngineShared {
    pub(crate) space: Arc<AddressSpace>,
    pub(crate) paused: AtomicBool,
    pub(crate) clock: AtomicU64,
}

enum Step {
    Advance,
    Retry,
}

// Largest packet the generation can emit, in dwords.
const MAX_FETCH_DWORDS: usize = 16;
const IDLE_SPINS: u32 = 64;
const IDLE_SLEEP: Duration = Duration::from_micros(50);

pub(crate) struct Worker<G: SdmaGeneration> {
    queue: Arc<QueueState>,
    shared: Arc<EngineShared>,
    size: u64,
    read: u64,
    last_doorbell: u64,
    poll_attempts: u32,
    _gen: PhantomData<G>,
}

impl<G: SdmaGeneration> Worker<G> {
    pub(crate) fn new(queue: Arc<QueueState>, shared: Arc<EngineShared>) -> Self {
        let size = queue.ring.len();
        Self {
            queue,
            shared,
            size,
            read: 0,
            last_doorbell: 0,
            poll_attempts: 0,
            _gen: PhantomData,
        }
    }

    /// The engine's view of the write pointer, as a monotonic index.
    fn write_index(&mut self) -> u64 {
        let doorbell = self.queue.regs.doorbell.load(Ordering::Acquire);
        if doorbell != self.last_doorbell {
            self.last_doorbell = doorbell;
            self.queue.update_stats(|s| s.doorbells += 1);
        }
        let wptr = self.queue.regs.write_ptr.load(Ordering::Acquire);
        if G::HW_INDEX_MONOTONIC {
            wptr
        } else {
            let ahead = (wptr % self.size + self.size - self.read % self.size) % self.size;
            self.read + ahead
        }
    }

    pub(crate) fn run(mut self) {
        let mut idle = 0u32;
        while !self.queue.stop.load(Ordering::Acquire) {
            let busy = !self.shared.paused.load(Ordering::Acquire)
                && self.queue.fault().is_none()
                && self.step_once();
            if busy {
                idle = 0;
            } else if idle < IDLE_SPINS {
                idle += 1;
                thread::yield_now();
            } else {
                thread::sleep(IDLE_SLEEP);
            }
        }
    }

    /// Execute at most one packet. Returns whether the read pointer moved.
    fn step_once(&mut self) -> bool {
        let write = self.write_index();
        if write == self.read {
            return false;
        }
        let offset = self.read % self.size;
        let avail = ((write - self.read).min(self.size - offset) / 4) as usize;

        let (cmd, dwords) = match self.fetch(offset, avail) {
            Ok(decoded) => decoded,
            Err(source) => {
                self.raise(SimFault::Decode {
                    index: self.read,
                    source,
                });
                return false;
            }
        };

        match self.execute(&cmd) {
            Ok(Step::Advance) => {
                self.poll_attempts = 0;
                self.shared.clock.fetch_add(1, Ordering::Relaxed);
                self.read += dwords as u64 * 4;
                self.queue
                    .regs
                    .read_ptr
                    .store(G::hw_index(self.read, self.size), Ordering::Release);
                let read = self.read;
                self.queue.update_stats(|s| {
                    s.packets += 1;
                    s.read_index = read;
                });
                trace!(queue = %self.queue.id, ?cmd, read, "executed packet");
                true
            }
            Ok(Step::Retry) => {
                self.queue.update_stats(|s| s.poll_retries += 1);
                false
            }
            Err(fault) => {
                self.raise(fault);
                false
            }
        }
    }

    fn fetch(&self, offset: u64, avail: usize) -> Result<(SdmaCommand, usize), SdmaDecodeError> {
        let mut buf = vec![0u32; avail.min(MAX_FETCH_DWORDS)];
        self.queue.ring.read_dwords(offset, &mut buf);
        match decode_command::<G>(&buf) {
            Err(SdmaDecodeError::Truncated { needed, .. }) if needed <= avail && needed > buf.len() => {
                buf.resize(needed, 0);
                self.queue.ring.read_dwords(offset, &mut buf);
                decode_command::<G>(&buf)
            }
            other => other,
        }
    }

    fn raise(&self, fault: SimFault) {
        error!(queue = %self.queue.id, %fault, "SDMA queue faulted; consumption stopped");
        *self.queue.fault.lock().unwrap_or_else(|e| e.into_inner()) = Some(fault);
    }

    fn mem_fault(&self, source: MemoryError) -> SimFault {
        SimFault::Memory {
            index: self.read,
            source,
        }
    }

    fn execute(&mut self, cmd: &SdmaCommand) -> Result<Step, SimFault> {
        let space = &self.shared.space;
        match *cmd {
            SdmaCommand::Nop { .. } => {
                self.queue.update_stats(|s| s.nops += 1);
            }
            SdmaCommand::CopyLinear { dst, src, bytes } => {
                let mut data = vec![0u8; bytes as usize];
                space.read_bytes(src, &mut data).map_err(|e| self.mem_fault(e))?;
                space.write_bytes(dst, &data).map_err(|e| self.mem_fault(e))?;
                self.queue.update_stats(|s| {
                    s.copies += 1;
                    s.bytes_moved += u64::from(bytes);
                });
            }
            SdmaCommand::CopyLinearRect(ref rect) => {
                let moved = self.copy_rect(rect)?;
                self.queue.update_stats(|s| {
                    s.rect_copies += 1;
                    s.bytes_moved += moved;
                });
            }
            SdmaCommand::ConstFill { dst, value, bytes } => {
                space
                    .fill_u32(dst, value, u64::from(bytes))
                    .map_err(|e| self.mem_fault(e))?;
                self.queue.update_stats(|s| {
                    s.fills += 1;
                    s.bytes_moved += u64::from(bytes);
                });
            }
            SdmaCommand::Fence { addr, value } => {
                space
                    .store_u32(addr, value, Ordering::Release)
                    .map_err(|e| self.mem_fault(e))?;
                self.queue.update_stats(|s| s.fences += 1);
            }
            SdmaCommand::Trap { int_ctx } => {
                self.queue
                    .traps
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(int_ctx);
                self.queue.update_stats(|s| s.traps += 1);
            }
            SdmaCommand::PollRegmem(poll) => {
                let observed = space
                    .load_u32(poll.addr, Ordering::Acquire)
                    .map_err(|e| self.mem_fault(e))?;
                if !poll.func.matches(observed & poll.mask, poll.reference) {
                    let exhausted = poll.retry_count != SDMA_POLL_RETRY_INFINITE
                        && self.poll_attempts >= poll.retry_count;
                    if !exhausted {
                        self.poll_attempts += 1;
                        return Ok(Step::Retry);
                    }
                }
            }
            SdmaCommand::HdpFlush(_) => {
                self.queue.update_stats(|s| s.hdp_flushes += 1);
            }
            SdmaCommand::Atomic { addr, op, src, .. } => {
                if op != SDMA_ATOMIC_ADD64 {
                    return Err(SimFault::UnsupportedAtomic {
                        index: self.read,
                        op,
                    });
                }
                space
                    .fetch_add_u64(addr, src, Ordering::AcqRel)
                    .map_err(|e| self.mem_fault(e))?;
                self.queue.update_stats(|s| s.atomics += 1);
            }
            SdmaCommand::Timestamp { addr } => {
                let now = self.shared.clock.fetch_add(1, Ordering::Relaxed) + 1;
                space
                    .store_u64(addr, now, Ordering::Release)
                    .map_err(|e| self.mem_fault(e))?;
                self.queue.update_stats(|s| s.timestamps += 1);
            }
            SdmaCommand::Gcr { .. } => {
                self.queue.update_stats(|s| s.cache_invalidates += 1);
            }
        }
        Ok(Step::Advance)
    }

    fn copy_rect(&self, rect: &CopyRectPacket) -> Result<u64, SimFault> {
        let space = &self.shared.space;
        let elem = 1u64 << rect.element_log2;
        let row_bytes = u64::from(rect.rect.x) * elem;
        let mut row = vec![0u8; row_bytes as usize];
        for z in 0..u64::from(rect.rect.z) {
            for y in 0..u64::from(rect.rect.y) {
                let src = rect.src_addr
                    + elem
                        * ((u64::from(rect.src_offset.z) + z) * u64::from(rect.src_slice_pitch)
                            + (u64::from(rect.src_offset.y) + y) * u64::from(rect.src_pitch)
                            + u64::from(rect.src_offset.x));
                let dst = rect.dst_addr
                    + elem
                        * ((u64::from(rect.dst_offset.z) + z) * u64::from(rect.dst_slice_pitch)
                            + (u64::from(rect.dst_offset.y) + y) * u64::from(rect.dst_pitch)
                            + u64::from(rect.dst_offset.x));
                space.read_bytes(src, &mut row).map_err(|e| self.mem_fault(e))?;
                space.write_bytes(dst, &row).map_err(|e| self.mem_fault(e))?;
            }
        }
        Ok(row_bytes * u64::from(rect.rect.y) * u64::from(rect.rect.z))
    }
}
