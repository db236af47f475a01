//! Lock-free multi-producer reservation over the engine's command ring.
//!
//! Producers claim byte ranges by advancing `reserved` with a CAS, write their
//! packets into the claimed range, then publish through the commit sequencer
//! (see `commit.rs`), which advances `committed` strictly in reservation
//! order.
//!
//! Indices are 64-bit monotonic byte counts in software for every
//! generation. The generation decides only what the hardware sees in its
//! write pointer ([`SdmaGeneration::hw_index`]) and how its read pointer maps
//! back to a monotonic index.
//!
//! Invariants:
//! - `committed <= reserved`
//! - `reserved - read_index < ring_size`: one dword always stays free so a
//!   full ring is distinguishable from an empty one
//! - no packet straddles the physical end of the ring; the tail is padded
//!   with NOPs instead

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use sdma_protocol::{PacketSink, SdmaCmdWriter, SdmaGeneration};

use crate::error::{BlitError, Result};
use crate::memory::HostRegion;
use crate::pending::PendingBytesLog;
use crate::queue::QueueResource;
use crate::spin::Backoff;

/// Bytes that always stay free.
pub const RING_MARGIN: u64 = 4;

/// Exclusive claim on `[start, start + len)` of the ring. Must be handed to
/// [`CommandRing::publish`]; a dropped reservation stalls every later
/// producer.
#[must_use = "a reservation must be published or the ring stalls"]
#[derive(Debug, PartialEq, Eq)]
pub struct Reservation {
    start: u64,
    len: u64,
}

impl Reservation {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn into_parts(self) -> (u64, u64) {
        (self.start, self.len)
    }
}

/// Writer that encodes straight into a ring reservation.
pub type RingWriter<'a, G> = SdmaCmdWriter<G, RingSink<'a>>;

/// Packet sink over one reserved range of the ring.
pub struct RingSink<'a> {
    region: &'a HostRegion,
    offset: u64,
    end: u64,
}

impl PacketSink for RingSink<'_> {
    fn push_dwords(&mut self, dwords: &[u32]) {
        let len = dwords.len() as u64 * 4;
        assert!(self.offset + len <= self.end, "packet overruns its reservation");
        self.region.write_dwords(self.offset, dwords);
        self.offset += len;
    }
}

pub struct CommandRing<G: SdmaGeneration> {
    pub(crate) region: HostRegion,
    pub(crate) size: u64,
    pub(crate) queue: QueueResource,
    pub(crate) reserved: AtomicU64,
    pub(crate) committed: AtomicU64,
    pub(crate) wait_idle: bool,
    pub(crate) pending: PendingBytesLog,
    _gen: PhantomData<G>,
}

impl<G: SdmaGeneration> CommandRing<G> {
    pub fn new(region: HostRegion, queue: QueueResource, wait_idle: bool) -> Self {
        let size = region.len();
        assert!(size.is_power_of_two() && size > RING_MARGIN);
        Self {
            pending: PendingBytesLog::new(PendingBytesLog::capacity_for_ring(size)),
            region,
            size,
            queue,
            reserved: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            wait_idle,
            _gen: PhantomData,
        }
    }

    /// Start both indices at `index`, as if that many bytes had already been
    /// submitted and drained. The hardware pointers must agree.
    #[cfg(test)]
    pub(crate) fn with_start_index(self, index: u64) -> Self {
        self.reserved.store(index, Ordering::Relaxed);
        self.committed.store(index, Ordering::Relaxed);
        self
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn region(&self) -> &HostRegion {
        &self.region
    }

    pub fn queue(&self) -> &QueueResource {
        &self.queue
    }

    pub fn reserved_index(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }

    pub fn committed_index(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    /// Largest single reservation the ring can ever satisfy.
    pub fn max_reservation(&self) -> u64 {
        self.size - RING_MARGIN
    }

    /// The engine's read position as a monotonic index.
    pub fn read_index(&self) -> u64 {
        if G::HW_INDEX_MONOTONIC {
            return self.queue.read_ptr.load(Ordering::Acquire);
        }
        // The read pointer only ever trails the committed index, so sample it
        // first; the distance back from a later commit snapshot is then exact.
        let rptr = self.queue.read_ptr.load(Ordering::Acquire) % self.size;
        let commit = self.committed.load(Ordering::Acquire);
        let behind = (commit % self.size + self.size - rptr) % self.size;
        commit - behind
    }

    /// Fail with `OutOfResources` if `len` bytes could never be reserved at
    /// once, however far the engine drains.
    pub fn check_capacity(&self, len: u64) -> Result<()> {
        let capacity = self.max_reservation();
        if len > capacity {
            return Err(BlitError::OutOfResources {
                requested: len,
                capacity,
            });
        }
        Ok(())
    }

    /// Claim `len` contiguous bytes (a non-zero dword multiple). Spins while
    /// the engine has not drained enough of the ring; fails immediately if
    /// `len` could never fit.
    pub fn reserve(&self, len: u64) -> Result<Reservation> {
        self.check_capacity(len)?;
        assert!(len > 0 && len % 4 == 0, "ring reservations are whole dwords");

        let mut backoff = Backoff::new();
        loop {
            let start = self.reserved.load(Ordering::Acquire);
            let offset = start % self.size;
            if offset + len > self.size {
                if !self.pad_to_end(start, self.size - offset) {
                    backoff.snooze();
                }
                continue;
            }

            let end = start + len;
            if end - self.read_index() >= self.size {
                backoff.snooze();
                continue;
            }

            if self
                .reserved
                .compare_exchange(start, end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(Reservation { start, len });
            }
        }
    }

    /// Claim the `pad` bytes from `start` to the physical end of the ring,
    /// fill them with NOPs and publish them. Returns `false` if the engine
    /// has not drained enough yet or another producer moved `reserved` first.
    fn pad_to_end(&self, start: u64, pad: u64) -> bool {
        let end = start + pad;
        if end - self.read_index() >= self.size {
            return false;
        }
        if self
            .reserved
            .compare_exchange(start, end, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Someone else won the race (and is padding, or reserved past us).
            return true;
        }
        let offset = start % self.size;
        self.region.fill_u32(offset, 0, pad);
        tracing::trace!(start, pad, "padded ring tail with NOPs");
        self.publish(Reservation { start, len: pad }, 0);
        true
    }

    /// Encode a packet stream straight into `res`. The stream must fill the
    /// reservation exactly.
    pub fn write_packets(
        &self,
        res: &Reservation,
        encode: impl FnOnce(&mut RingWriter<'_, G>),
    ) {
        let offset = res.start % self.size;
        debug_assert!(offset + res.len <= self.size);
        let mut w = SdmaCmdWriter::<G, _>::with_sink(RingSink {
            region: &self.region,
            offset,
            end: offset + res.len,
        });
        encode(&mut w);
        assert_eq!(
            w.len_bytes() as u64,
            res.len,
            "packet stream does not match its reservation"
        );
    }

    /// Engine-side view of the dword at ring offset `offset`.
    pub fn load_dword(&self, offset: u64) -> u32 {
        self.region.load_u32(offset % self.size, Ordering::Acquire)
    }
}
