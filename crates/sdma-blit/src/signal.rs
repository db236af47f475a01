//! Completion signals.
//!
//! A signal is a 64-bit value in device-visible memory. Asynchronous copies
//! poll dependency signals until they read zero and decrement their
//! completion signal when done.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::memory::{HostRegion, MemoryAllocator, MemoryError, MemoryKind};
use crate::spin::Backoff;

/// Where to post an interrupt-backed completion: the engine writes
/// `event_id` to `addr` and then raises a trap carrying the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMailbox {
    pub addr: u64,
    pub event_id: u32,
}

/// 64-bit slots receiving the engine's global timestamp at the start and end
/// of a profiled copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilingSlots {
    pub start: u64,
    pub end: u64,
}

pub trait Signal: Send + Sync {
    /// Device address of the 64-bit signal value.
    fn value_location(&self) -> u64;

    fn load_relaxed(&self) -> i64;

    fn event_mailbox(&self) -> Option<EventMailbox> {
        None
    }

    fn profiling_slots(&self) -> Option<ProfilingSlots> {
        None
    }
}

const VALUE_OFFSET: u64 = 0;
const START_TS_OFFSET: u64 = 8;
const END_TS_OFFSET: u64 = 16;
const MAILBOX_OFFSET: u64 = 24;
const SIGNAL_BYTES: u64 = 32;

/// Signal backed by an allocator region: `[value, start_ts, end_ts, mailbox]`.
pub struct MemorySignal {
    region: HostRegion,
    allocator: Arc<dyn MemoryAllocator>,
    event_id: Option<u32>,
}

impl MemorySignal {
    pub fn new(allocator: Arc<dyn MemoryAllocator>, initial: i64) -> Result<Self, MemoryError> {
        let region = allocator.allocate(SIGNAL_BYTES, MemoryKind::Plain)?;
        region.store_u64(VALUE_OFFSET, initial as u64, Ordering::Release);
        Ok(Self {
            region,
            allocator,
            event_id: None,
        })
    }

    /// Attach an interrupt mailbox; completions also post `event_id`.
    pub fn with_event(mut self, event_id: u32) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn store_release(&self, value: i64) {
        self.region
            .store_u64(VALUE_OFFSET, value as u64, Ordering::Release);
    }

    pub fn load_acquire(&self) -> i64 {
        self.region.load_u64(VALUE_OFFSET, Ordering::Acquire) as i64
    }

    /// Spin until the value equals `expected`.
    pub fn wait_eq(&self, expected: i64) {
        Backoff::spin_until(|| self.load_acquire() == expected);
    }

    /// Last value the engine posted to the mailbox (zero if none).
    pub fn mailbox_value(&self) -> u32 {
        self.region.load_u32(MAILBOX_OFFSET, Ordering::Acquire)
    }

    pub fn start_timestamp(&self) -> u64 {
        self.region.load_u64(START_TS_OFFSET, Ordering::Acquire)
    }

    pub fn end_timestamp(&self) -> u64 {
        self.region.load_u64(END_TS_OFFSET, Ordering::Acquire)
    }
}

impl Signal for MemorySignal {
    fn value_location(&self) -> u64 {
        self.region.device_addr() + VALUE_OFFSET
    }

    fn load_relaxed(&self) -> i64 {
        self.region.load_u64(VALUE_OFFSET, Ordering::Relaxed) as i64
    }

    fn event_mailbox(&self) -> Option<EventMailbox> {
        self.event_id.map(|event_id| EventMailbox {
            addr: self.region.device_addr() + MAILBOX_OFFSET,
            event_id,
        })
    }

    fn profiling_slots(&self) -> Option<ProfilingSlots> {
        let base = self.region.device_addr();
        Some(ProfilingSlots {
            start: base + START_TS_OFFSET,
            end: base + END_TS_OFFSET,
        })
    }
}

impl Drop for MemorySignal {
    fn drop(&mut self) {
        self.allocator.free(&self.region);
    }
}
