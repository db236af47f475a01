//! Pool of 32-bit completion words for blocking submissions.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::memory::{HostRegion, MemoryAllocator, MemoryError, MemoryKind};
use crate::spin::Backoff;

/// One use of a pool slot: the engine's fence packet writes `sentinel` to
/// `address` when everything before it in the ring has executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceSlot {
    index: u32,
    pub address: u64,
    pub sentinel: u32,
}

pub struct FencePool {
    region: HostRegion,
    mask: u32,
    counter: AtomicU32,
}

impl FencePool {
    pub fn new(allocator: &dyn MemoryAllocator, slots: u32) -> Result<Self, MemoryError> {
        assert!(slots.is_power_of_two(), "fence pool size must be a power of two");
        let region = allocator.allocate(u64::from(slots) * 4, MemoryKind::Plain)?;
        Ok(Self {
            region,
            mask: slots - 1,
            counter: AtomicU32::new(0),
        })
    }

    pub fn region(&self) -> &HostRegion {
        &self.region
    }

    pub fn slots(&self) -> u32 {
        self.mask + 1
    }

    /// Pick the next slot round-robin and clear it. The sentinel is non-zero
    /// and differs from the slot's previous sentinels.
    ///
    /// A slot is reused after `slots()` further calls; callers must have
    /// observed its previous fence by then.
    pub fn obtain(&self) -> FenceSlot {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let index = seq & self.mask;
        let slot = FenceSlot {
            index,
            address: self.region.device_addr() + u64::from(index) * 4,
            sentinel: 0x8000_0000 | (seq & 0x7FFF_FFFF),
        };
        self.region.store_u32(self.offset(&slot), 0, Ordering::Release);
        slot
    }

    fn offset(&self, slot: &FenceSlot) -> u64 {
        assert!(slot.index <= self.mask, "fence slot {} outside pool", slot.index);
        u64::from(slot.index) * 4
    }

    pub fn is_signaled(&self, slot: &FenceSlot) -> bool {
        self.region.load_u32(self.offset(slot), Ordering::Acquire) == slot.sentinel
    }

    /// Spin until the engine has written the slot's sentinel.
    pub fn wait(&self, slot: &FenceSlot) {
        Backoff::spin_until(|| self.is_signaled(slot));
    }

    pub(crate) fn release(&self, allocator: &dyn MemoryAllocator) {
        allocator.free(&self.region);
    }
}
