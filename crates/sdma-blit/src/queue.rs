//! Driver binding of a ring buffer to a hardware queue.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::memory::HostRegion;

/// A hardware-visible 64-bit register or memory word (read pointer, write
/// pointer, doorbell). Clones alias the same location.
#[derive(Clone, Default)]
pub struct HwRegister(Arc<AtomicU64>);

impl HwRegister {
    pub fn new(value: u64) -> Self {
        Self(Arc::new(AtomicU64::new(value)))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> u64 {
        self.0.load(order)
    }

    #[inline]
    pub fn store(&self, value: u64, order: Ordering) {
        self.0.store(value, order)
    }
}

impl fmt::Debug for HwRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HwRegister({:#x})", self.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub u32);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// What the driver hands back when it binds a ring: the read pointer is
/// written only by the engine, write pointer and doorbell only by the
/// submitting side.
#[derive(Debug, Clone)]
pub struct QueueResource {
    pub queue_id: QueueId,
    pub read_ptr: HwRegister,
    pub write_ptr: HwRegister,
    pub doorbell: HwRegister,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueKind {
    /// Any SDMA engine the driver picks.
    #[default]
    Sdma,
    /// An engine attached to the inter-device (XGMI) fabric.
    SdmaXgmi,
    /// A specific engine instance.
    SdmaByEngineId(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueuePriority(u8);

impl QueuePriority {
    pub const MIN: QueuePriority = QueuePriority(0);
    pub const NORMAL: QueuePriority = QueuePriority(7);
    pub const MAX: QueuePriority = QueuePriority(15);

    pub const fn new(value: u8) -> Option<Self> {
        if value <= Self::MAX.0 {
            Some(Self(value))
        } else {
            None
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl Default for QueuePriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("failed to create ring queue on node {node}: {reason}")]
    CreateFailed { node: u32, reason: String },
    #[error("failed to destroy queue {queue_id}: {reason}")]
    DestroyFailed { queue_id: QueueId, reason: String },
    #[error("unknown queue {0}")]
    UnknownQueue(QueueId),
    #[error("ring of {size} bytes at {addr:#x} cannot be bound")]
    InvalidRing { addr: u64, size: u64 },
}

/// Kernel-driver entry points used by the engine, exactly once each per
/// engine lifetime.
pub trait QueueDriver: Send + Sync {
    fn create_ring_queue(
        &self,
        node: u32,
        kind: QueueKind,
        priority: QueuePriority,
        ring: &HostRegion,
    ) -> Result<QueueResource, DriverError>;

    fn destroy_ring_queue(&self, queue_id: QueueId) -> Result<(), DriverError>;
}
