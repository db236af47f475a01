//! User-mode submission to an SDMA copy engine.
//!
//! An [`SdmaBlit`] owns one hardware queue: a command ring in host memory that
//! the engine consumes, plus the read pointer, write pointer and doorbell the
//! driver bound to it. Any number of threads may submit concurrently:
//!
//! - [`CommandRing::reserve`] hands out exclusive byte ranges with a lock-free
//!   CAS loop, padding the ring tail with NOPs so no packet wraps.
//! - [`CommandRing::publish`] makes ranges visible to the engine strictly in
//!   reservation order (write pointer, fence, doorbell).
//! - Blocking submissions finish with a fence packet into a [`FencePool`]
//!   word and spin until it lands; asynchronous ones gate on dependency
//!   signals and decrement a completion [`Signal`].
//!
//! The hardware generation is a type parameter (see
//! [`sdma_protocol::SdmaGeneration`]), so every generation shares one
//! implementation with no runtime dispatch on the submission path.
//!
//! The memory, driver and signal collaborators are traits so the engine can
//! be exercised against the software engine in `sdma-sim`.

#![forbid(unsafe_code)]

mod blit;
mod commit;
pub mod config;
mod error;
pub mod fence;
pub mod memory;
pub mod pending;
pub mod queue;
pub mod ring;
pub mod signal;
mod spin;

pub use blit::SdmaBlit;
pub use config::{BlitConfig, ConfigError, CopyDirection};
pub use error::{BlitError, Result};
pub use fence::{FencePool, FenceSlot};
pub use memory::{AddressSpace, HostRegion, MemoryAllocator, MemoryError, MemoryKind, SystemAllocator};
pub use pending::PendingBytesLog;
pub use queue::{DriverError, HwRegister, QueueDriver, QueueId, QueueKind, QueuePriority, QueueResource};
pub use ring::{CommandRing, Reservation, RingSink, RingWriter};
pub use signal::{EventMailbox, MemorySignal, ProfilingSlots, Signal};

pub use sdma_protocol::{Dim3, PitchedSurface, RectCopy, SdmaGeneration, SdmaV2, SdmaV4, SdmaV5};
