//! Deterministic software stand-in for an SDMA engine.
//!
//! [`SimulatedSdma`] implements [`sdma_blit::QueueDriver`]. Every queue it
//! binds gets a worker thread that watches the doorbell, decodes packets at
//! the read pointer and executes them against the shared
//! [`sdma_blit::AddressSpace`]:
//!
//! - copies, rect copies and fills move real bytes
//! - fences and the 64-bit add atomic update memory with release ordering
//! - polls leave the read pointer on the poll packet until satisfied
//! - timestamps come from a counter that ticks once per executed packet
//! - HDP flushes and GCR invalidates are accepted and counted
//! - traps are logged per queue
//!
//! A packet that fails to decode (or touches unmapped memory) faults the
//! queue: it stops consuming and the fault is reported through
//! [`SimulatedSdma::fault`].

#![forbid(unsafe_code)]

mod driver;
mod engine;

pub use driver::SimulatedSdma;
pub use engine::{QueueStats, SimFault};
