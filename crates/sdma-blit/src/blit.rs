//! Submission front end: turns copy/fill requests into packet streams,
//! reserves ring space for them, publishes them and (for blocking calls)
//! waits for the engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sdma_protocol::packets::{
    hi32, lo32, SdmaPktAtomic, SdmaPktFence, SdmaPktGcr, SdmaPktTimestamp, SdmaPktTrap,
    GCR_LIMIT_VA_MAX, SDMA_HDP_FLUSH_SIZE_BYTES,
};
use sdma_protocol::{GcrControl, PacketSink, RectCopy, SdmaCmdWriter, SdmaGeneration};
use tracing::{debug, error, trace, warn};

use crate::config::BlitConfig;
use crate::error::{BlitError, Result};
use crate::fence::{FencePool, FenceSlot};
use crate::memory::{MemoryAllocator, MemoryKind};
use crate::queue::{QueueDriver, QueueResource};
use crate::ring::{CommandRing, RingWriter};
use crate::signal::Signal;

/// One SDMA queue: its command ring, fence pool and driver binding.
///
/// All submission methods take `&self` and may be called from any number of
/// threads at once.
pub struct SdmaBlit<G: SdmaGeneration> {
    ring: CommandRing<G>,
    fences: FencePool,
    config: BlitConfig,
    profiling: AtomicBool,
    allocator: Arc<dyn MemoryAllocator>,
    driver: Arc<dyn QueueDriver>,
    live: bool,
}

impl<G: SdmaGeneration> SdmaBlit<G> {
    /// Allocate the ring, bind it to a hardware queue and allocate the fence
    /// pool. Anything acquired before a failure is released again.
    pub fn initialize(
        config: BlitConfig,
        allocator: Arc<dyn MemoryAllocator>,
        driver: Arc<dyn QueueDriver>,
    ) -> Result<Self> {
        config.validate()?;

        let ring_region = allocator.allocate(config.ring_size, MemoryKind::Executable)?;

        let queue = match driver.create_ring_queue(
            config.node_id,
            config.queue_kind,
            config.priority,
            &ring_region,
        ) {
            Ok(queue) => queue,
            Err(err) => {
                error!(node = config.node_id, error = %err, "failed to bind SDMA ring");
                allocator.free(&ring_region);
                return Err(err.into());
            }
        };

        let fences = match FencePool::new(&*allocator, config.fence_pool_size) {
            Ok(fences) => fences,
            Err(err) => {
                if let Err(unbind) = driver.destroy_ring_queue(queue.queue_id) {
                    warn!(queue = %queue.queue_id, error = %unbind, "unbind during failed initialize");
                }
                allocator.free(&ring_region);
                return Err(err.into());
            }
        };

        debug!(
            generation = G::NAME,
            queue = %queue.queue_id,
            ring_size = config.ring_size,
            ring_addr = ring_region.device_addr(),
            "SDMA queue initialized"
        );

        Ok(Self {
            ring: CommandRing::new(ring_region, queue, config.wait_idle_before_wptr_update),
            fences,
            profiling: AtomicBool::new(config.profiling),
            config,
            allocator,
            driver,
            live: true,
        })
    }

    /// Unbind the queue and release the ring and fence pool. Memory is
    /// released even when the driver reports an unbind failure; that failure
    /// is logged and returned.
    pub fn destroy(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if !self.live {
            return Ok(());
        }
        self.live = false;

        let queue_id = self.ring.queue().queue_id;
        let unbind = self.driver.destroy_ring_queue(queue_id);
        if let Err(err) = &unbind {
            warn!(queue = %queue_id, error = %err, "failed to unbind SDMA ring; releasing memory anyway");
        }
        self.allocator.free(self.ring.region());
        self.fences.release(&*self.allocator);
        debug!(queue = %queue_id, "SDMA queue destroyed");
        unbind.map_err(BlitError::from)
    }

    pub fn config(&self) -> &BlitConfig {
        &self.config
    }

    pub fn queue(&self) -> &QueueResource {
        self.ring.queue()
    }

    pub fn ring(&self) -> &CommandRing<G> {
        &self.ring
    }

    pub fn fences(&self) -> &FencePool {
        &self.fences
    }

    pub fn enable_profiling(&self, enable: bool) {
        self.profiling.store(enable, Ordering::Relaxed);
    }

    pub fn profiling_enabled(&self) -> bool {
        self.profiling.load(Ordering::Relaxed)
    }

    /// Upper bound on payload bytes submitted but not yet executed. Zero when
    /// the engine has drained everything and nothing is being submitted.
    pub fn pending_bytes(&self) -> u64 {
        let read = self.ring.read_index();
        self.ring.pending.pending(read)
    }

    /// Copy `size` bytes and wait for the engine to finish. Returns the fence
    /// slot the engine signaled, or `None` if there was nothing to copy.
    pub fn submit_copy_blocking(
        &self,
        dst: u64,
        src: u64,
        size: u64,
    ) -> Result<Option<FenceSlot>> {
        if size == 0 {
            return Ok(None);
        }
        let body = self.transfer_bytes(SdmaCmdWriter::<G>::copy_linear_bytes(size));
        let fence = self.submit_blocking(body, size, |w| {
            self.encode_transfer(w, |w| w.copy_linear(dst, src, size))
        })?;
        trace!(dst, src, size, "blocking copy complete");
        Ok(Some(fence))
    }

    /// Fill `count` dwords at `dst` with `value` and wait for the engine.
    pub fn submit_fill_blocking(
        &self,
        dst: u64,
        value: u32,
        count: u64,
    ) -> Result<Option<FenceSlot>> {
        if dst % 4 != 0 {
            return Err(BlitError::invalid(format!(
                "fill destination {dst:#x} is not dword aligned"
            )));
        }
        if count == 0 {
            return Ok(None);
        }
        let size = count
            .checked_mul(4)
            .ok_or_else(|| BlitError::invalid(format!("fill of {count} dwords overflows")))?;
        let body = self.transfer_bytes(SdmaCmdWriter::<G>::const_fill_bytes(size));
        let fence = self.submit_blocking(body, size, |w| {
            self.encode_transfer(w, |w| w.const_fill(dst, value, size))
        })?;
        trace!(dst, value, count, "blocking fill complete");
        Ok(Some(fence))
    }

    /// Pitched 3D copy; waits for the engine.
    pub fn submit_copy_rect(&self, copy: &RectCopy) -> Result<Option<FenceSlot>> {
        let tiles = copy.plan()?;
        if tiles.is_empty() {
            return Ok(None);
        }
        let payload = copy.extent.volume();
        let body = self.transfer_bytes(SdmaCmdWriter::<G>::copy_rect_bytes(tiles.len()));
        let fence = self.submit_blocking(body, payload, |w| {
            self.encode_transfer(w, |w| {
                for tile in &tiles {
                    w.copy_rect(tile);
                }
            })
        })?;
        trace!(tiles = tiles.len(), bytes = payload, "rect copy complete");
        Ok(Some(fence))
    }

    /// Queue a copy that starts once every dependency signal reads zero and
    /// decrements `completion` when done. Returns once the packets are
    /// visible to the engine.
    ///
    /// Without platform atomics the completion is written with fences
    /// carrying `completion`'s current value minus one. That is only correct
    /// if nothing else changes the signal between this call and the engine
    /// executing those fences.
    pub fn submit_copy_async(
        &self,
        dst: u64,
        src: u64,
        size: u64,
        deps: &[&dyn Signal],
        completion: &dyn Signal,
    ) -> Result<()> {
        let slots = completion
            .profiling_slots()
            .filter(|_| self.profiling_enabled());
        let update = self.completion_update(completion);
        let mailbox = completion.event_mailbox();

        let mut bytes = SdmaCmdWriter::<G>::signal_wait_bytes(deps.len());
        if size > 0 {
            let body = SdmaCmdWriter::<G>::copy_linear_bytes(size);
            bytes = bytes.saturating_add(self.transfer_bytes(body));
        }
        if slots.is_some() {
            bytes = bytes.saturating_add(2 * packet_bytes(SdmaPktTimestamp::SIZE_BYTES));
        }
        bytes = bytes.saturating_add(update.bytes());
        if mailbox.is_some() {
            let post = packet_bytes(SdmaPktFence::SIZE_BYTES) + packet_bytes(SdmaPktTrap::SIZE_BYTES);
            bytes = bytes.saturating_add(post);
        }

        self.submit(bytes, size, |w| {
            for dep in deps {
                w.wait_signal_zero(dep.value_location());
            }
            if let Some(slots) = slots {
                w.timestamp(slots.start);
            }
            if size > 0 {
                self.encode_transfer(w, |w| w.copy_linear(dst, src, size));
            }
            if let Some(slots) = slots {
                w.timestamp(slots.end);
            }
            update.encode(w);
            if let Some(mailbox) = mailbox {
                w.fence(mailbox.addr, mailbox.event_id);
                w.trap(mailbox.event_id);
            }
        })?;
        trace!(
            dst,
            src,
            size,
            deps = deps.len(),
            signal = completion.value_location(),
            "async copy submitted"
        );
        Ok(())
    }

    /// Submit `body_bytes` of packets followed by a fence, then spin until
    /// the fence lands.
    fn submit_blocking(
        &self,
        body_bytes: u64,
        payload: u64,
        encode: impl FnOnce(&mut RingWriter<'_, G>),
    ) -> Result<FenceSlot> {
        let bytes = body_bytes.saturating_add(packet_bytes(SdmaPktFence::SIZE_BYTES));
        self.ring.check_capacity(bytes)?;
        let fence = self.fences.obtain();
        self.submit(bytes, payload, |w| {
            encode(w);
            w.fence(fence.address, fence.sentinel);
        })?;
        self.fences.wait(&fence);
        Ok(fence)
    }

    /// Reserve `bytes` of ring, encode into it and publish. Requests that can
    /// never fit are rejected before anything is encoded.
    fn submit(
        &self,
        bytes: u64,
        payload: u64,
        encode: impl FnOnce(&mut RingWriter<'_, G>),
    ) -> Result<()> {
        self.ring.check_capacity(bytes)?;
        let pending = &self.ring.pending;
        pending.begin(payload);
        let res = match self.ring.reserve(bytes) {
            Ok(res) => res,
            Err(err) => {
                pending.end(payload);
                return Err(err);
            }
        };
        self.ring.write_packets(&res, encode);
        self.ring.publish(res, payload);
        pending.end(payload);
        Ok(())
    }

    /// Ring bytes for a transfer whose own packets take `body` bytes, once
    /// [`encode_transfer`](Self::encode_transfer) has wrapped it.
    fn transfer_bytes(&self, body: u64) -> u64 {
        let direction = self.config.direction;
        let flushes = match self.config.active_hdp_registers() {
            Some(_) => u64::from(direction.flush_before()) + u64::from(direction.flush_after()),
            None => 0,
        };
        let gcr = if G::USE_GCR {
            packet_bytes(SdmaPktGcr::SIZE_BYTES)
        } else {
            0
        };
        body.saturating_add(flushes * packet_bytes(SDMA_HDP_FLUSH_SIZE_BYTES) + gcr)
    }

    /// Wrap a transfer with the HDP flushes its direction needs and, where
    /// the engine has one, a cache invalidate.
    fn encode_transfer(
        &self,
        w: &mut RingWriter<'_, G>,
        body: impl FnOnce(&mut RingWriter<'_, G>),
    ) {
        let hdp = self.config.active_hdp_registers();
        let direction = self.config.direction;
        if let Some(regs) = hdp.filter(|_| direction.flush_before()) {
            w.hdp_flush(&regs);
        }
        body(w);
        if let Some(regs) = hdp.filter(|_| direction.flush_after()) {
            w.hdp_flush(&regs);
        }
        if G::USE_GCR {
            w.gcr(0, GCR_LIMIT_VA_MAX, GcrControl::full_invalidate());
        }
    }

    fn completion_update(&self, completion: &dyn Signal) -> CompletionUpdate {
        let addr = completion.value_location();
        if self.config.platform_atomics {
            return CompletionUpdate::Decrement { addr };
        }
        let old = completion.load_relaxed() as u64;
        let new = old.wrapping_sub(1);
        CompletionUpdate::Store {
            addr,
            value: new,
            high: hi32(new) != 0 || hi32(old) != 0,
        }
    }
}

fn packet_bytes(size: usize) -> u64 {
    size as u64
}

/// How the engine retires an async copy's completion signal.
#[derive(Debug, Clone, Copy)]
enum CompletionUpdate {
    Decrement { addr: u64 },
    /// Fence stores of a value computed at submission time.
    Store { addr: u64, value: u64, high: bool },
}

impl CompletionUpdate {
    fn bytes(&self) -> u64 {
        match *self {
            Self::Decrement { .. } => packet_bytes(SdmaPktAtomic::SIZE_BYTES),
            Self::Store { high, .. } => {
                (1 + u64::from(high)) * packet_bytes(SdmaPktFence::SIZE_BYTES)
            }
        }
    }

    fn encode<G: SdmaGeneration, S: PacketSink>(&self, w: &mut SdmaCmdWriter<G, S>) {
        match *self {
            Self::Decrement { addr } => w.atomic_decrement(addr),
            Self::Store { addr, value, high } => {
                // High half first so a reader never sees the low half settle
                // on a value whose high half is stale.
                if high {
                    w.fence(addr + 4, hi32(value));
                }
                w.fence(addr, lo32(value));
            }
        }
    }
}

impl<G: SdmaGeneration> Drop for SdmaBlit<G> {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}
