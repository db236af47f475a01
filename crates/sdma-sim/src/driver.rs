use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use sdma_blit::{
    AddressSpace, DriverError, HostRegion, HwRegister, QueueDriver, QueueId, QueueKind,
    QueuePriority, QueueResource,
};
use sdma_protocol::SdmaGeneration;
use tracing::debug;

use crate::engine::{EngineShared, QueueState, QueueStats, SimFault, Worker};

struct SimQueue {
    state: Arc<QueueState>,
    worker: Option<JoinHandle<()>>,
    node: u32,
    kind: QueueKind,
    priority: QueuePriority,
}

impl SimQueue {
    fn stop(&mut self) {
        self.state.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Software SDMA engine: binds rings like a kernel driver would and consumes
/// each one on its own thread, executing packets against an
/// [`AddressSpace`].
pub struct SimulatedSdma<G: SdmaGeneration> {
    shared: Arc<EngineShared>,
    queues: Mutex<HashMap<QueueId, SimQueue>>,
    next_id: AtomicU32,
    fail_create: AtomicBool,
    fail_destroy: AtomicBool,
    _gen: PhantomData<fn() -> G>,
}

impl<G: SdmaGeneration> SimulatedSdma<G> {
    pub fn new(space: Arc<AddressSpace>) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                space,
                paused: AtomicBool::new(false),
                clock: AtomicU64::new(0),
            }),
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            fail_create: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
            _gen: PhantomData,
        }
    }

    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.shared.space
    }

    /// Stop every queue from consuming packets. Doorbells still land.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::Release);
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::Release);
    }

    fn with_queue<T>(&self, id: QueueId, f: impl FnOnce(&SimQueue) -> T) -> Option<T> {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.get(&id).map(f)
    }

    pub fn live_queues(&self) -> usize {
        self.queues.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn stats(&self, id: QueueId) -> Option<QueueStats> {
        self.with_queue(id, |q| q.state.snapshot())
    }

    /// Interrupt contexts raised by trap packets, oldest first.
    pub fn traps(&self, id: QueueId) -> Vec<u32> {
        self.with_queue(id, |q| q.state.traps()).unwrap_or_default()
    }

    pub fn fault(&self, id: QueueId) -> Option<SimFault> {
        self.with_queue(id, |q| q.state.fault()).flatten()
    }

    /// Binding parameters a queue was created with.
    pub fn binding(&self, id: QueueId) -> Option<(u32, QueueKind, QueuePriority)> {
        self.with_queue(id, |q| (q.node, q.kind, q.priority))
    }
}

impl<G: SdmaGeneration> QueueDriver for SimulatedSdma<G> {
    fn create_ring_queue(
        &self,
        node: u32,
        kind: QueueKind,
        priority: QueuePriority,
        ring: &HostRegion,
    ) -> Result<QueueResource, DriverError> {
        if self.fail_create.load(Ordering::Acquire) {
            return Err(DriverError::CreateFailed {
                node,
                reason: "injected failure".into(),
            });
        }
        let mapped = self
            .shared
            .space
            .resolve(ring.device_addr(), ring.len())
            .is_ok();
        if !ring.len().is_power_of_two() || !mapped {
            return Err(DriverError::InvalidRing {
                addr: ring.device_addr(),
                size: ring.len(),
            });
        }

        let queue_id = QueueId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let regs = QueueResource {
            queue_id,
            read_ptr: HwRegister::new(0),
            write_ptr: HwRegister::new(0),
            doorbell: HwRegister::new(0),
        };
        let state = Arc::new(QueueState::new(queue_id, ring.clone(), regs.clone()));
        let worker = Worker::<G>::new(state.clone(), self.shared.clone());
        let handle = thread::Builder::new()
            .name(format!("sdma-sim-{queue_id}"))
            .spawn(move || worker.run())
            .map_err(|err| DriverError::CreateFailed {
                node,
                reason: err.to_string(),
            })?;

        debug!(
            queue = %queue_id,
            generation = G::NAME,
            node,
            ?kind,
            priority = priority.get(),
            ring = ring.device_addr(),
            "simulated SDMA queue created"
        );
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                queue_id,
                SimQueue {
                    state,
                    worker: Some(handle),
                    node,
                    kind,
                    priority,
                },
            );
        Ok(regs)
    }

    fn destroy_ring_queue(&self, queue_id: QueueId) -> Result<(), DriverError> {
        if self.fail_destroy.load(Ordering::Acquire) {
            return Err(DriverError::DestroyFailed {
                queue_id,
                reason: "injected failure".into(),
            });
        }
        let queue = self
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&queue_id);
        let Some(mut queue) = queue else {
            return Err(DriverError::UnknownQueue(queue_id));
        };
        queue.stop();
        debug!(queue = %queue_id, "simulated SDMA queue destroyed");
        Ok(())
    }
}

impl<G: SdmaGeneration> Drop for SimulatedSdma<G> {
    fn drop(&mut self) {
        let queues = self.queues.get_mut().unwrap_or_else(|e| e.into_inner());
        for queue in queues.values_mut() {
            queue.stop();
        }
    }
}
