use std::sync::atomic::{fence, Ordering};

use sdma_protocol::SdmaGeneration;

use crate::ring::{CommandRing, Reservation};
use crate::spin::Backoff;

impl<G: SdmaGeneration> CommandRing<G> {
    /// Expose a fully written reservation to the engine.
    ///
    /// Publishes happen in reservation order: a producer whose range starts
    /// later spins here until every earlier range is committed. The engine
    /// re-reads the write pointer when the doorbell rings, so the write
    /// pointer is stored (and fenced) before the doorbell.
    ///
    /// `payload_bytes` is what the submission moves, for
    /// [`pending_bytes`](crate::SdmaBlit::pending_bytes) accounting.
    pub fn publish(&self, res: Reservation, payload_bytes: u64) {
        let (start, len) = res.into_parts();
        assert!(len <= self.size, "commit of {len} bytes exceeds ring size {}", self.size);
        let end = start + len;

        Backoff::spin_until(|| self.committed.load(Ordering::Acquire) == start);
        if self.wait_idle {
            Backoff::spin_until(|| self.read_index() == start);
        }

        self.pending.append(end, payload_bytes);

        let hw = G::hw_index(end, self.size);
        self.queue.write_ptr.store(hw, Ordering::Release);
        fence(Ordering::SeqCst);
        self.queue.doorbell.store(hw, Ordering::Release);

        self.committed.store(end, Ordering::Release);
        tracing::trace!(start, end, hw_wptr = hw, "committed ring range");
    }
}

#[cfg(test)]
mod tests {
    use crate::memory::{HostRegion, MemoryKind};
    use crate::queue::{HwRegister, QueueId, QueueResource};
    use crate::ring::CommandRing;
    use sdma_protocol::SdmaV4;
    use std::sync::atomic::Ordering;
    use std::sync::{mpsc, Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn ring(wait_idle: bool) -> Arc<CommandRing<SdmaV4>> {
        let queue = QueueResource {
            queue_id: QueueId(0),
            read_ptr: HwRegister::new(0),
            write_ptr: HwRegister::new(0),
            doorbell: HwRegister::new(0),
        };
        Arc::new(CommandRing::new(
            HostRegion::new(0x20_0000, 4096, MemoryKind::Executable),
            queue,
            wait_idle,
        ))
    }

    #[test]
    fn later_reservation_waits_for_earlier_commit() {
        let r = ring(false);
        let first = r.reserve(64).unwrap();
        let second = r.reserve(32).unwrap();
        assert_eq!(second.start(), 64);

        let (tx, rx) = mpsc::channel();
        let r2 = r.clone();
        let late = thread::spawn(move || {
            r2.publish(second, 0);
            tx.send(r2.queue.write_ptr.load(Ordering::Acquire)).unwrap();
        });

        // Encoding of the second range finished first, but nothing is
        // visible until the first range commits.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(r.queue.write_ptr.load(Ordering::Acquire), 0);
        assert_eq!(r.committed_index(), 0);

        r.publish(first, 0);
        assert_eq!(rx.recv().unwrap(), 96);
        late.join().unwrap();
        assert_eq!(r.queue.doorbell.load(Ordering::Acquire), 96);
    }

    #[test]
    fn write_pointer_sequence_follows_reservation_order() {
        const THREADS: usize = 6;
        let r = ring(false);
        let barrier = Arc::new(Barrier::new(THREADS));
        let reservations: Vec<_> = (0..THREADS).map(|_| r.reserve(16).unwrap()).collect();

        // Observer records every doorbell value it sees.
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let observer = {
            let r = r.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut seen = vec![0u64];
                while !stop.load(Ordering::Acquire) {
                    let v = r.queue.doorbell.load(Ordering::Acquire);
                    if seen.last() != Some(&v) {
                        seen.push(v);
                    }
                }
                seen.push(r.queue.doorbell.load(Ordering::Acquire));
                seen
            })
        };

        // Publish in reverse reservation order from separate threads.
        let handles: Vec<_> = reservations
            .into_iter()
            .rev()
            .map(|res| {
                let r = r.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    r.publish(res, 16);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        stop.store(true, Ordering::Release);
        let seen = observer.join().unwrap();

        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        assert!(seen.iter().all(|v| v % 16 == 0));
        assert_eq!(r.committed_index(), 16 * THREADS as u64);
        assert_eq!(r.queue.write_ptr.load(Ordering::Acquire), 16 * THREADS as u64);
    }

    #[test]
    fn wait_idle_holds_publish_until_engine_catches_up() {
        let r = ring(true);
        let first = r.reserve(64).unwrap();
        let second = r.reserve(64).unwrap();
        r.queue.read_ptr.store(0, Ordering::Release);
        r.publish(first, 0);

        let r2 = r.clone();
        let late = thread::spawn(move || r2.publish(second, 0));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(r.committed_index(), 64);

        r.queue.read_ptr.store(64, Ordering::Release);
        late.join().unwrap();
        assert_eq!(r.committed_index(), 128);
    }
}
