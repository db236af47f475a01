//! Full submission paths against the software engine.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use sdma_blit::{
    AddressSpace, BlitConfig, BlitError, CopyDirection, Dim3, DriverError, FenceSlot, HostRegion,
    MemoryAllocator, MemoryError, MemoryKind, MemorySignal, PitchedSurface, RectCopy, SdmaBlit,
    SdmaGeneration, SdmaV2, SdmaV4, SdmaV5, SystemAllocator,
};
use sdma_protocol::HdpFlushRegisters;
use sdma_sim::SimulatedSdma;

struct Harness<G: SdmaGeneration> {
    alloc: Arc<SystemAllocator>,
    sim: Arc<SimulatedSdma<G>>,
    blit: SdmaBlit<G>,
}

impl<G: SdmaGeneration> Harness<G> {
    fn new(config: BlitConfig) -> Self {
        let space = Arc::new(AddressSpace::new());
        let alloc = Arc::new(SystemAllocator::new(space.clone()));
        let sim = Arc::new(SimulatedSdma::<G>::new(space));
        let blit = SdmaBlit::<G>::initialize(config, alloc.clone(), sim.clone()).unwrap();
        Self { alloc, sim, blit }
    }

    fn buffer(&self, len: u64) -> HostRegion {
        self.alloc.allocate(len, MemoryKind::Plain).unwrap()
    }

    fn signal(&self, initial: i64) -> MemorySignal {
        MemorySignal::new(self.alloc.clone(), initial).unwrap()
    }

    fn stats(&self) -> sdma_sim::QueueStats {
        self.sim.stats(self.blit.queue().queue_id).unwrap()
    }

    /// Wait until the engine has consumed everything committed so far.
    fn drain(&self) {
        let ring = self.blit.ring();
        wait_for(|| ring.read_index() == ring.committed_index());
    }
}

fn small_ring() -> BlitConfig {
    BlitConfig {
        ring_size: 4096,
        fence_pool_size: 64,
        ..BlitConfig::default()
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn contents(region: &HostRegion, offset: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    region.read_bytes(offset, &mut out);
    out
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out");
        std::thread::sleep(Duration::from_micros(100));
    }
}

fn copy_and_fill<G: SdmaGeneration>() {
    let h = Harness::<G>::new(small_ring());
    let src = h.buffer(64 * 1024);
    let dst = h.buffer(64 * 1024);
    let data = pattern(64 * 1024, 3);
    src.write_bytes(0, &data);

    h.blit
        .submit_copy_blocking(dst.device_addr(), src.device_addr(), data.len() as u64)
        .unwrap();
    assert_eq!(contents(&dst, 0, data.len()), data);

    h.blit
        .submit_fill_blocking(dst.device_addr() + 8, 0xDEAD_BEEF, 100)
        .unwrap();
    assert_eq!(contents(&dst, 4, 4), data[4..8].to_vec());
    assert_eq!(dst.load_u32(8, Ordering::Relaxed), 0xDEAD_BEEF);
    assert_eq!(dst.load_u32(404, Ordering::Relaxed), 0xDEAD_BEEF);
    assert_eq!(contents(&dst, 408, 4), data[408..412].to_vec());

    // Many small submissions lap the 4 KiB ring several times.
    for i in 0..400u64 {
        let off = (i * 64) % 4096;
        h.blit
            .submit_copy_blocking(dst.device_addr() + off, src.device_addr() + off + 4096, 64)
            .unwrap();
    }
    assert!(h.blit.ring().committed_index() > 3 * 4096);
    h.drain();
    assert_eq!(h.blit.pending_bytes(), 0);
}

#[test]
fn copy_and_fill_v2() {
    copy_and_fill::<SdmaV2>();
}

#[test]
fn copy_and_fill_v4() {
    copy_and_fill::<SdmaV4>();
}

#[test]
fn copy_and_fill_v5() {
    copy_and_fill::<SdmaV5>();
}

#[test]
fn misaligned_fill_is_rejected_before_submission() {
    let h = Harness::<SdmaV4>::new(small_ring());
    let dst = h.buffer(64);
    let err = h
        .blit
        .submit_fill_blocking(dst.device_addr() + 2, 0, 4)
        .unwrap_err();
    assert!(matches!(err, BlitError::InvalidArgument(_)), "{err}");
    assert_eq!(h.blit.ring().reserved_index(), 0);

    h.blit.submit_fill_blocking(dst.device_addr(), 7, 0).unwrap();
    assert_eq!(h.blit.ring().reserved_index(), 0);
}

#[test]
fn large_copy_is_split_across_packets() {
    let h = Harness::<SdmaV4>::new(BlitConfig::default());
    let len = 5 << 20;
    let src = h.buffer(len);
    let dst = h.buffer(len);
    let data = pattern(len as usize, 11);
    src.write_bytes(0, &data);

    h.blit
        .submit_copy_blocking(dst.device_addr(), src.device_addr(), len)
        .unwrap();
    assert_eq!(contents(&dst, 0, data.len()), data);
    let stats = h.stats();
    assert_eq!(stats.copies, 2);
    assert_eq!(stats.bytes_moved, len);
}

#[test]
fn rect_copy_moves_sub_rectangle() {
    let h = Harness::<SdmaV5>::new(small_ring());
    // 3 slices of 8 rows x 64 bytes, copied into a 128-byte pitch surface.
    let src = h.buffer(3 * 512);
    let dst = h.buffer(4 * 1024);
    let data = pattern(3 * 512, 5);
    src.write_bytes(0, &data);

    let copy = RectCopy {
        src: PitchedSurface {
            base: src.device_addr(),
            pitch: 64,
            slice_pitch: 512,
        },
        src_offset: Dim3::new(16, 2, 1),
        dst: PitchedSurface {
            base: dst.device_addr(),
            pitch: 128,
            slice_pitch: 1024,
        },
        dst_offset: Dim3::new(32, 1, 0),
        extent: Dim3::new(32, 4, 2),
    };
    h.blit.submit_copy_rect(&copy).unwrap();

    for z in 0..2u64 {
        for y in 0..4u64 {
            let s = ((1 + z) * 512 + (2 + y) * 64 + 16) as usize;
            let d = z * 1024 + (1 + y) * 128 + 32;
            assert_eq!(contents(&dst, d, 32), data[s..s + 32].to_vec(), "z={z} y={y}");
        }
    }
    // Bytes just outside the rectangle stay untouched.
    assert_eq!(dst.load_u32(128 + 28, Ordering::Relaxed), 0);
    assert_eq!(dst.load_u32(128 + 64, Ordering::Relaxed), 0);
    assert_eq!(h.stats().rect_copies, 1);

    let bad = RectCopy {
        extent: Dim3::new(6, 1, 1),
        ..copy
    };
    assert!(matches!(
        h.blit.submit_copy_rect(&bad),
        Err(BlitError::InvalidArgument(_))
    ));
}

#[test]
fn concurrent_blocking_copies_publish_in_order() {
    let h = Harness::<SdmaV4>::new(small_ring());
    let src = h.buffer(8192);
    let dst = h.buffer(8192);
    let data = pattern(8192, 1);
    src.write_bytes(0, &data);

    let slots: Vec<FenceSlot> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..2u64)
            .map(|half| {
                let blit = &h.blit;
                let (src, dst) = (src.device_addr(), dst.device_addr());
                s.spawn(move || {
                    blit.submit_copy_blocking(dst + half * 4096, src + half * 4096, 4096)
                        .unwrap()
                        .unwrap()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(contents(&dst, 0, 8192), data);
    // Each thread waited on its own slot and saw its own sentinel land there.
    assert_ne!(slots[0].address, slots[1].address);
    assert_ne!(slots[0].sentinel, slots[1].sentinel);
    for slot in &slots {
        assert!(h.blit.fences().is_signaled(slot), "{slot:?}");
    }
    // Two copy packets and two fence packets.
    let wptr = h.blit.queue().write_ptr.load(Ordering::Acquire);
    assert_eq!(wptr, 88);
    assert_eq!(h.blit.queue().doorbell.load(Ordering::Acquire), 88);
    assert_eq!(h.blit.ring().committed_index(), 88);
}

#[test]
fn many_threads_share_a_small_ring() {
    let h = Harness::<SdmaV2>::new(small_ring());
    let src = h.buffer(16 * 1024);
    let dst = h.buffer(16 * 1024);
    let data = pattern(16 * 1024, 9);
    src.write_bytes(0, &data);

    std::thread::scope(|s| {
        for t in 0..8u64 {
            let blit = &h.blit;
            let (src, dst) = (src.device_addr(), dst.device_addr());
            s.spawn(move || {
                for chunk in 0..32u64 {
                    let off = t * 2048 + chunk * 64;
                    blit.submit_copy_blocking(dst + off, src + off, 64).unwrap();
                }
            });
        }
    });

    assert_eq!(contents(&dst, 0, data.len()), data);
    h.drain();
    assert_eq!(h.stats().copies, 256);
    assert_eq!(h.blit.pending_bytes(), 0);
}

#[test]
fn async_copy_waits_for_dependencies() {
    let h = Harness::<SdmaV5>::new(small_ring());
    let src = h.buffer(4096);
    let dst = h.buffer(4096);
    let data = pattern(4096, 7);
    src.write_bytes(0, &data);

    let dep_a = h.signal(1);
    let dep_b = h.signal(1 << 32);
    let done = h.signal(1);
    h.blit
        .submit_copy_async(
            dst.device_addr(),
            src.device_addr(),
            4096,
            &[&dep_a, &dep_b],
            &done,
        )
        .unwrap();

    // Polls sit at 0 and 24 (dep_a low/high) and 48 and 72 (dep_b low/high).
    let read_ptr = || h.blit.queue().read_ptr.load(Ordering::Acquire);
    wait_for(|| h.stats().poll_retries > 5);
    for _ in 0..20 {
        assert_eq!(read_ptr(), 0);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(done.load_acquire(), 1);
    assert_eq!(contents(&dst, 0, 16), vec![0u8; 16]);

    // dep_b's low half is already zero; the engine parks on its high half.
    dep_a.store_release(0);
    wait_for(|| read_ptr() == 72);
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(read_ptr(), 72);
    assert_eq!(done.load_acquire(), 1);
    assert_eq!(contents(&dst, 0, 16), vec![0u8; 16]);

    dep_b.store_release(0);
    done.wait_eq(0);
    assert_eq!(contents(&dst, 0, 4096), data);
    h.drain();
    let stats = h.stats();
    assert_eq!((stats.copies, stats.atomics, stats.cache_invalidates), (1, 1, 1));
}

#[test]
fn async_completion_posts_mailbox_and_trap() {
    let h = Harness::<SdmaV4>::new(small_ring());
    let done = h.signal(1).with_event(42);

    h.blit.submit_copy_async(0, 0, 0, &[], &done).unwrap();
    done.wait_eq(0);
    h.drain();

    assert_eq!(done.mailbox_value(), 42);
    assert_eq!(h.sim.traps(h.blit.queue().queue_id), vec![42]);
    assert_eq!(h.stats().copies, 0);
}

#[test]
fn completion_by_fences_without_platform_atomics() {
    let h = Harness::<SdmaV4>::new(BlitConfig {
        platform_atomics: false,
        ..small_ring()
    });

    let done = h.signal(1);
    h.blit.submit_copy_async(0, 0, 0, &[], &done).unwrap();
    done.wait_eq(0);
    assert_eq!(h.stats().atomics, 0);

    // Crossing the 32-bit boundary rewrites the high half as well.
    let wide = h.signal(1 << 32);
    h.blit.submit_copy_async(0, 0, 0, &[], &wide).unwrap();
    wide.wait_eq(0xFFFF_FFFF);
    h.drain();
    assert_eq!(h.stats().fences, 1 + 2);
}

#[test]
fn profiling_stamps_start_and_end() {
    let h = Harness::<SdmaV5>::new(small_ring());
    let src = h.buffer(256);
    let dst = h.buffer(256);
    let done = h.signal(1);

    h.blit.enable_profiling(true);
    h.blit
        .submit_copy_async(dst.device_addr(), src.device_addr(), 256, &[], &done)
        .unwrap();
    done.wait_eq(0);

    let (start, end) = (done.start_timestamp(), done.end_timestamp());
    assert!(start > 0, "start timestamp not written");
    assert!(end > start, "start={start} end={end}");

    h.blit.enable_profiling(false);
    let plain = h.signal(1);
    h.blit.submit_copy_async(0, 0, 0, &[], &plain).unwrap();
    plain.wait_eq(0);
    h.drain();
    assert_eq!(plain.start_timestamp(), 0);
    assert_eq!(h.stats().timestamps, 2);
}

#[test]
fn host_to_device_copies_flush_hdp_first() {
    let h = Harness::<SdmaV5>::new(BlitConfig {
        direction: CopyDirection::HostToDevice,
        hdp_registers: Some(HdpFlushRegisters {
            request: 0x1000,
            done: 0x1001,
            reference_mask: 1,
        }),
        ..small_ring()
    });
    let buf = h.buffer(128);
    h.blit
        .submit_copy_blocking(buf.device_addr() + 64, buf.device_addr(), 64)
        .unwrap();
    let stats = h.stats();
    assert_eq!((stats.hdp_flushes, stats.cache_invalidates), (1, 1));
}

#[test]
fn pending_bytes_tracks_unexecuted_work() {
    let h = Harness::<SdmaV4>::new(small_ring());
    let src = h.buffer(8192);
    let dst = h.buffer(8192);
    assert_eq!(h.blit.pending_bytes(), 0);

    h.sim.pause();
    let first = h.signal(1);
    let second = h.signal(1);
    h.blit
        .submit_copy_async(dst.device_addr(), src.device_addr(), 4096, &[], &first)
        .unwrap();
    h.blit
        .submit_copy_async(dst.device_addr() + 4096, src.device_addr() + 4096, 1024, &[], &second)
        .unwrap();
    assert_eq!(h.blit.pending_bytes(), 5120);

    h.sim.resume();
    second.wait_eq(0);
    assert_eq!(first.load_acquire(), 0);
    wait_for(|| h.blit.pending_bytes() == 0);
}

#[test]
fn oversized_request_leaves_no_trace() {
    let h = Harness::<SdmaV4>::new(small_ring());
    let done = h.signal(1);
    // More copy packets than a 4 KiB ring can hold.
    let size = 200 * u64::from(SdmaV4::MAX_SINGLE_COPY_BYTES);

    let err = h
        .blit
        .submit_copy_async(0x1000, 0x2000, size, &[], &done)
        .unwrap_err();
    assert!(
        matches!(err, BlitError::OutOfResources { capacity: 4092, .. }),
        "{err}"
    );
    assert_eq!(h.blit.ring().reserved_index(), 0);
    assert_eq!(h.blit.ring().committed_index(), 0);
    assert_eq!(h.blit.queue().doorbell.load(Ordering::Acquire), 0);
    assert_eq!(h.blit.pending_bytes(), 0);
    assert_eq!(done.load_acquire(), 1);

    // The ring is still usable.
    let buf = h.buffer(64);
    h.blit.submit_fill_blocking(buf.device_addr(), 1, 4).unwrap();
}

#[test]
fn unbounded_requests_are_rejected_immediately() {
    let h = Harness::<SdmaV4>::new(small_ring());
    let done = h.signal(1);
    let buf = h.buffer(64);

    let started = Instant::now();
    let results = [
        h.blit.submit_copy_blocking(0x1000, 0x2000, u64::MAX).map(|_| ()),
        h.blit.submit_fill_blocking(buf.device_addr(), 1, u64::MAX / 4).map(|_| ()),
        h.blit.submit_copy_async(0x1000, 0x2000, u64::MAX, &[], &done),
        h.blit.submit_copy_async(0x1000, 0x2000, 1 << 46, &[], &done),
    ];
    let elapsed = started.elapsed();

    for result in results {
        let err = result.unwrap_err();
        assert!(
            matches!(err, BlitError::OutOfResources { capacity: 4092, .. }),
            "{err}"
        );
    }
    assert!(elapsed < Duration::from_millis(50), "rejection took {elapsed:?}");
    assert_eq!(h.blit.ring().reserved_index(), 0);
    assert_eq!(h.blit.pending_bytes(), 0);
    assert_eq!(done.load_acquire(), 1);
}

#[test]
fn failed_bind_releases_ring() {
    let space = Arc::new(AddressSpace::new());
    let alloc = Arc::new(SystemAllocator::new(space.clone()));
    let sim = Arc::new(SimulatedSdma::<SdmaV4>::new(space));
    sim.fail_create(true);

    let err = SdmaBlit::<SdmaV4>::initialize(small_ring(), alloc.clone(), sim.clone())
        .err()
        .unwrap();
    assert!(matches!(err, BlitError::Driver(DriverError::CreateFailed { .. })), "{err}");
    assert_eq!(alloc.live_allocations(), 0);
    assert_eq!(sim.live_queues(), 0);
}

#[test]
fn failed_fence_pool_unbinds_queue() {
    let space = Arc::new(AddressSpace::new());
    // Room for the ring page only.
    let alloc = Arc::new(SystemAllocator::with_limit(space.clone(), 4096));
    let sim = Arc::new(SimulatedSdma::<SdmaV4>::new(space));

    let err = SdmaBlit::<SdmaV4>::initialize(small_ring(), alloc.clone(), sim.clone())
        .err()
        .unwrap();
    assert!(
        matches!(err, BlitError::Memory(MemoryError::OutOfMemory { .. })),
        "{err}"
    );
    assert_eq!(alloc.live_allocations(), 0);
    assert_eq!(sim.live_queues(), 0);
}

#[test]
fn destroy_releases_memory_even_if_unbind_fails() {
    let h = Harness::<SdmaV4>::new(small_ring());
    let queue_id = h.blit.queue().queue_id;
    h.sim.fail_destroy(true);

    let err = h.blit.destroy().unwrap_err();
    assert!(
        matches!(err, BlitError::Driver(DriverError::DestroyFailed { .. })),
        "{err}"
    );
    assert_eq!(h.alloc.live_allocations(), 0);
    assert_eq!(h.sim.live_queues(), 1);

    h.sim.fail_destroy(false);
    assert!(h.sim.stats(queue_id).is_some());
}

#[test]
fn clean_destroy_unbinds_queue() {
    let h = Harness::<SdmaV5>::new(small_ring());
    h.blit.destroy().unwrap();
    assert_eq!(h.sim.live_queues(), 0);
    assert_eq!(h.alloc.live_allocations(), 0);
}
