use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use sdma_blit::{
    AddressSpace, HostRegion, MemoryAllocator, MemoryKind, QueueDriver, QueueKind, QueuePriority,
    QueueResource, SystemAllocator,
};
use sdma_protocol::{PollParams, SdmaCmdWriter, SdmaGeneration, SdmaV5};
use sdma_sim::{SimFault, SimulatedSdma};

struct Rig {
    sim: SimulatedSdma<SdmaV5>,
    alloc: SystemAllocator,
    ring: HostRegion,
    regs: QueueResource,
    at: u64,
}

impl Rig {
    fn new() -> Self {
        let space = Arc::new(AddressSpace::new());
        let alloc = SystemAllocator::new(space.clone());
        let sim = SimulatedSdma::<SdmaV5>::new(space);
        let ring = alloc.allocate(4096, MemoryKind::Executable).unwrap();
        let regs = sim
            .create_ring_queue(0, QueueKind::Sdma, QueuePriority::NORMAL, &ring)
            .unwrap();
        Self {
            sim,
            alloc,
            ring,
            regs,
            at: 0,
        }
    }

    fn submit(&mut self, w: &SdmaCmdWriter<SdmaV5>) {
        self.ring.write_dwords(self.at % self.ring.len(), w.as_dwords());
        self.at += w.len_bytes() as u64;
        let hw = SdmaV5::hw_index(self.at, self.ring.len());
        self.regs.write_ptr.store(hw, Ordering::Release);
        self.regs.doorbell.store(hw, Ordering::Release);
    }

    fn drained(&self) -> bool {
        self.regs.read_ptr.load(Ordering::Acquire) == self.at
    }
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for simulator");
        std::thread::sleep(Duration::from_micros(100));
    }
}

#[test]
fn poll_stalls_until_signal_reaches_zero() {
    let mut rig = Rig::new();
    let sig = rig.alloc.allocate(8, MemoryKind::Plain).unwrap();
    let out = rig.alloc.allocate(8, MemoryKind::Plain).unwrap();
    sig.store_u64(0, 1, Ordering::Release);

    let mut w = SdmaCmdWriter::<SdmaV5>::new();
    w.wait_signal_zero(sig.device_addr());
    w.fence(out.device_addr(), 0xBEEF);
    rig.submit(&w);

    wait_for(|| rig.sim.stats(rig.regs.queue_id).unwrap().poll_retries > 10);
    assert_eq!(rig.regs.read_ptr.load(Ordering::Acquire), 0);
    assert_eq!(out.load_u32(0, Ordering::Acquire), 0);

    sig.store_u64(0, 0, Ordering::Release);
    wait_for(|| rig.drained());
    assert_eq!(out.load_u32(0, Ordering::Acquire), 0xBEEF);
}

#[test]
fn poll_high_half_also_gates() {
    let mut rig = Rig::new();
    let sig = rig.alloc.allocate(8, MemoryKind::Plain).unwrap();
    sig.store_u64(0, 1 << 32, Ordering::Release);

    let mut w = SdmaCmdWriter::<SdmaV5>::new();
    w.wait_signal_zero(sig.device_addr());
    rig.submit(&w);

    // The low half is already zero; the engine parks on the second poll.
    wait_for(|| rig.regs.read_ptr.load(Ordering::Acquire) == 24);
    assert!(!rig.drained());
    sig.store_u64(0, 0, Ordering::Release);
    wait_for(|| rig.drained());
}

#[test]
fn finite_poll_gives_up_after_retry_budget() {
    let mut rig = Rig::new();
    let word = rig.alloc.allocate(8, MemoryKind::Plain).unwrap();
    let poll = PollParams {
        retry_count: 3,
        ..PollParams::until_equal(word.device_addr(), 1)
    };
    let mut w = SdmaCmdWriter::<SdmaV5>::new();
    w.poll_regmem(&poll);
    rig.submit(&w);

    wait_for(|| rig.drained());
    assert_eq!(rig.sim.stats(rig.regs.queue_id).unwrap().poll_retries, 3);
}

#[test]
fn decrement_timestamp_and_trap() {
    let mut rig = Rig::new();
    let sig = rig.alloc.allocate(32, MemoryKind::Plain).unwrap();
    let base = sig.device_addr();
    sig.store_u64(0, 2, Ordering::Release);

    let mut w = SdmaCmdWriter::<SdmaV5>::new();
    w.timestamp(base + 8);
    w.atomic_decrement(base);
    w.timestamp(base + 16);
    w.fence(base + 24, 77);
    w.trap(77);
    rig.submit(&w);

    wait_for(|| rig.drained());
    assert_eq!(sig.load_u64(0, Ordering::Acquire), 1);
    let start = sig.load_u64(8, Ordering::Acquire);
    let end = sig.load_u64(16, Ordering::Acquire);
    assert!(start > 0 && end > start, "start={start} end={end}");
    assert_eq!(sig.load_u32(24, Ordering::Acquire), 77);
    assert_eq!(rig.sim.traps(rig.regs.queue_id), vec![77]);

    let stats = rig.sim.stats(rig.regs.queue_id).unwrap();
    assert_eq!((stats.atomics, stats.timestamps, stats.traps), (1, 2, 1));
}

#[test]
fn pause_holds_the_read_pointer() {
    let mut rig = Rig::new();
    let out = rig.alloc.allocate(8, MemoryKind::Plain).unwrap();
    rig.sim.pause();

    let mut w = SdmaCmdWriter::<SdmaV5>::new();
    w.fence(out.device_addr(), 5);
    rig.submit(&w);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(rig.regs.read_ptr.load(Ordering::Acquire), 0);

    rig.sim.resume();
    wait_for(|| rig.drained());
    assert_eq!(out.load_u32(0, Ordering::Acquire), 5);
}

#[test]
fn unmapped_copy_faults_queue() {
    let mut rig = Rig::new();
    let buf = rig.alloc.allocate(64, MemoryKind::Plain).unwrap();

    let mut w = SdmaCmdWriter::<SdmaV5>::new();
    w.copy_linear(buf.device_addr(), 0x10, 64);
    rig.submit(&w);

    wait_for(|| rig.sim.fault(rig.regs.queue_id).is_some());
    assert!(matches!(
        rig.sim.fault(rig.regs.queue_id),
        Some(SimFault::Memory { index: 0, .. })
    ));
    assert_eq!(rig.regs.read_ptr.load(Ordering::Acquire), 0);
}
