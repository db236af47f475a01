//! Host-and-device-visible memory.
//!
//! Memory the engine reads or writes concurrently with the CPU is modeled as a
//! block of `AtomicU64` words addressed by a device virtual address. All
//! accessors are atomic, so CPU threads and the (simulated) engine can share a
//! region without `unsafe`; ordering between them comes from the release and
//! acquire operations on the queue registers and fence words.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;

pub const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: u64 },
    #[error("invalid allocation size {0}")]
    InvalidSize(u64),
    #[error("address range {addr:#x}+{len:#x} is not mapped")]
    Unmapped { addr: u64, len: u64 },
    #[error("address {addr:#x} is not {align}-byte aligned")]
    Misaligned { addr: u64, align: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Plain,
    /// Memory the engine fetches commands from.
    Executable,
}

struct RegionInner {
    device_addr: u64,
    len: u64,
    kind: MemoryKind,
    words: Box<[AtomicU64]>,
}

/// A shared, device-addressed block of memory. Clones alias the same storage.
#[derive(Clone)]
pub struct HostRegion {
    inner: Arc<RegionInner>,
}

impl fmt::Debug for HostRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegion")
            .field("device_addr", &format_args!("{:#x}", self.inner.device_addr))
            .field("len", &self.inner.len)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

#[inline]
fn byte_mask(lo: usize, hi: usize) -> u64 {
    // Bytes [lo, hi) of a little-endian qword.
    let width = (hi - lo) * 8;
    let ones = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
    ones << (lo * 8)
}

impl HostRegion {
    /// Zeroed region of `len` bytes (rounded up to a qword) at `device_addr`.
    pub fn new(device_addr: u64, len: u64, kind: MemoryKind) -> Self {
        let words = (0..len.div_ceil(8)).map(|_| AtomicU64::new(0)).collect();
        Self {
            inner: Arc::new(RegionInner {
                device_addr,
                len,
                kind,
                words,
            }),
        }
    }

    pub fn device_addr(&self) -> u64 {
        self.inner.device_addr
    }

    pub fn len(&self) -> u64 {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn kind(&self) -> MemoryKind {
        self.inner.kind
    }

    pub fn same_region(&self, other: &HostRegion) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Region offset of `[addr, addr + len)` if it lies entirely inside.
    pub fn offset_of(&self, addr: u64, len: u64) -> Option<u64> {
        let off = addr.checked_sub(self.inner.device_addr)?;
        let end = off.checked_add(len)?;
        (end <= self.inner.len).then_some(off)
    }

    fn word(&self, offset: u64) -> &AtomicU64 {
        &self.inner.words[(offset / 8) as usize]
    }

    fn check(&self, offset: u64, len: u64, align: u64) {
        assert!(
            offset % align == 0 && offset + len <= self.inner.len,
            "region access {offset:#x}+{len} out of bounds or misaligned (len {})",
            self.inner.len
        );
    }

    pub fn load_u32(&self, offset: u64, order: Ordering) -> u32 {
        self.check(offset, 4, 4);
        let shift = (offset % 8) * 8;
        (self.word(offset).load(order) >> shift) as u32
    }

    pub fn store_u32(&self, offset: u64, value: u32, order: Ordering) {
        self.check(offset, 4, 4);
        let shift = (offset % 8) * 8;
        let mask = 0xFFFF_FFFFu64 << shift;
        let load = match order {
            Ordering::SeqCst => Ordering::SeqCst,
            _ => Ordering::Relaxed,
        };
        let _ = self.word(offset).fetch_update(order, load, |old| {
            Some((old & !mask) | (u64::from(value) << shift))
        });
    }

    pub fn load_u64(&self, offset: u64, order: Ordering) -> u64 {
        self.check(offset, 8, 8);
        self.word(offset).load(order)
    }

    pub fn store_u64(&self, offset: u64, value: u64, order: Ordering) {
        self.check(offset, 8, 8);
        self.word(offset).store(value, order);
    }

    pub fn fetch_add_u64(&self, offset: u64, value: u64, order: Ordering) -> u64 {
        self.check(offset, 8, 8);
        self.word(offset).fetch_add(value, order)
    }

    /// Relaxed dword stores starting at a 4-byte aligned offset.
    pub fn write_dwords(&self, offset: u64, dwords: &[u32]) {
        self.check(offset, dwords.len() as u64 * 4, 4);
        let mut off = offset;
        let mut rest = dwords;
        if off % 8 == 4 {
            if let Some((&first, tail)) = rest.split_first() {
                self.store_u32(off, first, Ordering::Relaxed);
                off += 4;
                rest = tail;
            }
        }
        let mut pairs = rest.chunks_exact(2);
        for pair in &mut pairs {
            let qword = u64::from(pair[0]) | u64::from(pair[1]) << 32;
            self.word(off).store(qword, Ordering::Relaxed);
            off += 8;
        }
        if let [last] = pairs.remainder() {
            self.store_u32(off, *last, Ordering::Relaxed);
        }
    }

    pub fn read_dwords(&self, offset: u64, out: &mut [u32]) {
        self.check(offset, out.len() as u64 * 4, 4);
        for (i, dw) in out.iter_mut().enumerate() {
            *dw = self.load_u32(offset + i as u64 * 4, Ordering::Relaxed);
        }
    }

    /// Relaxed byte copy out of the region.
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) {
        self.check(offset, out.len() as u64, 1);
        let mut pos = 0usize;
        while pos < out.len() {
            let at = offset + pos as u64;
            let lo = (at % 8) as usize;
            let take = (8 - lo).min(out.len() - pos);
            let bytes = self.word(at).load(Ordering::Relaxed).to_le_bytes();
            out[pos..pos + take].copy_from_slice(&bytes[lo..lo + take]);
            pos += take;
        }
    }

    /// Relaxed byte copy into the region. Partially covered qwords are merged
    /// atomically so neighbouring bytes are never clobbered.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) {
        self.check(offset, data.len() as u64, 1);
        let mut pos = 0usize;
        while pos < data.len() {
            let at = offset + pos as u64;
            let lo = (at % 8) as usize;
            let take = (8 - lo).min(data.len() - pos);
            let mut bytes = [0u8; 8];
            bytes[lo..lo + take].copy_from_slice(&data[pos..pos + take]);
            let value = u64::from_le_bytes(bytes);
            if take == 8 {
                self.word(at).store(value, Ordering::Relaxed);
            } else {
                let mask = byte_mask(lo, lo + take);
                let _ = self
                    .word(at)
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                        Some((old & !mask) | value)
                    });
            }
            pos += take;
        }
    }

    /// Fill `bytes` bytes (a dword multiple) with a repeated 32-bit pattern.
    pub fn fill_u32(&self, offset: u64, value: u32, bytes: u64) {
        self.check(offset, bytes, 4);
        assert_eq!(bytes % 4, 0);
        let pattern = u64::from(value) | u64::from(value) << 32;
        let mut off = offset;
        let end = offset + bytes;
        if off % 8 == 4 && off < end {
            self.store_u32(off, value, Ordering::Relaxed);
            off += 4;
        }
        while off + 8 <= end {
            self.word(off).store(pattern, Ordering::Relaxed);
            off += 8;
        }
        if off < end {
            self.store_u32(off, value, Ordering::Relaxed);
        }
    }
}

/// Every live region, keyed by device address. The simulated engine resolves
/// packet addresses through this map.
#[derive(Default)]
pub struct AddressSpace {
    regions: RwLock<BTreeMap<u64, HostRegion>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, region: HostRegion) {
        let mut map = self.regions.write().unwrap_or_else(|e| e.into_inner());
        map.insert(region.device_addr(), region);
    }

    pub fn remove(&self, device_addr: u64) -> Option<HostRegion> {
        let mut map = self.regions.write().unwrap_or_else(|e| e.into_inner());
        map.remove(&device_addr)
    }

    pub fn len(&self) -> usize {
        self.regions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Region containing `[addr, addr + len)` and the offset of `addr` in it.
    pub fn resolve(&self, addr: u64, len: u64) -> Result<(HostRegion, u64), MemoryError> {
        let map = self.regions.read().unwrap_or_else(|e| e.into_inner());
        let (_, region) = map
            .range(..=addr)
            .next_back()
            .ok_or(MemoryError::Unmapped { addr, len })?;
        let off = region
            .offset_of(addr, len)
            .ok_or(MemoryError::Unmapped { addr, len })?;
        Ok((region.clone(), off))
    }

    fn resolve_aligned(&self, addr: u64, len: u64) -> Result<(HostRegion, u64), MemoryError> {
        if addr % len != 0 {
            return Err(MemoryError::Misaligned { addr, align: len });
        }
        self.resolve(addr, len)
    }

    pub fn read_bytes(&self, addr: u64, out: &mut [u8]) -> Result<(), MemoryError> {
        let (region, off) = self.resolve(addr, out.len() as u64)?;
        region.read_bytes(off, out);
        Ok(())
    }

    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let (region, off) = self.resolve(addr, data.len() as u64)?;
        region.write_bytes(off, data);
        Ok(())
    }

    pub fn fill_u32(&self, addr: u64, value: u32, bytes: u64) -> Result<(), MemoryError> {
        if addr % 4 != 0 {
            return Err(MemoryError::Misaligned { addr, align: 4 });
        }
        let (region, off) = self.resolve(addr, bytes)?;
        region.fill_u32(off, value, bytes);
        Ok(())
    }

    pub fn load_u32(&self, addr: u64, order: Ordering) -> Result<u32, MemoryError> {
        let (region, off) = self.resolve_aligned(addr, 4)?;
        Ok(region.load_u32(off, order))
    }

    pub fn store_u32(&self, addr: u64, value: u32, order: Ordering) -> Result<(), MemoryError> {
        let (region, off) = self.resolve_aligned(addr, 4)?;
        region.store_u32(off, value, order);
        Ok(())
    }

    pub fn store_u64(&self, addr: u64, value: u64, order: Ordering) -> Result<(), MemoryError> {
        let (region, off) = self.resolve_aligned(addr, 8)?;
        region.store_u64(off, value, order);
        Ok(())
    }

    pub fn fetch_add_u64(&self, addr: u64, value: u64, order: Ordering) -> Result<u64, MemoryError> {
        let (region, off) = self.resolve_aligned(addr, 8)?;
        Ok(region.fetch_add_u64(off, value, order))
    }
}

/// Source of host-and-device-visible memory. Allocation policy lives behind
/// this trait; the engine only asks for page-aligned blocks.
pub trait MemoryAllocator: Send + Sync {
    fn allocate(&self, size: u64, kind: MemoryKind) -> Result<HostRegion, MemoryError>;
    fn free(&self, region: &HostRegion);
}

const SYSTEM_ALLOCATOR_BASE: u64 = 0x0000_1000_0000_0000;

/// Page-granular bump allocator that registers every region in a shared
/// [`AddressSpace`]. Freed address ranges are not reused.
pub struct SystemAllocator {
    space: Arc<AddressSpace>,
    next: AtomicU64,
    live_bytes: AtomicU64,
    limit: u64,
}

impl SystemAllocator {
    pub fn new(space: Arc<AddressSpace>) -> Self {
        Self::with_limit(space, u64::MAX)
    }

    /// Fail allocations once `limit` bytes are live.
    pub fn with_limit(space: Arc<AddressSpace>, limit: u64) -> Self {
        Self {
            space,
            next: AtomicU64::new(SYSTEM_ALLOCATOR_BASE),
            live_bytes: AtomicU64::new(0),
            limit,
        }
    }

    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn live_allocations(&self) -> usize {
        self.space.len()
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::Acquire)
    }
}

impl MemoryAllocator for SystemAllocator {
    fn allocate(&self, size: u64, kind: MemoryKind) -> Result<HostRegion, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        let span = size
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(MemoryError::InvalidSize(size))?;
        let reserved = self
            .live_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                live.checked_add(span).filter(|&total| total <= self.limit)
            });
        if reserved.is_err() {
            return Err(MemoryError::OutOfMemory { requested: size });
        }
        // One guard page between allocations keeps off-by-one device accesses
        // from landing in a neighbour.
        let addr = self.next.fetch_add(span + PAGE_SIZE, Ordering::Relaxed);
        let region = HostRegion::new(addr, size, kind);
        self.space.insert(region.clone());
        tracing::trace!(addr, size, ?kind, "allocated region");
        Ok(region)
    }

    fn free(&self, region: &HostRegion) {
        if self.space.remove(region.device_addr()).is_some() {
            let span = region.len().next_multiple_of(PAGE_SIZE);
            self.live_bytes.fetch_sub(span, Ordering::AcqRel);
        }
    }
}
