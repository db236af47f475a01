//! Approximate accounting of bytes submitted but not yet drained.
//!
//! Every publish appends `(end_index, cumulative_bytes)` to a fixed-size log.
//! Appends happen only inside the commit sequencer's ordered section, so the
//! log is monotonic in ring order and has a single writer at a time. Entries
//! are seqlocked so readers can scan without blocking; an entry that was
//! overwritten while being read is treated as unknown.
//!
//! The estimate may be larger than the true figure (an aged-out window, a
//! submission counted both in progress and in the log) but never smaller.

use std::sync::atomic::{fence, AtomicU64, Ordering};

struct Entry {
    /// `2 * n + 2` once append number `n` is complete; odd while writing.
    seq: AtomicU64,
    end: AtomicU64,
    cumulative: AtomicU64,
}

impl Entry {
    fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            end: AtomicU64::new(0),
            cumulative: AtomicU64::new(0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Sample {
    end: u64,
    cumulative: u64,
}

pub struct PendingBytesLog {
    entries: Box<[Entry]>,
    mask: u64,
    appended: AtomicU64,
    cumulative: AtomicU64,
    in_progress: AtomicU64,
}

impl PendingBytesLog {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        Self {
            entries: (0..capacity).map(|_| Entry::new()).collect(),
            mask: capacity as u64 - 1,
            appended: AtomicU64::new(0),
            cumulative: AtomicU64::new(0),
            in_progress: AtomicU64::new(0),
        }
    }

    /// Log capacity for a ring: at least one entry per 16 ring bytes.
    pub fn capacity_for_ring(ring_size: u64) -> usize {
        ((ring_size / 16) as usize).next_power_of_two().max(64)
    }

    /// A submission of `bytes` payload bytes is about to reserve ring space.
    pub fn begin(&self, bytes: u64) {
        self.in_progress.fetch_add(bytes, Ordering::AcqRel);
    }

    /// The submission started with [`begin`](Self::begin) has been published
    /// (or abandoned before reserving).
    pub fn end(&self, bytes: u64) {
        self.in_progress.fetch_sub(bytes, Ordering::Release);
    }

    /// Record a published range ending at `end_index`. Callers serialize
    /// appends (the commit sequencer does).
    pub(crate) fn append(&self, end_index: u64, bytes: u64) {
        let n = self.appended.load(Ordering::Relaxed);
        let cumulative = self.cumulative.load(Ordering::Relaxed) + bytes;
        let entry = &self.entries[(n & self.mask) as usize];

        entry.seq.store(2 * n + 1, Ordering::Relaxed);
        fence(Ordering::Release);
        entry.end.store(end_index, Ordering::Relaxed);
        entry.cumulative.store(cumulative, Ordering::Relaxed);
        entry.seq.store(2 * n + 2, Ordering::Release);

        self.cumulative.store(cumulative, Ordering::Relaxed);
        self.appended.store(n + 1, Ordering::Release);
    }

    /// Sample for append number `n`, or `None` if it has been (or is being)
    /// overwritten by a newer append.
    fn read(&self, n: u64) -> Option<Sample> {
        let entry = &self.entries[(n & self.mask) as usize];
        let expected = 2 * n + 2;
        if entry.seq.load(Ordering::Acquire) != expected {
            return None;
        }
        let sample = Sample {
            end: entry.end.load(Ordering::Relaxed),
            cumulative: entry.cumulative.load(Ordering::Relaxed),
        };
        fence(Ordering::Acquire);
        (entry.seq.load(Ordering::Relaxed) == expected).then_some(sample)
    }

    /// Upper bound on bytes not yet drained, given the engine's current
    /// monotonic read index.
    pub fn pending(&self, read_index: u64) -> u64 {
        let in_progress = self.in_progress.load(Ordering::Acquire);
        let appended = self.appended.load(Ordering::Acquire);
        if appended == 0 {
            return in_progress;
        }

        let Some(newest) = self.read(appended - 1) else {
            // Overwritten under us: the log moved on, count everything.
            return in_progress + self.cumulative.load(Ordering::Relaxed);
        };

        let oldest = appended.saturating_sub(self.mask + 1);
        let mut drained = 0;
        for n in (oldest..appended).rev() {
            match self.read(n) {
                Some(sample) if sample.end <= read_index => {
                    drained = sample.cumulative;
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        in_progress + newest.cumulative - drained
    }
}
