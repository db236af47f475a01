use std::hint;
use std::thread;

const SPIN_LIMIT: u32 = 6;

/// Busy-wait helper: spins with exponentially more `spin_loop` hints, then
/// yields the processor on every further step. Never blocks.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                hint::spin_loop();
            }
            self.step += 1;
        } else {
            thread::yield_now();
        }
    }

    /// Spin until `done` holds. Loops that do more than test a condition
    /// between steps drive [`snooze`](Self::snooze) themselves.
    pub(crate) fn spin_until(mut done: impl FnMut() -> bool) {
        let mut backoff = Self::new();
        while !done() {
            backoff.snooze();
        }
    }
}
