//! Time sources for the scheduler.
//!
//! Production code uses [`SystemClock`]. Tests and the simulator use
//! [`ManualClock`], where time only advances when explicitly told to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
}

/// Clock backed by `Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Virtual clock advanced by hand. Shareable across threads.
#[derive(Debug)]
pub struct ManualClock {
    anchor: Instant,
    elapsed_us: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
            elapsed_us: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        let us = u64::try_from(by.as_micros()).unwrap_or(u64::MAX);
        self.elapsed_us.fetch_add(us, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.elapsed_us.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.anchor + self.elapsed()
    }
}
