//! Wall clocks for stamping records and audit entries.
//!
//! The engine never reads the system time directly. Everything goes through a
//! [`Clock`] so tests can drive time explicitly.

use crate::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of millisecond timestamps.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in milliseconds since the Unix epoch.
    fn now(&self) -> Timestamp;
}

/// Clock backed by the host's system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis().max(0) as Timestamp
    }
}

/// A manually driven clock.
///
/// Each call to [`Clock::now`] returns the current value and then advances it
/// by `step` milliseconds, so successive mutations get strictly increasing
/// timestamps unless `step` is zero.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<AtomicU64>,
    step: u64,
}

impl ManualClock {
    /// Create a clock starting at `start` that advances 1ms per reading.
    pub fn new(start: Timestamp) -> Self {
        Self::with_step(start, 1)
    }

    /// Create a clock with a custom step.
    pub fn with_step(start: Timestamp, step: u64) -> Self {
        Self {
            current: Arc::new(AtomicU64::new(start)),
            step,
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, at: Timestamp) {
        self.current.store(at, Ordering::SeqCst);
    }

    /// Move the clock forward.
    pub fn advance(&self, by: u64) {
        self.current.fetch_add(by, Ordering::SeqCst);
    }

    /// Peek without advancing.
    pub fn peek(&self) -> Timestamp {
        self.current.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.current.fetch_add(self.step, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_per_reading() {
        let clock = ManualClock::new(1000);
        assert_eq!(clock.now(), 1000);
        assert_eq!(clock.now(), 1001);
        assert_eq!(clock.peek(), 1002);
    }

    #[test]
    fn manual_clock_set_and_advance() {
        let clock = ManualClock::with_step(0, 0);
        clock.set(5000);
        assert_eq!(clock.now(), 5000);
        assert_eq!(clock.now(), 5000);
        clock.advance(250);
        assert_eq!(clock.now(), 5250);
    }

    #[test]
    fn clones_share_time() {
        let clock = ManualClock::new(10);
        let other = clock.clone();
        clock.advance(90);
        assert_eq!(other.peek(), 100);
    }

    #[test]
    fn system_clock_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now() > 1_577_836_800_000);
    }
}
