//! Monotonic high-resolution counters
//!
//! The reference clock never reads wall time directly. It asks a [`Counter`]
//! for raw ticks and the tick frequency, which keeps the clock arithmetic
//! independent of the platform timer and lets tests drive time by hand.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of monotonic ticks.
pub trait Counter: Send + Sync {
    /// Current counter value in ticks. Never decreases.
    fn now(&self) -> i64;

    /// Ticks per second. Constant for the lifetime of the counter.
    fn frequency(&self) -> i64;
}

/// Nanosecond counter backed by `std::time::Instant`
#[derive(Debug, Clone, Copy)]
pub struct SystemCounter {
    epoch: Instant,
}

impl SystemCounter {
    pub const FREQUENCY: i64 = 1_000_000_000;

    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Counter for SystemCounter {
    fn now(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }

    fn frequency(&self) -> i64 {
        Self::FREQUENCY
    }
}

/// Counter that only moves when told to.
///
/// Clones share the same value, so a test can keep one handle and give the
/// other to a clock.
#[derive(Debug, Clone)]
pub struct ManualCounter {
    ticks: Arc<AtomicI64>,
    frequency: i64,
}

impl ManualCounter {
    pub fn new(frequency: i64) -> Self {
        assert!(frequency > 0, "counter frequency must be positive");
        Self {
            ticks: Arc::new(AtomicI64::new(0)),
            frequency,
        }
    }

    /// Move the counter forward by `ticks`
    pub fn advance(&self, ticks: i64) {
        self.ticks.fetch_add(ticks.max(0), Ordering::SeqCst);
    }

    /// Jump to an absolute value; ignored if it would move backward
    pub fn set(&self, ticks: i64) {
        self.ticks.fetch_max(ticks, Ordering::SeqCst);
    }
}

impl Counter for ManualCounter {
    fn now(&self) -> i64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn frequency(&self) -> i64 {
        self.frequency
    }
}

/// Convert a tick count to a `Duration`, clamping negatives to zero
pub fn ticks_to_duration(ticks: i64, frequency: i64) -> Duration {
    if ticks <= 0 || frequency <= 0 {
        return Duration::ZERO;
    }
    let nanos = (ticks as i128 * 1_000_000_000) / frequency as i128;
    Duration::from_nanos(nanos.min(u64::MAX as i128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_counter_monotonic() {
        let counter = SystemCounter::new();
        let a = counter.now();
        std::thread::sleep(Duration::from_millis(2));
        let b = counter.now();
        assert!(b > a);
        assert_eq!(counter.frequency(), 1_000_000_000);
    }

    #[test]
    fn test_manual_counter_shared() {
        let counter = ManualCounter::new(10_000_000);
        let handle = counter.clone();
        handle.advance(500);
        assert_eq!(counter.now(), 500);

        handle.set(100); // backward, ignored
        assert_eq!(counter.now(), 500);
        handle.set(2_000);
        assert_eq!(counter.now(), 2_000);
    }

    #[test]
    fn test_ticks_to_duration() {
        assert_eq!(ticks_to_duration(10_000_000, 10_000_000), Duration::from_secs(1));
        assert_eq!(ticks_to_duration(166_666, 10_000_000), Duration::from_nanos(16_666_600));
        assert_eq!(ticks_to_duration(-5, 10_000_000), Duration::ZERO);
    }
}
