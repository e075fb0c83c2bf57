//! Monotonic microsecond timestamps.
//!
//! Every deadline in the loop is an absolute `CLOCK_MONOTONIC` time in
//! microseconds, so the alarm and the clock must share a timebase.

use std::time::{Duration, Instant};

/// Source of monotonically non-decreasing microsecond timestamps.
pub trait Clock: Send + Sync {
    /// Current time in microseconds.
    fn now_micros(&self) -> u64;
}

/// `CLOCK_MONOTONIC` in microseconds. Unaffected by wall-clock adjustments.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
    origin_us: u64,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    /// Create a clock handle.
    #[must_use]
    pub fn new() -> Self {
        let origin = Instant::now();
        Self {
            origin,
            origin_us: read_monotonic().unwrap_or(0),
        }
    }

    fn fallback(&self) -> u64 {
        self.origin_us + duration_to_micros(self.origin.elapsed())
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now_micros(&self) -> u64 {
        read_monotonic().unwrap_or_else(|| self.fallback())
    }
}

#[cfg(unix)]
fn read_monotonic() -> Option<u64> {
    use nix::time::{clock_gettime, ClockId};

    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).ok()?;
    let secs = u64::try_from(ts.tv_sec()).ok()?;
    let nanos = u64::try_from(ts.tv_nsec()).ok()?;
    Some(secs * 1_000_000 + nanos / 1_000)
}

#[cfg(not(unix))]
fn read_monotonic() -> Option<u64> {
    None
}

/// Saturating `Duration` to microseconds.
#[must_use]
pub fn duration_to_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_never_decreases() {
        let clock = MonotonicClock::new();
        let mut last = clock.now_micros();
        for _ in 0..1000 {
            let now = clock.now_micros();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_monotonic_tracks_sleep() {
        let clock = MonotonicClock::new();
        let start = clock.now_micros();
        std::thread::sleep(Duration::from_millis(5));
        assert!(clock.now_micros() - start >= 5_000);
    }

    #[test]
    fn test_duration_to_micros_saturates() {
        assert_eq!(duration_to_micros(Duration::from_millis(20)), 20_000);
        assert_eq!(duration_to_micros(Duration::MAX), u64::MAX);
    }
}
