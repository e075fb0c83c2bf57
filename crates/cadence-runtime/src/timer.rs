//! Deadline pacing with drift-free catch-up.
//!
//! [`PeriodicTimer`] keeps one strictly increasing deadline counter.
//! Each wait advances it by exactly one period, so the long-run rate
//! matches the period even when single cycles slip. When the caller is
//! already past the deadline the counter snaps to "now" instead of
//! queuing a burst of back-to-back catch-up cycles.

use crate::alarm::{Alarm, WaitOutcome};
use cadence_common::error::{LoopError, LoopResult};
use cadence_common::time::{duration_to_micros, Clock};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of [`PeriodicTimer::wait_next`] for a cycle that should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wake {
    /// Time the cycle was scheduled to start.
    pub scheduled_us: u64,
    /// The deadline had already passed and was dropped.
    pub late: bool,
}

/// Fixed-period deadline pacer over an [`Alarm`].
pub struct PeriodicTimer {
    period_us: u64,
    /// 0 until the first wait.
    next_deadline_us: u64,
    clock: Arc<dyn Clock>,
    /// `None` once closed.
    alarm: Option<Arc<dyn Alarm>>,
}

impl PeriodicTimer {
    /// Create a timer with the given period.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Config`] for a period shorter than 1us.
    pub fn new(
        period: Duration,
        clock: Arc<dyn Clock>,
        alarm: Arc<dyn Alarm>,
    ) -> LoopResult<Self> {
        let period_us = duration_to_micros(period);
        if period_us == 0 {
            return Err(LoopError::Config("period must be at least 1us".into()));
        }
        Ok(Self {
            period_us,
            next_deadline_us: 0,
            clock,
            alarm: Some(alarm),
        })
    }

    /// Configured period in microseconds.
    #[must_use]
    pub fn period_us(&self) -> u64 {
        self.period_us
    }

    /// Next deadline, or 0 before the first wait.
    #[must_use]
    pub fn next_deadline_us(&self) -> u64 {
        self.next_deadline_us
    }

    /// Block until the next deadline.
    ///
    /// Returns `Ok(None)` if the alarm was canceled while waiting.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::TimerClosed`] after [`close`](Self::close), or
    /// [`LoopError::Alarm`] if the alarm cannot be armed.
    pub fn wait_next(&mut self) -> LoopResult<Option<Wake>> {
        let Some(alarm) = &self.alarm else {
            return Err(LoopError::TimerClosed);
        };

        let now = self.clock.now_micros();
        let wake = if self.next_deadline_us < now {
            if self.next_deadline_us != 0 {
                debug!(
                    missed_by_us = now - self.next_deadline_us,
                    "Deadline already passed, starting cycle immediately"
                );
            }
            let late = self.next_deadline_us != 0;
            self.next_deadline_us = now;
            Wake {
                scheduled_us: now,
                late,
            }
        } else {
            alarm.arm(self.next_deadline_us)?;
            if alarm.wait() == WaitOutcome::Canceled {
                return Ok(None);
            }
            Wake {
                scheduled_us: self.next_deadline_us,
                late: false,
            }
        };

        self.next_deadline_us += self.period_us;
        Ok(Some(wake))
    }

    /// Release this timer's share of the alarm and refuse further waits.
    /// Idempotent.
    ///
    /// Waits take `&mut self`, so no wait can be in progress here. The OS
    /// resource is freed once no other strong reference remains.
    pub fn close(&mut self) {
        if let Some(alarm) = self.alarm.take() {
            info!(alarm = alarm.name(), "Periodic timer closed");
        }
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.alarm.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimAlarm, SimClock};

    const P: u64 = 20_000;

    fn sim_timer(start_us: u64) -> (PeriodicTimer, SimClock, Arc<SimAlarm>) {
        let clock = SimClock::new(start_us);
        let alarm = Arc::new(SimAlarm::new("timer", clock.clone()));
        let timer = PeriodicTimer::new(
            Duration::from_micros(P),
            Arc::new(clock.clone()),
            alarm.clone(),
        )
        .unwrap();
        (timer, clock, alarm)
    }

    #[test]
    fn test_first_wait_starts_immediately() {
        let (mut timer, _clock, alarm) = sim_timer(1_000_000);
        let wake = timer.wait_next().unwrap().unwrap();

        assert_eq!(wake.scheduled_us, 1_000_000);
        assert!(!wake.late);
        assert_eq!(timer.next_deadline_us(), 1_000_000 + P);
        assert!(alarm.arm_history().is_empty());
    }

    #[test]
    fn test_steady_cadence_without_drift() {
        let (mut timer, clock, _alarm) = sim_timer(1_000_000);
        let mut wakes = Vec::new();
        for _ in 0..51 {
            wakes.push(timer.wait_next().unwrap().unwrap().scheduled_us);
            clock.advance(5_000);
        }

        assert_eq!(wakes[50] - wakes[0], 50 * P);
        for pair in wakes.windows(2) {
            assert_eq!(pair[1] - pair[0], P);
        }
    }

    #[test]
    fn test_overrun_resets_instead_of_bursting() {
        let (mut timer, clock, alarm) = sim_timer(0);
        clock.advance(1);
        let first = timer.wait_next().unwrap().unwrap().scheduled_us;

        // Work takes three periods
        clock.advance(3 * P);
        let late = timer.wait_next().unwrap().unwrap();
        assert!(late.late);
        assert_eq!(late.scheduled_us, first + 3 * P);
        assert_eq!(timer.next_deadline_us(), late.scheduled_us + P);

        let next = timer.wait_next().unwrap().unwrap();
        assert_eq!(next.scheduled_us, late.scheduled_us + P);
        assert_eq!(alarm.arm_history(), vec![late.scheduled_us + P]);
    }

    #[test]
    fn test_cancel_returns_none() {
        let (mut timer, _clock, alarm) = sim_timer(100);
        timer.wait_next().unwrap();
        alarm.cancel();
        assert_eq!(timer.wait_next().unwrap(), None);
    }

    #[test]
    fn test_wait_after_close_fails() {
        let (mut timer, _clock, alarm) = sim_timer(100);
        assert_eq!(Arc::strong_count(&alarm), 2);
        timer.close();
        timer.close();
        assert!(timer.is_closed());
        assert_eq!(Arc::strong_count(&alarm), 1);
        assert_eq!(alarm.cancel_count(), 0);
        assert_eq!(timer.wait_next(), Err(LoopError::TimerClosed));
    }

    #[test]
    fn test_zero_period_rejected() {
        let clock = SimClock::new(0);
        let alarm = Arc::new(SimAlarm::new("timer", clock.clone()));
        let result = PeriodicTimer::new(Duration::from_nanos(500), Arc::new(clock), alarm);
        assert!(matches!(result, Err(LoopError::Config(_))));
    }
}
