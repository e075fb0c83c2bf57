//! Simulated time.
//!
//! [`SimClock`] only moves when told to, and [`SimAlarm`] "waits" by
//! jumping the clock to the armed deadline. Loops driven by the pair run
//! as fast as the host allows while every timestamp stays exact, which
//! is what simulation mode and the timing tests need.

use crate::alarm::{Alarm, WaitOutcome};
use cadence_common::error::LoopResult;
use cadence_common::time::Clock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Shared, manually advanced microsecond clock.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now_us: Arc<AtomicU64>,
}

impl SimClock {
    /// Create a clock reading `start_us`.
    #[must_use]
    pub fn new(start_us: u64) -> Self {
        Self {
            now_us: Arc::new(AtomicU64::new(start_us)),
        }
    }

    /// Move the clock forward by `delta_us`.
    pub fn advance(&self, delta_us: u64) {
        self.now_us.fetch_add(delta_us, Ordering::AcqRel);
    }

    /// Move the clock to `target_us` unless it is already later.
    pub fn advance_to(&self, target_us: u64) {
        self.now_us.fetch_max(target_us, Ordering::AcqRel);
    }
}

impl Clock for SimClock {
    fn now_micros(&self) -> u64 {
        self.now_us.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct SimAlarmState {
    armed: Option<u64>,
    canceled: bool,
    arm_history: Vec<u64>,
    waits: u64,
    cancels: u64,
}

/// Alarm that completes waits instantly by advancing a [`SimClock`].
#[derive(Debug)]
pub struct SimAlarm {
    name: String,
    clock: SimClock,
    state: Mutex<SimAlarmState>,
}

impl SimAlarm {
    /// Create an alarm driving `clock`.
    #[must_use]
    pub fn new(name: &str, clock: SimClock) -> Self {
        Self {
            name: name.to_owned(),
            clock,
            state: Mutex::new(SimAlarmState::default()),
        }
    }

    /// Every deadline passed to `arm`, in order.
    #[must_use]
    pub fn arm_history(&self) -> Vec<u64> {
        self.lock().arm_history.clone()
    }

    /// Number of completed `wait` calls.
    #[must_use]
    pub fn wait_count(&self) -> u64 {
        self.lock().waits
    }

    /// Number of `cancel` calls.
    #[must_use]
    pub fn cancel_count(&self) -> u64 {
        self.lock().cancels
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimAlarmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Alarm for SimAlarm {
    fn name(&self) -> &str {
        &self.name
    }

    fn arm(&self, deadline_us: u64) -> LoopResult<()> {
        let mut state = self.lock();
        state.armed = Some(deadline_us);
        state.arm_history.push(deadline_us);
        Ok(())
    }

    fn wait(&self) -> WaitOutcome {
        let mut state = self.lock();
        state.waits += 1;
        if state.canceled {
            return WaitOutcome::Canceled;
        }
        match state.armed.take() {
            Some(deadline) => {
                self.clock.advance_to(deadline);
                WaitOutcome::Fired
            }
            None => {
                // Simulated time cannot block forever
                warn!(name = %self.name, "Wait on unarmed simulated alarm");
                WaitOutcome::Canceled
            }
        }
    }

    fn cancel(&self) {
        let mut state = self.lock();
        state.canceled = true;
        state.cancels += 1;
    }
}
