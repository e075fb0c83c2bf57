//! Blocking alarm primitives.
//!
//! An alarm is armed with an absolute monotonic deadline (microseconds)
//! and blocks the loop thread in [`Alarm::wait`] until the deadline passes
//! or another thread calls [`Alarm::cancel`]. Cancellation is sticky:
//! every later wait returns [`WaitOutcome::Canceled`] immediately, so a
//! cancel that races ahead of the wait is never lost.
//!
//! Creation is the constructor and release is `Drop`; the OS resource is
//! freed exactly once, when the last owner goes away.

use cadence_common::config::AlarmKind;
use cadence_common::error::{LoopError, LoopResult};
use cadence_common::time::{Clock, MonotonicClock};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a blocking alarm wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The armed deadline passed.
    Fired,
    /// The alarm was canceled; the loop must shut down.
    Canceled,
}

/// A one-shot, re-armable alarm on the monotonic timebase.
pub trait Alarm: Send + Sync {
    /// Alarm name for diagnostics.
    fn name(&self) -> &str;

    /// Set the absolute deadline for the next [`wait`](Alarm::wait).
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Alarm`] if the OS rejects the deadline.
    fn arm(&self, deadline_us: u64) -> LoopResult<()>;

    /// Block until the armed deadline passes or the alarm is canceled.
    ///
    /// A failing wait reports [`WaitOutcome::Canceled`].
    fn wait(&self) -> WaitOutcome;

    /// Wake any blocked waiter with [`WaitOutcome::Canceled`]. Idempotent.
    fn cancel(&self);
}

/// Create the alarm selected by `kind`, paired with [`MonotonicClock`].
///
/// # Errors
///
/// Returns [`LoopError::AlarmCreate`] if the OS primitive cannot be allocated.
pub fn create_alarm(kind: AlarmKind, name: &str) -> LoopResult<Arc<dyn Alarm>> {
    match kind {
        #[cfg(target_os = "linux")]
        AlarmKind::Native => Ok(Arc::new(TimerFdAlarm::new(name)?)),
        #[cfg(not(target_os = "linux"))]
        AlarmKind::Native => Ok(Arc::new(CondvarAlarm::new(
            name,
            Arc::new(MonotonicClock::new()),
        ))),
        AlarmKind::Condvar => Ok(Arc::new(CondvarAlarm::new(
            name,
            Arc::new(MonotonicClock::new()),
        ))),
    }
}

#[derive(Debug, Default)]
struct CondvarState {
    deadline_us: Option<u64>,
    canceled: bool,
}

/// Portable alarm built on `Mutex` + `Condvar`, timed against any [`Clock`].
pub struct CondvarAlarm {
    name: String,
    clock: Arc<dyn Clock>,
    state: Mutex<CondvarState>,
    wakeup: Condvar,
}

impl CondvarAlarm {
    /// Create an alarm measuring deadlines with `clock`.
    pub fn new(name: &str, clock: Arc<dyn Clock>) -> Self {
        debug!(name, "Created condvar alarm");
        Self {
            name: name.to_owned(),
            clock,
            state: Mutex::new(CondvarState::default()),
            wakeup: Condvar::new(),
        }
    }
}

impl Alarm for CondvarAlarm {
    fn name(&self) -> &str {
        &self.name
    }

    fn arm(&self, deadline_us: u64) -> LoopResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.deadline_us = Some(deadline_us);
        self.wakeup.notify_all();
        Ok(())
    }

    fn wait(&self) -> WaitOutcome {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.canceled {
                return WaitOutcome::Canceled;
            }
            match state.deadline_us {
                // Nothing armed: sleep until armed or canceled
                None => {
                    state = self
                        .wakeup
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = self.clock.now_micros();
                    if now >= deadline {
                        state.deadline_us = None;
                        return WaitOutcome::Fired;
                    }
                    let (guard, _) = self
                        .wakeup
                        .wait_timeout(state, Duration::from_micros(deadline - now))
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
            }
        }
    }

    fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.canceled = true;
        self.wakeup.notify_all();
    }
}

/// Linux alarm: absolute `CLOCK_MONOTONIC` timerfd, plus an eventfd that
/// makes cancellation visible to `poll`.
#[cfg(target_os = "linux")]
pub struct TimerFdAlarm {
    name: String,
    timer: nix::sys::timerfd::TimerFd,
    cancel: nix::sys::eventfd::EventFd,
}

#[cfg(target_os = "linux")]
impl TimerFdAlarm {
    /// Allocate the timerfd and eventfd.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::AlarmCreate`] if either descriptor cannot be created.
    pub fn new(name: &str) -> LoopResult<Self> {
        use nix::sys::eventfd::{EfdFlags, EventFd};
        use nix::sys::timerfd::{ClockId, TimerFd, TimerFlags};

        let create_err = |e: nix::Error| LoopError::AlarmCreate {
            name: name.to_owned(),
            reason: e.to_string(),
        };

        // Non-blocking: a readable timerfd can be emptied by a re-arm before the read
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_CLOEXEC | TimerFlags::TFD_NONBLOCK,
        )
        .map_err(create_err)?;
        let cancel = EventFd::from_flags(EfdFlags::EFD_CLOEXEC).map_err(create_err)?;

        debug!(name, "Created timerfd alarm");
        Ok(Self {
            name: name.to_owned(),
            timer,
            cancel,
        })
    }

    /// Consume a pending expiration. `None` if there was nothing to read.
    fn read_expiration(&self) -> Option<WaitOutcome> {
        use nix::errno::Errno;

        match self.timer.wait() {
            Ok(()) => Some(WaitOutcome::Fired),
            Err(Errno::EAGAIN) => None,
            Err(e) => {
                warn!(name = %self.name, error = %e, "timerfd read failed, treating as canceled");
                Some(WaitOutcome::Canceled)
            }
        }
    }
}

#[cfg(target_os = "linux")]
impl Alarm for TimerFdAlarm {
    fn name(&self) -> &str {
        &self.name
    }

    fn arm(&self, deadline_us: u64) -> LoopResult<()> {
        use nix::sys::time::TimeSpec;
        use nix::sys::timerfd::{Expiration, TimerSetTimeFlags};

        // An all-zero it_value disarms a timerfd; deadline 0 is already past anyway
        let deadline = TimeSpec::from_duration(Duration::from_micros(deadline_us.max(1)));
        self.timer
            .set(
                Expiration::OneShot(deadline),
                TimerSetTimeFlags::TFD_TIMER_ABSTIME,
            )
            .map_err(|e| LoopError::Alarm(format!("{}: timerfd_settime failed: {e}", self.name)))
    }

    fn wait(&self) -> WaitOutcome {
        use nix::errno::Errno;
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
        use std::os::fd::AsFd;

        loop {
            let mut fds = [
                PollFd::new(self.timer.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.cancel.as_fd(), PollFlags::POLLIN),
            ];

            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!(name = %self.name, error = %e, "Alarm wait failed, treating as canceled");
                    return WaitOutcome::Canceled;
                }
            }

            let readable = |fd: &PollFd<'_>| {
                fd.revents()
                    .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLERR))
            };

            // The eventfd is never drained, so cancellation stays visible
            if readable(&fds[1]) {
                return WaitOutcome::Canceled;
            }
            if readable(&fds[0]) {
                if let Some(outcome) = self.read_expiration() {
                    return outcome;
                }
            }
        }
    }

    fn cancel(&self) {
        // The timerfd is left armed; the eventfd alone decides the outcome
        if let Err(e) = self.cancel.write(1) {
            warn!(name = %self.name, error = %e, "Failed to signal alarm cancellation");
        }
    }
}
