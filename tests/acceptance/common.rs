//! Common utilities for acceptance tests.
//!
//! Provides helpers for:
//! - Timestamped test programs on the real clock
//! - Alarm wrappers that count cancels and releases
//! - Summarising cycle spacing

#![allow(dead_code)] // Not every helper is used by every test file

use cadence_common::config::AlarmKind;
use cadence_common::error::LoopResult;
use cadence_common::time::{Clock, MonotonicClock};
use cadence_runtime::{create_alarm, Alarm, RobotProgram, WaitOutcome};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Alarm kinds available on this platform.
pub fn alarm_kinds() -> Vec<AlarmKind> {
    vec![AlarmKind::Native, AlarmKind::Condvar]
}

/// Check if the system has a PREEMPT_RT kernel.
pub fn has_preempt_rt() -> bool {
    std::fs::read_to_string("/proc/version")
        .is_ok_and(|v| v.contains("PREEMPT_RT") || v.contains("PREEMPT RT"))
}

/// Program that sleeps for `work` each cycle and records cycle starts.
pub struct SleepProgram {
    clock: MonotonicClock,
    work: Duration,
    max_cycles: usize,
    /// Monotonic start time of each periodic call.
    pub starts: Vec<u64>,
}

impl SleepProgram {
    /// Run `max_cycles` cycles of `work` each.
    pub fn new(work: Duration, max_cycles: usize) -> Self {
        Self {
            clock: MonotonicClock::new(),
            work,
            max_cycles,
            starts: Vec::with_capacity(max_cycles),
        }
    }

    /// Microseconds between the first and the last cycle start.
    pub fn span_us(&self) -> u64 {
        match (self.starts.first(), self.starts.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0,
        }
    }
}

impl RobotProgram for SleepProgram {
    fn robot_init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn robot_periodic(&mut self) -> anyhow::Result<()> {
        self.starts.push(self.clock.now_micros());
        if !self.work.is_zero() {
            std::thread::sleep(self.work);
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.starts.len() >= self.max_cycles
    }
}

/// Wraps a real alarm and counts cancels and drops.
pub struct CountingAlarm {
    inner: Arc<dyn Alarm>,
    cancels: Arc<AtomicUsize>,
    drops: Arc<AtomicUsize>,
}

/// Counters observed by a [`CountingAlarm`].
#[derive(Clone, Default)]
pub struct AlarmCounters {
    /// `cancel` calls.
    pub cancels: Arc<AtomicUsize>,
    /// Releases of the wrapped alarm.
    pub drops: Arc<AtomicUsize>,
}

impl AlarmCounters {
    /// Number of `cancel` calls so far.
    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Number of releases so far.
    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }
}

impl CountingAlarm {
    /// Wrap a freshly created alarm of `kind`.
    pub fn create(kind: AlarmKind) -> (Arc<Self>, AlarmCounters) {
        let counters = AlarmCounters::default();
        let alarm = Arc::new(Self {
            inner: create_alarm(kind, "acceptance").unwrap(),
            cancels: counters.cancels.clone(),
            drops: counters.drops.clone(),
        });
        (alarm, counters)
    }
}

impl Alarm for CountingAlarm {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn arm(&self, deadline_us: u64) -> LoopResult<()> {
        self.inner.arm(deadline_us)
    }

    fn wait(&self) -> WaitOutcome {
        self.inner.wait()
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.inner.cancel();
    }
}

impl Drop for CountingAlarm {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}
