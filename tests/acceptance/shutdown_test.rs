//! Cross-thread shutdown acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - `stop()` from another thread ends a blocked `run()` well within one period
//! - No partial cycle runs after the stop
//! - Repeated and concurrent `stop()` calls cancel the alarm exactly once
//! - The alarm is released exactly once, as soon as `run()` returns, even
//!   while stop handles are still alive

use super::common::{alarm_kinds, CountingAlarm, SleepProgram};
use cadence_common::state::LoopState;
use cadence_common::time::MonotonicClock;
use cadence_runtime::{LoopExit, MemorySink, ResourceUsageSampler, SchedulerBuilder};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_stop_wakes_blocked_run() {
    for kind in alarm_kinds() {
        let (alarm, counters) = CountingAlarm::create(kind);
        let mut scheduler = SchedulerBuilder::new()
            .period(Duration::from_secs(10))
            .sink(MemorySink::new())
            .sampler(ResourceUsageSampler::new(Vec::new()))
            .build_with(Arc::new(MonotonicClock::new()), alarm)
            .unwrap();

        let handle = scheduler.handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            handle.stop();
        });

        let started = Instant::now();
        let mut program = SleepProgram::new(Duration::ZERO, usize::MAX);
        let exit = scheduler.run(&mut program).unwrap();
        let elapsed = started.elapsed();
        stopper.join().unwrap();

        assert_eq!(exit, LoopExit::Canceled, "{kind:?}");
        assert!(elapsed < Duration::from_secs(2), "{kind:?}: took {elapsed:?}");
        // Only the immediate first cycle ran
        assert_eq!(program.starts.len(), 1, "{kind:?}");
        assert_eq!(scheduler.state(), LoopState::Stopped);
        assert_eq!(counters.cancels(), 1);
        assert_eq!(counters.drops(), 1, "{kind:?}");

        drop(scheduler);
        assert_eq!(counters.drops(), 1, "{kind:?}");
    }
}

#[test]
fn test_concurrent_stops_cancel_once() {
    let (alarm, counters) = CountingAlarm::create(cadence_common::config::AlarmKind::Native);
    let mut scheduler = SchedulerBuilder::new()
        .period(Duration::from_secs(10))
        .sink(MemorySink::new())
        .sampler(ResourceUsageSampler::new(Vec::new()))
        .build_with(Arc::new(MonotonicClock::new()), alarm)
        .unwrap();

    let stoppers: Vec<_> = (0..8)
        .map(|_| {
            let handle = scheduler.handle();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                handle.stop();
                handle.stop();
            })
        })
        .collect();

    let late_handle = scheduler.handle();
    let mut program = SleepProgram::new(Duration::ZERO, usize::MAX);
    assert_eq!(scheduler.run(&mut program).unwrap(), LoopExit::Canceled);
    assert_eq!(counters.drops(), 1);
    for stopper in stoppers {
        stopper.join().unwrap();
    }

    scheduler.stop();
    late_handle.stop();
    assert_eq!(counters.cancels(), 1);
    drop(scheduler);
    drop(late_handle);
    assert_eq!(counters.drops(), 1);
}

#[test]
fn test_stop_before_run() {
    let mut scheduler = SchedulerBuilder::new()
        .sink(MemorySink::new())
        .sampler(ResourceUsageSampler::new(Vec::new()))
        .build()
        .unwrap();
    scheduler.stop();

    let mut program = SleepProgram::new(Duration::ZERO, 10);
    assert_eq!(scheduler.run(&mut program).unwrap(), LoopExit::Canceled);
    assert!(program.starts.is_empty());
}
