//! Fixed-period robot loop scheduler.
//!
//! Each iteration:
//! 1. Wait for the next deadline (skipped in free-run mode)
//! 2. Run the program's periodic hook between two timestamps
//! 3. Sample resource counters
//! 4. Emit cycle metrics to the sink
//!
//! The only blocking point is the alarm wait in step 1. Another thread
//! stops the loop through a [`LoopHandle`], which cancels the alarm; the
//! loop observes the cancellation at the next wait or iteration boundary
//! and exits without starting a partial cycle. When [`PeriodicScheduler::run`]
//! returns, the scheduler has released the alarm; handles only hold a weak
//! reference to it.

use crate::alarm::{create_alarm, Alarm};
use crate::program::RobotProgram;
use crate::sampler::ResourceUsageSampler;
use crate::sink::{create_sink, MetricSink};
use crate::timer::PeriodicTimer;
use cadence_common::config::LoopConfig;
use cadence_common::error::{LoopError, LoopResult};
use cadence_common::metrics::{CycleMetrics, LoopStats, MetricNames};
use cadence_common::state::{LoopState, StateMachine};
use cadence_common::time::{Clock, MonotonicClock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// [`LoopHandle::stop`] was called.
    Canceled,
    /// [`RobotProgram::is_finished`] returned true.
    Finished,
}

/// Result of one [`PeriodicScheduler::run_cycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The periodic hook ran.
    Completed(CycleMetrics),
    /// The loop should exit; no work was done.
    Exited(LoopExit),
}

/// Cross-thread control of a running loop.
///
/// Both flags are plain atomics polled once per iteration.
#[derive(Clone)]
pub struct LoopHandle {
    stopped: Arc<AtomicBool>,
    timing_enabled: Arc<AtomicBool>,
    alarm: Weak<dyn Alarm>,
}

impl LoopHandle {
    fn new(alarm: &Arc<dyn Alarm>, timing_enabled: bool) -> Self {
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            timing_enabled: Arc::new(AtomicBool::new(timing_enabled)),
            alarm: Arc::downgrade(alarm),
        }
    }

    /// Stop the loop, waking it if it is blocked on the alarm. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.alarm.upgrade() {
            Some(alarm) => {
                info!(alarm = alarm.name(), "Stop requested");
                alarm.cancel();
            }
            None => debug!("Stop requested after the alarm was released"),
        }
    }

    /// Whether [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Switch between timed and free-run mode from the next iteration.
    pub fn set_timing_enabled(&self, enabled: bool) {
        self.timing_enabled.store(enabled, Ordering::Release);
    }

    /// Whether iterations wait for their deadline.
    #[must_use]
    pub fn timing_enabled(&self) -> bool {
        self.timing_enabled.load(Ordering::Acquire)
    }
}

/// Single-threaded fixed-period loop.
pub struct PeriodicScheduler {
    name: String,
    clock: Arc<dyn Clock>,
    timer: PeriodicTimer,
    handle: LoopHandle,
    sink: Box<dyn MetricSink>,
    sampler: ResourceUsageSampler,
    stats: LoopStats,
    state: StateMachine,
    names: MetricNames,
    simulation: bool,
    status_interval: u64,
    percentiles: Vec<f64>,
}

impl PeriodicScheduler {
    /// Create a scheduler with default configuration and the given period.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::AlarmCreate`] if the alarm cannot be allocated,
    /// or [`LoopError::Config`] for a zero period.
    pub fn initialize(period: Duration) -> LoopResult<Self> {
        SchedulerBuilder::new().period(period).build()
    }

    /// Loop name (alarm name and metric prefix).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured period in microseconds.
    #[must_use]
    pub fn period_us(&self) -> u64 {
        self.timer.period_us()
    }

    /// Next deadline, or 0 before the first timed wait.
    #[must_use]
    pub fn next_deadline_us(&self) -> u64 {
        self.timer.next_deadline_us()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state.state()
    }

    /// Rolling statistics.
    #[must_use]
    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Whether simulation hooks run.
    #[must_use]
    pub fn is_simulation(&self) -> bool {
        self.simulation
    }

    /// A handle for stopping or re-timing the loop from another thread.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// See [`LoopHandle::stop`].
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// See [`LoopHandle::set_timing_enabled`].
    pub fn set_timing_enabled(&self, enabled: bool) {
        self.handle.set_timing_enabled(enabled);
    }

    /// See [`LoopHandle::timing_enabled`].
    #[must_use]
    pub fn timing_enabled(&self) -> bool {
        self.handle.timing_enabled()
    }

    /// Run the program until it finishes or the loop is stopped.
    ///
    /// Blocks the calling thread. A scheduler runs at most once; on every
    /// exit path the alarm is released and buffered metrics are flushed.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Program`] if a hook fails, leaving the loop
    /// FAULTED, or [`LoopError::InvalidStateTransition`] on a second run.
    pub fn run<P: RobotProgram + ?Sized>(&mut self, program: &mut P) -> LoopResult<LoopExit> {
        let result = self.start(program).and_then(|()| self.main_loop(program));
        self.timer.close();
        self.sink.flush();
        let exit = result?;

        self.state.transition(LoopState::Stopped)?;
        info!(
            name = %self.name,
            ?exit,
            cycles = self.stats.total_cycles(),
            "Loop exited"
        );
        Ok(exit)
    }

    fn main_loop<P: RobotProgram + ?Sized>(&mut self, program: &mut P) -> LoopResult<LoopExit> {
        info!(name = %self.name, "Entering main loop");
        loop {
            if let CycleOutcome::Exited(reason) = self.run_cycle(program)? {
                return Ok(reason);
            }
        }
    }

    /// Run the init hooks and emit the init metric record.
    ///
    /// Transitions IDLE → INIT → RUN.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Program`] if an init hook fails.
    pub fn start<P: RobotProgram + ?Sized>(&mut self, program: &mut P) -> LoopResult<()> {
        self.state.transition(LoopState::Init)?;
        info!(
            name = %self.name,
            period_us = self.timer.period_us(),
            timing_enabled = self.handle.timing_enabled(),
            simulation = self.simulation,
            "Starting robot program"
        );

        let init_start = self.clock.now_micros();
        let mut result = program.robot_init().map_err(|e| ("robot_init", e));
        if result.is_ok() && self.simulation {
            result = program
                .simulation_init()
                .map_err(|e| ("simulation_init", e));
        }
        let init_end = self.clock.now_micros();

        // No previous cycle, so no wait jitter
        self.sink.record(
            &self.names.user_code,
            init_end.saturating_sub(init_start) as f64,
        );
        self.sink.record(&self.names.wait_jitter, 0.0);
        self.sink.end_cycle();

        if let Err((phase, e)) = result {
            return Err(self.fault(phase, &e));
        }

        info!("********** Robot program startup complete **********");
        self.state.transition(LoopState::Run)
    }

    /// Execute exactly one iteration.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Program`] if the periodic hook fails (after
    /// its metrics were emitted), or [`LoopError::Alarm`] if the alarm
    /// cannot be armed.
    pub fn run_cycle<P: RobotProgram + ?Sized>(
        &mut self,
        program: &mut P,
    ) -> LoopResult<CycleOutcome> {
        if self.state.state() != LoopState::Run {
            return Err(LoopError::InvalidStateTransition {
                from: self.state.state().to_string(),
                to: LoopState::Run.to_string(),
            });
        }

        if self.handle.is_stopped() {
            return Ok(CycleOutcome::Exited(LoopExit::Canceled));
        }
        if program.is_finished() {
            return Ok(CycleOutcome::Exited(LoopExit::Finished));
        }

        let scheduled_us = if self.handle.timing_enabled() {
            match self.timer.wait_next() {
                // A stop that lands after the alarm fired still wins
                Ok(Some(_)) if self.handle.is_stopped() => {
                    return Ok(CycleOutcome::Exited(LoopExit::Canceled));
                }
                Ok(Some(wake)) => {
                    if wake.late {
                        self.stats.record_late();
                    }
                    Some(wake.scheduled_us)
                }
                Ok(None) => {
                    debug!(name = %self.name, "Alarm wait canceled");
                    return Ok(CycleOutcome::Exited(LoopExit::Canceled));
                }
                Err(e) => {
                    error!(name = %self.name, error = %e, "Alarm failure, entering FAULTED state");
                    self.state.enter_fault();
                    return Err(e);
                }
            }
        } else {
            None
        };

        let cycle_start = self.clock.now_micros();
        let result = program.robot_periodic();
        let cycle_end = self.clock.now_micros();

        let deltas = self.sampler.update();
        let metrics = CycleMetrics {
            user_code_duration_us: cycle_end.saturating_sub(cycle_start),
            wait_jitter_us: scheduled_us.map_or(0, |s| cycle_start.saturating_sub(s)),
            resource_time_delta_ms: deltas.time_ms,
            resource_count_delta: deltas.count,
        };
        self.emit(&metrics);

        if self.stats.record(&metrics) {
            warn!(
                cycle = self.stats.total_cycles(),
                user_code_us = metrics.user_code_duration_us,
                period_us = self.timer.period_us(),
                "User code overran the loop period"
            );
        }
        trace!(
            cycle = self.stats.total_cycles(),
            user_code_us = metrics.user_code_duration_us,
            jitter_us = metrics.wait_jitter_us,
            "Cycle complete"
        );
        if self.status_interval > 0 && self.stats.total_cycles() % self.status_interval == 0 {
            self.log_status();
        }

        if let Err(e) = result {
            return Err(self.fault("robot_periodic", &e));
        }
        Ok(CycleOutcome::Completed(metrics))
    }

    /// Log a one-line statistics summary at `info`.
    pub fn log_status(&self) {
        let snap = self.stats.snapshot();
        info!(
            name = %self.name,
            cycles = snap.total_cycles,
            mean_us = ?snap.mean_us,
            max_us = ?snap.max_us,
            max_jitter_us = snap.max_jitter_us,
            overruns = snap.overrun_count,
            late = snap.late_count,
            percentiles = ?self.stats.percentiles(&self.percentiles),
            "Loop status"
        );
    }

    fn emit(&mut self, metrics: &CycleMetrics) {
        self.sink.record(
            &self.names.resource_time,
            metrics.resource_time_delta_ms as f64,
        );
        self.sink.record(
            &self.names.resource_counts,
            metrics.resource_count_delta as f64,
        );
        self.sink
            .record(&self.names.user_code, metrics.user_code_duration_us as f64);
        self.sink
            .record(&self.names.wait_jitter, metrics.wait_jitter_us as f64);
        self.sink.end_cycle();
    }

    fn fault(&mut self, phase: &'static str, err: &anyhow::Error) -> LoopError {
        let message = format!("{err:#}");
        error!(
            name = %self.name,
            phase,
            error = %message,
            "Program hook failed, entering FAULTED state"
        );
        self.state.enter_fault();
        LoopError::Program { phase, message }
    }
}

/// Builder for [`PeriodicScheduler`].
pub struct SchedulerBuilder {
    config: LoopConfig,
    sink: Option<Box<dyn MetricSink>>,
    sampler: Option<ResourceUsageSampler>,
    simulation: bool,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerBuilder {
    /// Start from [`LoopConfig::default`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: LoopConfig::default(),
            sink: None,
            sampler: None,
            simulation: false,
        }
    }

    /// Set the full loop configuration.
    #[must_use]
    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the loop period.
    #[must_use]
    pub fn period(mut self, period: Duration) -> Self {
        self.config.period = period;
        self
    }

    /// Start in timed (`true`) or free-run (`false`) mode.
    #[must_use]
    pub fn timing_enabled(mut self, enabled: bool) -> Self {
        self.config.timing_enabled = enabled;
        self
    }

    /// Use this sink instead of the configured one.
    #[must_use]
    pub fn sink(mut self, sink: impl MetricSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Use this sampler instead of the configured one.
    #[must_use]
    pub fn sampler(mut self, sampler: ResourceUsageSampler) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Run [`RobotProgram::simulation_init`] after `robot_init`.
    #[must_use]
    pub fn simulation(mut self, simulation: bool) -> Self {
        self.simulation = simulation;
        self
    }

    /// Build with the monotonic clock and the configured alarm.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::AlarmCreate`] if the alarm cannot be allocated,
    /// or [`LoopError::Config`] for an invalid configuration.
    pub fn build(self) -> LoopResult<PeriodicScheduler> {
        self.validate()?;
        let alarm = create_alarm(self.config.alarm, &self.config.name)?;
        self.build_with(Arc::new(MonotonicClock::new()), alarm)
    }

    /// Build with an explicit clock and alarm sharing one timebase.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Config`] for an invalid configuration or if
    /// the configured sink cannot be opened.
    pub fn build_with(
        self,
        clock: Arc<dyn Clock>,
        alarm: Arc<dyn Alarm>,
    ) -> LoopResult<PeriodicScheduler> {
        self.validate()?;
        let config = self.config;

        // The timer holds the only strong reference; handles stay weak
        let handle = LoopHandle::new(&alarm, config.timing_enabled);
        let timer = PeriodicTimer::new(config.period, Arc::clone(&clock), alarm)?;
        let sink = match self.sink {
            Some(sink) => sink,
            None => create_sink(&config.metrics)?,
        };
        let sampler = self
            .sampler
            .unwrap_or_else(|| ResourceUsageSampler::from_config(&config.sampler));

        debug!(
            name = %config.name,
            period_us = timer.period_us(),
            resources = ?sampler.resource_names(),
            "Periodic scheduler created"
        );

        Ok(PeriodicScheduler {
            stats: LoopStats::new(config.metrics.histogram_size, timer.period_us()),
            names: MetricNames::new(&config.name),
            handle,
            name: config.name,
            clock,
            timer,
            sink,
            sampler,
            state: StateMachine::new(),
            simulation: self.simulation,
            status_interval: config.metrics.status_interval,
            percentiles: config.metrics.percentiles,
        })
    }

    fn validate(&self) -> LoopResult<()> {
        self.config
            .validate()
            .map_err(|e| LoopError::Config(e.to_string()))
    }
}
