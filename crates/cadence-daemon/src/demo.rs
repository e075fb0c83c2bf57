//! Demo program: burns a fixed amount of time per cycle.

use cadence_common::time::duration_to_micros;
use cadence_runtime::{CounterHandle, RobotProgram, SimClock};
use std::time::Duration;
use tracing::{debug, info};

/// Periodic program standing in for real robot code.
pub struct DemoProgram {
    work: Duration,
    max_cycles: Option<u64>,
    cycles: u64,
    /// Simulated mode advances this clock instead of sleeping.
    sim_clock: Option<SimClock>,
    counter: Option<CounterHandle>,
}

impl DemoProgram {
    /// Spend `work` per cycle; finish after `max_cycles` (0 runs forever).
    pub fn new(work: Duration, max_cycles: u64) -> Self {
        Self {
            work,
            max_cycles: (max_cycles > 0).then_some(max_cycles),
            cycles: 0,
            sim_clock: None,
            counter: None,
        }
    }

    /// Advance `clock` instead of sleeping.
    #[must_use]
    pub fn simulated(mut self, clock: SimClock) -> Self {
        self.sim_clock = Some(clock);
        self
    }

    /// Count each cycle's work on an application counter.
    #[must_use]
    pub fn with_counter(mut self, counter: CounterHandle) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Completed periodic calls.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }
}

impl RobotProgram for DemoProgram {
    fn robot_init(&mut self) -> anyhow::Result<()> {
        info!(work = ?self.work, max_cycles = ?self.max_cycles, "Demo program initialized");
        Ok(())
    }

    fn simulation_init(&mut self) -> anyhow::Result<()> {
        debug!("Demo program running on simulated time");
        Ok(())
    }

    fn robot_periodic(&mut self) -> anyhow::Result<()> {
        match &self.sim_clock {
            Some(clock) => clock.advance(duration_to_micros(self.work)),
            None => std::thread::sleep(self.work),
        }
        if let Some(counter) = &self.counter {
            counter.add_time_ms(u64::try_from(self.work.as_millis()).unwrap_or(u64::MAX));
            counter.increment();
        }
        self.cycles += 1;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.max_cycles.is_some_and(|max| self.cycles >= max)
    }
}
