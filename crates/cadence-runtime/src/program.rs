//! User program hooks driven by the periodic scheduler.

/// Program driven by [`PeriodicScheduler`](crate::PeriodicScheduler).
///
/// Hooks run synchronously on the loop thread. Errors end the loop; the
/// scheduler never retries a hook.
pub trait RobotProgram {
    /// Called once before the first cycle.
    fn robot_init(&mut self) -> anyhow::Result<()>;

    /// Called once after [`robot_init`](Self::robot_init) in simulation mode.
    fn simulation_init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once per cycle.
    fn robot_periodic(&mut self) -> anyhow::Result<()>;

    /// Checked before every cycle; `true` ends the loop.
    fn is_finished(&self) -> bool {
        false
    }
}

/// Adapter turning closures into a [`RobotProgram`].
pub struct FnProgram<I, P> {
    init: I,
    periodic: P,
    max_cycles: Option<u64>,
    cycles: u64,
}

impl<I, P> FnProgram<I, P>
where
    I: FnMut() -> anyhow::Result<()>,
    P: FnMut() -> anyhow::Result<()>,
{
    /// Wrap an init and a periodic closure.
    pub fn new(init: I, periodic: P) -> Self {
        Self {
            init,
            periodic,
            max_cycles: None,
            cycles: 0,
        }
    }

    /// Finish after `max_cycles` periodic calls.
    #[must_use]
    pub fn with_max_cycles(mut self, max_cycles: u64) -> Self {
        self.max_cycles = Some(max_cycles);
        self
    }

    /// Periodic calls made so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }
}

impl<I, P> RobotProgram for FnProgram<I, P>
where
    I: FnMut() -> anyhow::Result<()>,
    P: FnMut() -> anyhow::Result<()>,
{
    fn robot_init(&mut self) -> anyhow::Result<()> {
        (self.init)()
    }

    fn robot_periodic(&mut self) -> anyhow::Result<()> {
        self.cycles += 1;
        (self.periodic)()
    }

    fn is_finished(&self) -> bool {
        self.max_cycles.is_some_and(|max| self.cycles >= max)
    }
}
