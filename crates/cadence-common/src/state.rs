//! Lifecycle state machine for a periodic loop.
//!
//! A loop runs once per process:
//! IDLE → INIT → RUN → STOPPED
//!
//! `FAULTED` is terminal and reachable from INIT or RUN when a
//! program hook fails. Neither terminal state can be left, so a
//! scheduler cannot be run twice.

use crate::error::{LoopError, LoopResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Lifecycle states of a periodic loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    /// Constructed, alarm allocated, not yet running.
    #[default]
    Idle,
    /// Running the program's init hooks.
    Init,
    /// Cycling.
    Run,
    /// Loop exited cleanly (cancellation or program finished).
    Stopped,
    /// A program hook returned an error.
    Faulted,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Init => write!(f, "INIT"),
            Self::Run => write!(f, "RUN"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Faulted => write!(f, "FAULTED"),
        }
    }
}

impl LoopState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: LoopState) -> bool {
        use LoopState::{Faulted, Idle, Init, Run, Stopped};

        matches!(
            (self, target),
            (Idle, Init)
                | (Init, Run)
                | (Run, Stopped)
                // Cancellation may arrive before the first cycle
                | (Init, Stopped)
                | (Init, Faulted)
                | (Run, Faulted)
        )
    }

    /// Returns true once the loop can no longer run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Faulted)
    }
}

/// State machine wrapper with transition tracking.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    current: LoopState,
    previous: Option<LoopState>,
    transition_count: u64,
}

impl StateMachine {
    /// Create a new state machine starting in IDLE.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.current
    }

    /// Get the previous state (if any transition occurred).
    #[must_use]
    pub fn previous_state(&self) -> Option<LoopState> {
        self.previous
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt a state transition.
    pub fn transition(&mut self, target: LoopState) -> LoopResult<()> {
        if !self.current.can_transition_to(target) {
            return Err(LoopError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            });
        }
        debug!(from = %self.current, to = %target, "State transition");
        self.previous = Some(self.current);
        self.current = target;
        self.transition_count += 1;
        Ok(())
    }

    /// Move to FAULTED if the current state allows it.
    pub fn enter_fault(&mut self) {
        if self.current.can_transition_to(LoopState::Faulted) {
            debug!(from = %self.current, to = %LoopState::Faulted, "State transition");
            self.previous = Some(self.current);
            self.current = LoopState::Faulted;
            self.transition_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_forward_transitions() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.state(), LoopState::Idle);

        sm.transition(LoopState::Init).unwrap();
        sm.transition(LoopState::Run).unwrap();
        sm.transition(LoopState::Stopped).unwrap();

        assert_eq!(sm.state(), LoopState::Stopped);
        assert_eq!(sm.previous_state(), Some(LoopState::Run));
        assert_eq!(sm.transition_count(), 3);
    }

    #[test]
    fn test_cannot_run_twice() {
        let mut sm = StateMachine::new();
        sm.transition(LoopState::Init).unwrap();
        sm.transition(LoopState::Run).unwrap();
        sm.transition(LoopState::Stopped).unwrap();

        let err = sm.transition(LoopState::Init).unwrap_err();
        assert_eq!(
            err,
            LoopError::InvalidStateTransition {
                from: "STOPPED".into(),
                to: "INIT".into(),
            }
        );
        assert!(sm.state().is_terminal());
    }

    #[test]
    fn test_skip_init_rejected() {
        let mut sm = StateMachine::new();
        assert!(sm.transition(LoopState::Run).is_err());
        assert_eq!(sm.state(), LoopState::Idle);
    }

    #[test]
    fn test_enter_fault() {
        let mut sm = StateMachine::new();
        // Idle cannot fault
        sm.enter_fault();
        assert_eq!(sm.state(), LoopState::Idle);

        sm.transition(LoopState::Init).unwrap();
        sm.enter_fault();
        assert_eq!(sm.state(), LoopState::Faulted);
        assert_eq!(sm.previous_state(), Some(LoopState::Init));
    }

    struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_transitions_are_logged() {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let make_writer = {
            let buf = Arc::clone(&buf);
            move || CaptureWriter(Arc::clone(&buf))
        };
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(make_writer)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mut sm = StateMachine::new();
            sm.transition(LoopState::Init).unwrap();
            sm.enter_fault();
        });

        let out = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        assert!(out.contains("State transition"));
        assert!(out.contains("from=IDLE to=INIT"));
        assert!(out.contains("from=INIT to=FAULTED"));
    }

    #[test]
    fn test_display_names() {
        assert_eq!(LoopState::Run.to_string(), "RUN");
        assert_eq!(LoopState::Faulted.to_string(), "FAULTED");
    }
}
