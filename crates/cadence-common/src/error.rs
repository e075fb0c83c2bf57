use thiserror::Error;

/// Loop error types covering configuration, alarm resources and program hooks.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LoopError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The alarm primitive could not be created.
    #[error("failed to create alarm '{name}': {reason}")]
    AlarmCreate {
        /// Alarm name.
        name: String,
        /// Underlying OS failure.
        reason: String,
    },

    /// Arming or otherwise driving an existing alarm failed.
    #[error("alarm error: {0}")]
    Alarm(String),

    /// A periodic timer was used after `close()`.
    #[error("periodic timer used after close")]
    TimerClosed,

    /// A user program hook returned an error.
    #[error("program {phase} failed: {message}")]
    Program {
        /// Hook that failed (`robot_init`, `robot_periodic`, ...).
        phase: &'static str,
        /// Rendered error chain.
        message: String,
    },

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Real-time thread preparation failed.
    #[error("realtime setup failed: {0}")]
    Realtime(String),
}

/// Convenience type alias for loop operations.
pub type LoopResult<T> = Result<T, LoopError>;
