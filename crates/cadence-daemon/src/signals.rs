//! Signal handling for graceful daemon shutdown.
//!
//! SIGINT and SIGTERM only store the signal number in an atomic; a watcher
//! thread picks it up and runs the shutdown callback, which is where the
//! loop's alarm gets canceled. Nothing but the atomic store happens in
//! signal context.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Signal number recorded by the handler, 0 when none is pending.
static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

const WATCH_INTERVAL: Duration = Duration::from_millis(10);

/// Signals that stop the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM - Graceful termination request.
    Terminate,
    /// SIGINT - Interrupt (Ctrl+C).
    Interrupt,
}

impl SignalKind {
    fn from_raw(signum: i32) -> Option<Self> {
        match signum {
            libc::SIGTERM => Some(Self::Terminate),
            libc::SIGINT => Some(Self::Interrupt),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Shutdown bookkeeping shared with the watcher thread.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    signal_count: AtomicU32,
}

impl SignalState {
    /// Create a new signal state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Record a received signal. Returns `true` for the first one.
    fn record_signal(&self) -> bool {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        !self.shutdown_requested.swap(true, Ordering::AcqRel)
    }

    /// Get the total number of signals received.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }
}

/// Installed SIGINT/SIGTERM handling.
#[derive(Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Register the handlers and start the watcher thread.
    ///
    /// `on_shutdown` runs on the watcher thread for every received signal;
    /// it must be idempotent.
    pub fn install<F>(on_shutdown: F) -> std::io::Result<Self>
    where
        F: Fn(SignalKind) + Send + 'static,
    {
        let state = Arc::new(SignalState::new());

        #[cfg(unix)]
        register_unix_handlers()?;

        let watcher_state = Arc::clone(&state);
        std::thread::Builder::new()
            .name("signal-watcher".into())
            .spawn(move || loop {
                if let Some(kind) = take_pending() {
                    dispatch(&watcher_state, kind, &on_shutdown);
                }
                std::thread::sleep(WATCH_INTERVAL);
            })?;

        Ok(Self { state })
    }

    /// Check if shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    /// Get the signal state for inspection.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

fn take_pending() -> Option<SignalKind> {
    SignalKind::from_raw(PENDING_SIGNAL.swap(0, Ordering::AcqRel))
}

fn dispatch<F: Fn(SignalKind)>(state: &SignalState, kind: SignalKind, on_shutdown: &F) {
    if state.record_signal() {
        info!(signal = %kind, "Shutdown signal received");
    } else {
        warn!(signal = %kind, "Shutdown already in progress");
    }
    on_shutdown(kind);
}

#[cfg(unix)]
fn register_unix_handlers() -> std::io::Result<()> {
    extern "C" fn on_signal(signum: libc::c_int) {
        PENDING_SIGNAL.store(signum, Ordering::Release);
    }

    for signum in [libc::SIGTERM, libc::SIGINT] {
        // SAFETY: the handler only performs an atomic store
        let previous = unsafe { libc::signal(signum, on_signal as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }

    debug!("Unix signal handlers registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_signal_state_default() {
        let state = SignalState::new();
        assert!(!state.shutdown_requested());
        assert_eq!(state.signal_count(), 0);
    }

    #[test]
    fn test_dispatch_runs_callback_every_time() {
        let state = SignalState::new();
        let calls = AtomicUsize::new(0);
        let callback = |_kind: SignalKind| {
            calls.fetch_add(1, Ordering::SeqCst);
        };

        dispatch(&state, SignalKind::Interrupt, &callback);
        assert!(state.shutdown_requested());
        dispatch(&state, SignalKind::Terminate, &callback);

        assert_eq!(state.signal_count(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_signal_kind_from_raw() {
        assert_eq!(SignalKind::from_raw(libc::SIGINT), Some(SignalKind::Interrupt));
        assert_eq!(SignalKind::from_raw(libc::SIGTERM), Some(SignalKind::Terminate));
        assert_eq!(SignalKind::from_raw(0), None);
        assert_eq!(SignalKind::Terminate.to_string(), "SIGTERM");
    }
}
