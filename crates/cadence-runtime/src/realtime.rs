//! Real-time preparation of the loop thread.
//!
//! Call [`prepare_realtime`] on the thread that will run the loop, before
//! building the scheduler:
//! - Memory locking (mlockall) so cycles do not page-fault
//! - `SCHED_FIFO`/`SCHED_RR` priority for the calling thread
//! - CPU affinity to keep the loop off housekeeping cores
//!
//! Missing privileges are not fatal: each step degrades to a warning.

use cadence_common::config::{RealtimeConfig, SchedPolicy};
use cadence_common::error::{LoopError, LoopResult};
use tracing::{debug, info, warn};

/// What [`prepare_realtime`] actually applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealtimeStatus {
    /// Whether memory was locked.
    pub memory_locked: bool,
    /// Applied scheduler policy.
    pub scheduler_policy: Option<SchedPolicy>,
    /// Applied scheduler priority.
    pub scheduler_priority: Option<u8>,
    /// CPUs the thread is pinned to.
    pub cpu_affinity: Option<Vec<usize>>,
}

/// Apply `config` to the calling thread.
///
/// # Errors
///
/// Returns [`LoopError::Realtime`] for failures other than missing
/// privileges, such as an out-of-range CPU index.
pub fn prepare_realtime(config: &RealtimeConfig) -> LoopResult<RealtimeStatus> {
    if !config.enabled {
        debug!("Real-time preparation disabled");
        return Ok(RealtimeStatus::default());
    }

    let caps = check_rt_capabilities();
    debug!(?caps, "Real-time capabilities");
    if !caps.preempt_rt {
        warn!("PREEMPT_RT kernel not detected, expect higher wake-up jitter");
    }

    let memory_locked = config.lock_memory && lock_memory()?;
    let (scheduler_policy, scheduler_priority) = set_scheduler(config.policy, config.priority)?;
    let cpu_affinity = set_cpu_affinity(&config.cpu_affinity)?;

    let status = RealtimeStatus {
        memory_locked,
        scheduler_policy,
        scheduler_priority,
        cpu_affinity,
    };
    info!(?status, "Real-time preparation complete");
    Ok(status)
}

#[cfg(target_os = "linux")]
fn lock_memory() -> LoopResult<bool> {
    use nix::errno::Errno;
    use nix::sys::mman::{mlockall, MlockAllFlags};

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            info!("Memory locked");
            Ok(true)
        }
        // EPERM without CAP_IPC_LOCK, ENOMEM when RLIMIT_MEMLOCK is too small
        Err(Errno::EPERM | Errno::ENOMEM) => {
            warn!("mlockall not permitted, page faults may occur during cycles");
            Ok(false)
        }
        Err(e) => Err(LoopError::Realtime(format!("mlockall failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_memory() -> LoopResult<bool> {
    warn!("mlockall not available on this platform");
    Ok(false)
}

#[cfg(target_os = "linux")]
fn set_scheduler(
    policy: SchedPolicy,
    priority: u8,
) -> LoopResult<(Option<SchedPolicy>, Option<u8>)> {
    let linux_policy = match policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
        SchedPolicy::Other => return Ok((Some(SchedPolicy::Other), None)),
    };

    let clamped = priority.clamp(1, 99);
    if clamped != priority {
        warn!(priority, clamped, "Scheduler priority clamped to 1..=99");
    }

    let param = libc::sched_param {
        sched_priority: i32::from(clamped),
    };
    // SAFETY: pid 0 is the calling thread and `param` outlives the call
    let result = unsafe { libc::sched_setscheduler(0, linux_policy, &param) };

    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            warn!(?policy, "sched_setscheduler not permitted, running with normal priority");
            return Ok((None, None));
        }
        return Err(LoopError::Realtime(format!("sched_setscheduler failed: {err}")));
    }

    info!(?policy, priority = clamped, "Real-time scheduler configured");
    Ok((Some(policy), Some(clamped)))
}

#[cfg(not(target_os = "linux"))]
fn set_scheduler(
    policy: SchedPolicy,
    priority: u8,
) -> LoopResult<(Option<SchedPolicy>, Option<u8>)> {
    warn!(?policy, priority, "Real-time scheduling not available on this platform");
    Ok((None, None))
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(cpus: &[usize]) -> LoopResult<Option<Vec<usize>>> {
    use nix::errno::Errno;
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    if cpus.is_empty() {
        return Ok(None);
    }

    let mut cpu_set = CpuSet::new();
    for &cpu in cpus {
        cpu_set
            .set(cpu)
            .map_err(|e| LoopError::Realtime(format!("invalid CPU index {cpu}: {e}")))?;
    }

    match sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        Ok(()) => {
            info!(?cpus, "CPU affinity set");
            Ok(Some(cpus.to_vec()))
        }
        Err(Errno::EINVAL) => {
            warn!(?cpus, "None of the requested CPUs are online, affinity unchanged");
            Ok(None)
        }
        Err(e) => Err(LoopError::Realtime(format!("sched_setaffinity failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(cpus: &[usize]) -> LoopResult<Option<Vec<usize>>> {
    if !cpus.is_empty() {
        warn!("CPU affinity not available on this platform");
    }
    Ok(None)
}

/// Real-time related limits of the current process.
#[derive(Debug, Clone, Default)]
pub struct RtCapabilities {
    /// Running as root.
    pub is_root: bool,
    /// `RLIMIT_RTPRIO` soft limit.
    pub rtprio_limit: Option<u64>,
    /// `RLIMIT_MEMLOCK` soft limit.
    pub memlock_limit: Option<u64>,
    /// Kernel reports `PREEMPT_RT`.
    pub preempt_rt: bool,
}

impl RtCapabilities {
    /// Whether an RT scheduler policy is likely to be accepted.
    #[must_use]
    pub fn can_use_rt_scheduling(&self) -> bool {
        self.is_root || self.rtprio_limit.is_some_and(|l| l > 0)
    }
}

/// Inspect the limits that decide whether real-time preparation succeeds.
#[cfg(target_os = "linux")]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    use nix::sys::resource::{getrlimit, Resource};
    use nix::unistd::geteuid;

    RtCapabilities {
        is_root: geteuid().is_root(),
        rtprio_limit: getrlimit(Resource::RLIMIT_RTPRIO).ok().map(|(soft, _)| soft),
        memlock_limit: getrlimit(Resource::RLIMIT_MEMLOCK).ok().map(|(soft, _)| soft),
        preempt_rt: std::fs::read_to_string("/proc/version")
            .is_ok_and(|v| v.contains("PREEMPT_RT") || v.contains("PREEMPT RT")),
    }
}

/// Inspect the limits that decide whether real-time preparation succeeds.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    RtCapabilities::default()
}
