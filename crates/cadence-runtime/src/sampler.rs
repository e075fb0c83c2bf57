//! Per-cycle resource usage deltas.
//!
//! A [`CounterSource`] exposes monotonically increasing `(time, count)`
//! counters, one pair per resource. [`ResourceUsageSampler`] takes a
//! baseline at construction and, once per cycle, sums how much every
//! counter moved since the previous sample.
//!
//! A counter that goes backwards (its pool was reinitialized) is
//! re-based and contributes 0 for that tick, so emitted deltas are never
//! negative.

use cadence_common::config::SamplerConfig;
use crossbeam_utils::CachePadded;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Cumulative counter values for one resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterReading {
    /// Total time attributed to the resource, in milliseconds.
    pub time_ms: u64,
    /// Total number of events.
    pub count: u64,
}

/// Enumerable set of resource counters.
pub trait CounterSource: Send {
    /// Names of the resources this source tracks, in index order.
    fn resources(&self) -> Vec<String>;

    /// Current cumulative values for resource `index`.
    fn read(&self, index: usize) -> CounterReading;
}

/// Summed deltas across all tracked resources for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceDeltas {
    /// Resource time accumulated since the last update (ms).
    pub time_ms: u64,
    /// Events counted since the last update.
    pub count: u64,
}

struct Tracked {
    source: usize,
    index: usize,
    name: String,
    last: CounterReading,
}

/// Computes per-cycle deltas over a fixed set of counters.
pub struct ResourceUsageSampler {
    sources: Vec<Box<dyn CounterSource>>,
    tracked: Vec<Tracked>,
}

impl Default for ResourceUsageSampler {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ResourceUsageSampler {
    /// Enumerate every resource of every source and record its baseline.
    #[must_use]
    pub fn new(sources: Vec<Box<dyn CounterSource>>) -> Self {
        let mut tracked = Vec::new();
        for (source_idx, source) in sources.iter().enumerate() {
            for (index, name) in source.resources().into_iter().enumerate() {
                tracked.push(Tracked {
                    source: source_idx,
                    index,
                    last: source.read(index),
                    name,
                });
            }
        }

        let names: Vec<&str> = tracked.iter().map(|t| t.name.as_str()).collect();
        info!(resources = ?names, "Resource usage sampler initialized");

        Self { sources, tracked }
    }

    /// Build the sampler described by `config`.
    #[must_use]
    pub fn from_config(config: &SamplerConfig) -> Self {
        if !config.enabled {
            debug!("Resource sampling disabled");
            return Self::default();
        }
        let mut sources: Vec<Box<dyn CounterSource>> = Vec::new();
        if config.rusage || config.schedstat {
            sources.push(Box::new(RusageSource::new(config.rusage, config.schedstat)));
        }
        Self::new(sources)
    }

    /// Names of all tracked resources.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.tracked.iter().map(|t| t.name.as_str()).collect()
    }

    /// Sample every counter and return the summed deltas since the last call.
    pub fn update(&mut self) -> ResourceDeltas {
        let mut deltas = ResourceDeltas::default();

        for tracked in &mut self.tracked {
            let current = self.sources[tracked.source].read(tracked.index);
            deltas.time_ms += clamped_delta(current.time_ms, tracked.last.time_ms);
            deltas.count += clamped_delta(current.count, tracked.last.count);
            tracked.last = current;
        }

        deltas
    }
}

/// Counter reset re-bases at the new value: no negative deltas.
#[inline]
fn clamped_delta(current: u64, last: u64) -> u64 {
    current.checked_sub(last).unwrap_or(0)
}

#[derive(Debug, Default)]
struct SharedCounter {
    time_ms: CachePadded<AtomicU64>,
    count: CachePadded<AtomicU64>,
}

/// Application-defined counters, updated from any thread.
///
/// ```
/// use cadence_runtime::sampler::{ResourceUsageSampler, SharedCounters};
///
/// let counters = SharedCounters::new();
/// let pool = counters.register("frame_pool");
/// let mut sampler = ResourceUsageSampler::new(vec![Box::new(counters.clone())]);
///
/// pool.add_time_ms(3);
/// pool.increment();
/// let deltas = sampler.update();
/// assert_eq!((deltas.time_ms, deltas.count), (3, 1));
/// ```
#[derive(Clone, Default)]
pub struct SharedCounters {
    entries: Arc<Mutex<Vec<(String, Arc<SharedCounter>)>>>,
}

impl SharedCounters {
    /// Create an empty counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource. Register before handing the set to a sampler;
    /// resources are enumerated once.
    pub fn register(&self, name: &str) -> CounterHandle {
        let counter = Arc::new(SharedCounter::default());
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_owned(), Arc::clone(&counter)));
        CounterHandle { counter }
    }
}

impl CounterSource for SharedCounters {
    fn resources(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn read(&self, index: usize) -> CounterReading {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(index).map_or_else(CounterReading::default, |(_, c)| CounterReading {
            time_ms: c.time_ms.load(Ordering::Relaxed),
            count: c.count.load(Ordering::Relaxed),
        })
    }
}

/// Writer side of one [`SharedCounters`] resource.
#[derive(Debug, Clone)]
pub struct CounterHandle {
    counter: Arc<SharedCounter>,
}

impl CounterHandle {
    /// Add `ms` to the resource time.
    pub fn add_time_ms(&self, ms: u64) {
        self.counter.time_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Count one event.
    pub fn increment(&self) {
        self.counter.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Set both counters to explicit values.
    pub fn set(&self, time_ms: u64, count: u64) {
        self.counter.time_ms.store(time_ms, Ordering::Relaxed);
        self.counter.count.store(count, Ordering::Relaxed);
    }

    /// Zero both counters, as a reinitialized pool would.
    pub fn reset(&self) {
        self.set(0, 0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OsResource {
    /// System CPU time / page faults.
    Kernel,
    /// Run-queue wait / involuntary context switches.
    Preemption,
}

impl OsResource {
    fn name(self) -> &'static str {
        match self {
            Self::Kernel => "kernel",
            Self::Preemption => "preemption",
        }
    }
}

/// Operating-system counters for the calling process.
///
/// * `kernel`: system CPU time and page faults (`getrusage`).
/// * `preemption`: run-queue wait from `/proc/thread-self/schedstat` and
///   involuntary context switches.
pub struct RusageSource {
    resources: Vec<OsResource>,
    schedstat: bool,
}

impl RusageSource {
    /// Track the resources enabled by the flags that this platform supports.
    #[must_use]
    pub fn new(rusage: bool, schedstat: bool) -> Self {
        let mut resources = Vec::new();
        if rusage_available() {
            if rusage {
                resources.push(OsResource::Kernel);
            }
            if rusage || schedstat {
                resources.push(OsResource::Preemption);
            }
        }
        Self {
            resources,
            schedstat,
        }
    }
}

impl CounterSource for RusageSource {
    fn resources(&self) -> Vec<String> {
        self.resources.iter().map(|r| r.name().to_owned()).collect()
    }

    fn read(&self, index: usize) -> CounterReading {
        let Some(resource) = self.resources.get(index) else {
            return CounterReading::default();
        };
        let usage = read_rusage();
        match resource {
            OsResource::Kernel => CounterReading {
                time_ms: usage.system_ms,
                count: usage.page_faults,
            },
            OsResource::Preemption => CounterReading {
                time_ms: if self.schedstat {
                    read_runqueue_wait_ms().unwrap_or(0)
                } else {
                    0
                },
                count: usage.involuntary_switches,
            },
        }
    }
}

#[derive(Debug, Default)]
struct RusageSnapshot {
    system_ms: u64,
    page_faults: u64,
    involuntary_switches: u64,
}

#[cfg(unix)]
fn rusage_available() -> bool {
    true
}

#[cfg(not(unix))]
fn rusage_available() -> bool {
    false
}

#[cfg(unix)]
fn read_rusage() -> RusageSnapshot {
    use nix::sys::resource::{getrusage, UsageWho};

    let Ok(usage) = getrusage(UsageWho::RUSAGE_SELF) else {
        return RusageSnapshot::default();
    };
    let stime = usage.system_time();
    let to_u64 = |v: i64| u64::try_from(v).unwrap_or(0);
    RusageSnapshot {
        system_ms: to_u64(i64::from(stime.tv_sec())) * 1_000
            + to_u64(i64::from(stime.tv_usec())) / 1_000,
        page_faults: to_u64(i64::from(usage.major_page_faults()))
            + to_u64(i64::from(usage.minor_page_faults())),
        involuntary_switches: to_u64(i64::from(usage.involuntary_context_switches())),
    }
}

#[cfg(not(unix))]
fn read_rusage() -> RusageSnapshot {
    RusageSnapshot::default()
}

/// Second field of schedstat: nanoseconds spent runnable but not running.
#[cfg(target_os = "linux")]
fn read_runqueue_wait_ms() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/thread-self/schedstat").ok()?;
    let wait_ns: u64 = content.split_whitespace().nth(1)?.parse().ok()?;
    Some(wait_ns / 1_000_000)
}

#[cfg(not(target_os = "linux"))]
fn read_runqueue_wait_ms() -> Option<u64> {
    None
}
