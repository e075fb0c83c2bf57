//! Per-cycle metric records and rolling loop statistics.
//!
//! [`CycleMetrics`] is produced once per iteration and handed to the
//! metric sink. [`LoopStats`] keeps a ring buffer of user-code durations
//! for percentile reporting without allocating on the loop thread.

use serde::Serialize;

/// Metric key suffixes; the loop name is prepended as `<name>/<suffix>`.
pub mod keys {
    /// Duration of the user periodic callback.
    pub const USER_CODE_US: &str = "UserCodeUs";
    /// Delay between scheduled wake and start of work.
    pub const WAIT_JITTER_US: &str = "WaitJitterUs";
    /// Resource time accumulated during the cycle.
    pub const RESOURCE_TIME_MS: &str = "ResourceTimeMs";
    /// Resource events counted during the cycle.
    pub const RESOURCE_COUNTS: &str = "ResourceCounts";
}

/// Timing and resource deltas for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleMetrics {
    /// Time spent inside the periodic callback.
    pub user_code_duration_us: u64,
    /// Time between the scheduled wake and the start of work.
    pub wait_jitter_us: u64,
    /// Resource time accumulated during this cycle (milliseconds).
    pub resource_time_delta_ms: u64,
    /// Resource events counted during this cycle.
    pub resource_count_delta: u64,
}

/// Full metric names for one loop, built once at construction.
#[derive(Debug, Clone)]
pub struct MetricNames {
    /// `<name>/UserCodeUs`.
    pub user_code: String,
    /// `<name>/WaitJitterUs`.
    pub wait_jitter: String,
    /// `<name>/ResourceTimeMs`.
    pub resource_time: String,
    /// `<name>/ResourceCounts`.
    pub resource_counts: String,
}

impl MetricNames {
    /// Prefix every key with `loop_name`.
    #[must_use]
    pub fn new(loop_name: &str) -> Self {
        Self {
            user_code: format!("{loop_name}/{}", keys::USER_CODE_US),
            wait_jitter: format!("{loop_name}/{}", keys::WAIT_JITTER_US),
            resource_time: format!("{loop_name}/{}", keys::RESOURCE_TIME_MS),
            resource_counts: format!("{loop_name}/{}", keys::RESOURCE_COUNTS),
        }
    }
}

/// Rolling statistics over the loop lifetime.
#[derive(Debug)]
pub struct LoopStats {
    /// Ring buffer of user-code durations in microseconds.
    samples: Box<[u64]>,
    write_pos: usize,
    sample_count: usize,
    total_cycles: u64,
    min_us: u64,
    max_us: u64,
    sum_us: u64,
    max_jitter_us: u64,
    /// Cycles whose user code ran longer than one period.
    overrun_count: u64,
    /// Cycles started immediately because the deadline had already passed.
    late_count: u64,
    period_us: u64,
}

impl LoopStats {
    /// Create statistics with the given histogram size.
    ///
    /// # Arguments
    ///
    /// * `histogram_size` - Number of samples to retain in the ring buffer.
    /// * `period_us` - Loop period; user code exceeding it counts as an overrun.
    #[must_use]
    pub fn new(histogram_size: usize, period_us: u64) -> Self {
        let size = histogram_size.max(1);
        Self {
            samples: vec![0u64; size].into_boxed_slice(),
            write_pos: 0,
            sample_count: 0,
            total_cycles: 0,
            min_us: u64::MAX,
            max_us: 0,
            sum_us: 0,
            max_jitter_us: 0,
            overrun_count: 0,
            late_count: 0,
            period_us,
        }
    }

    /// Record one cycle. Allocation-free.
    ///
    /// Returns `true` if the user code overran the period.
    pub fn record(&mut self, cycle: &CycleMetrics) -> bool {
        let us = cycle.user_code_duration_us;

        self.samples[self.write_pos] = us;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.sample_count = (self.sample_count + 1).min(self.samples.len());

        self.total_cycles += 1;
        self.min_us = self.min_us.min(us);
        self.max_us = self.max_us.max(us);
        self.sum_us = self.sum_us.wrapping_add(us);
        self.max_jitter_us = self.max_jitter_us.max(cycle.wait_jitter_us);

        let overrun = us > self.period_us;
        if overrun {
            self.overrun_count += 1;
        }
        overrun
    }

    /// Count a cycle that skipped its missed deadline.
    pub fn record_late(&mut self) {
        self.late_count += 1;
    }

    /// Total cycles recorded.
    #[must_use]
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Cycles whose user code exceeded the period.
    #[must_use]
    pub fn overrun_count(&self) -> u64 {
        self.overrun_count
    }

    /// Cycles that started late and reset the deadline.
    #[must_use]
    pub fn late_count(&self) -> u64 {
        self.late_count
    }

    /// Mean user-code duration.
    #[must_use]
    pub fn mean_us(&self) -> Option<u64> {
        (self.total_cycles > 0).then(|| self.sum_us / self.total_cycles)
    }

    /// Compute a user-code duration percentile from the ring buffer.
    ///
    /// Returns `None` with no samples or a percentile outside 0..=100.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<u64> {
        self.percentiles(&[percentile]).first().map(|&(_, v)| v)
    }

    /// Compute several percentiles with one sort. Invalid entries are skipped.
    #[must_use]
    pub fn percentiles(&self, percentiles: &[f64]) -> Vec<(f64, u64)> {
        if self.sample_count == 0 {
            return vec![];
        }

        let mut sorted: Vec<u64> = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();
        let last = sorted.len() - 1;

        percentiles
            .iter()
            .filter(|p| (0.0..=100.0).contains(*p))
            .map(|&p| {
                let idx = ((p / 100.0) * last as f64).round() as usize;
                (p, sorted[idx.min(last)])
            })
            .collect()
    }

    /// Get a snapshot of current statistics.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let any = self.total_cycles > 0;
        StatsSnapshot {
            total_cycles: self.total_cycles,
            min_us: any.then_some(self.min_us),
            max_us: any.then_some(self.max_us),
            mean_us: self.mean_us(),
            max_jitter_us: self.max_jitter_us,
            overrun_count: self.overrun_count,
            late_count: self.late_count,
            sample_count: self.sample_count,
        }
    }
}

/// Immutable snapshot of loop statistics for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Total cycles recorded.
    pub total_cycles: u64,
    /// Shortest user-code duration.
    pub min_us: Option<u64>,
    /// Longest user-code duration.
    pub max_us: Option<u64>,
    /// Mean user-code duration.
    pub mean_us: Option<u64>,
    /// Largest wait jitter seen.
    pub max_jitter_us: u64,
    /// User-code overruns.
    pub overrun_count: u64,
    /// Late cycles (missed deadlines dropped).
    pub late_count: u64,
    /// Samples held in the histogram.
    pub sample_count: usize,
}
