//! Configuration structures for the periodic loop.
//!
//! Supports TOML deserialization with defaults matching a 50 Hz robot
//! control loop; every field can be omitted.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default loop period (20 ms).
pub const DEFAULT_PERIOD: Duration = Duration::from_micros(20_000);

/// Top-level loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Loop name, used for the alarm and as metric key prefix.
    pub name: String,

    /// Target period between cycle starts.
    #[serde(with = "humantime_serde")]
    pub period: Duration,

    /// Wait for deadlines (`false` = free-run).
    pub timing_enabled: bool,

    /// Alarm primitive backing the blocking wait.
    pub alarm: AlarmKind,

    /// Resource usage sampling.
    pub sampler: SamplerConfig,

    /// Metric emission and statistics.
    pub metrics: MetricsConfig,

    /// Real-time thread preparation.
    pub realtime: RealtimeConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            name: String::from("RobotLoop"),
            period: DEFAULT_PERIOD,
            timing_enabled: true,
            alarm: AlarmKind::default(),
            sampler: SamplerConfig::default(),
            metrics: MetricsConfig::default(),
            realtime: RealtimeConfig::default(),
        }
    }
}

/// Alarm primitive selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlarmKind {
    /// Best OS primitive: timerfd on Linux, condvar elsewhere.
    #[default]
    Native,
    /// Portable mutex/condvar alarm.
    Condvar,
}

/// Which counter sources the sampler tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Sample resource counters each cycle.
    pub enabled: bool,
    /// Track `getrusage` counters.
    pub rusage: bool,
    /// Track run-queue wait from `/proc/thread-self/schedstat`.
    pub schedstat: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rusage: true,
            schedstat: true,
        }
    }
}

/// Destination for per-cycle metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// One `tracing` event per cycle.
    #[default]
    Tracing,
    /// JSON lines written to `metrics.json_path`.
    Json,
    /// Discard.
    None,
}

/// Metrics and statistics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Where per-cycle metrics go.
    pub sink: SinkKind,

    /// Output file for the JSON lines sink.
    pub json_path: Option<PathBuf>,

    /// Size of the user-code duration ring buffer.
    pub histogram_size: usize,

    /// Percentiles reported in status and summary logs.
    pub percentiles: Vec<f64>,

    /// Cycles between status log lines (0 disables).
    pub status_interval: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::Tracing,
            json_path: None,
            histogram_size: 3_000,
            percentiles: vec![50.0, 90.0, 99.0],
            status_interval: 500,
        }
    }
}

/// Real-time thread preparation for the loop thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Apply any of the settings below (requires privileges).
    pub enabled: bool,

    /// Scheduler policy.
    pub policy: SchedPolicy,

    /// Scheduler priority (1-99 for RT policies).
    pub priority: u8,

    /// CPUs to pin the loop thread to (empty = no pinning).
    pub cpu_affinity: Vec<usize>,

    /// Lock all memory pages (mlockall).
    pub lock_memory: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: SchedPolicy::Fifo,
            priority: 50,
            cpu_affinity: Vec::new(),
            lock_memory: true,
        }
    }
}

/// Scheduler policy for the loop thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// `SCHED_FIFO`.
    #[default]
    Fifo,
    /// `SCHED_RR`.
    Rr,
    /// `SCHED_OTHER` (non-RT).
    Other,
}

impl LoopConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Reject values the loop cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period.as_micros() == 0 {
            return Err(ConfigError::Invalid(
                "period must be at least 1us".into(),
            ));
        }
        if self.metrics.histogram_size == 0 {
            return Err(ConfigError::Invalid(
                "metrics.histogram_size must be non-zero".into(),
            ));
        }
        if let Some(p) = self
            .metrics
            .percentiles
            .iter()
            .find(|p| !(0.0..=100.0).contains(*p))
        {
            return Err(ConfigError::Invalid(format!(
                "metrics.percentiles contains {p}, expected 0..=100"
            )));
        }
        if self.metrics.sink == SinkKind::Json && self.metrics.json_path.is_none() {
            return Err(ConfigError::Invalid(
                "metrics.sink = \"json\" requires metrics.json_path".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = LoopConfig::default();
        assert_eq!(config.period, Duration::from_micros(20_000));
        assert!(config.timing_enabled);
        assert_eq!(config.alarm, AlarmKind::Native);
        assert!(!config.realtime.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            name = "Drivetrain"
            period = "10ms"
            timing_enabled = false
            alarm = "condvar"

            [sampler]
            schedstat = false

            [metrics]
            sink = "json"
            json_path = "/tmp/cycles.jsonl"
            percentiles = [50.0, 99.9]

            [realtime]
            enabled = true
            policy = "rr"
            cpu_affinity = [2, 3]
        "#;

        let config = LoopConfig::from_toml(toml).unwrap();
        assert_eq!(config.name, "Drivetrain");
        assert_eq!(config.period, Duration::from_millis(10));
        assert!(!config.timing_enabled);
        assert_eq!(config.alarm, AlarmKind::Condvar);
        assert!(config.sampler.rusage);
        assert!(!config.sampler.schedstat);
        assert_eq!(config.metrics.sink, SinkKind::Json);
        assert_eq!(config.metrics.percentiles, vec![50.0, 99.9]);
        assert_eq!(config.realtime.policy, SchedPolicy::Rr);
        assert_eq!(config.realtime.cpu_affinity, vec![2, 3]);
    }

    #[test]
    fn test_rejects_zero_period() {
        let err = LoopConfig::from_toml(r#"period = "0s""#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_json_sink_without_path() {
        let toml = r#"
            [metrics]
            sink = "json"
        "#;
        assert!(matches!(
            LoopConfig::from_toml(toml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_bad_percentile() {
        let mut config = LoopConfig::default();
        config.metrics.percentiles = vec![50.0, 120.0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_duration_is_parse_error() {
        let err = LoopConfig::from_toml(r#"period = "fast""#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = LoopConfig::default();
        let toml = config.to_toml().unwrap();
        let parsed = LoopConfig::from_toml(&toml).unwrap();
        assert_eq!(config.period, parsed.period);
        assert_eq!(config.name, parsed.name);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "period = \"5ms\"").unwrap();

        let config = LoopConfig::from_file(file.path()).unwrap();
        assert_eq!(config.period, Duration::from_millis(5));

        let missing = LoopConfig::from_file(std::path::Path::new("/nonexistent/cadence.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_sink_kind_names() {
        let kind: SinkKind = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(kind, SinkKind::None);
    }
}
