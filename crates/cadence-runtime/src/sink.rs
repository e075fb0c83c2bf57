//! Metric sinks.
//!
//! The scheduler reports named numeric values through [`MetricSink::record`]
//! and closes each cycle with [`MetricSink::end_cycle`]. Sinks live on the
//! loop thread and must not block for long.

use cadence_common::config::{MetricsConfig, SinkKind};
use cadence_common::error::{LoopError, LoopResult};
use serde_json::{Map, Number, Value};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{trace, warn};

/// Receiver of per-cycle named metrics.
pub trait MetricSink: Send {
    /// Record one value for the current cycle.
    fn record(&mut self, name: &str, value: f64);

    /// All values for the current cycle have been recorded.
    fn end_cycle(&mut self) {}

    /// Push out anything buffered. Called when the loop exits.
    fn flush(&mut self) {}
}

/// Build the sink selected by `config`.
///
/// # Errors
///
/// Returns [`LoopError::Config`] if the JSON output file cannot be created.
pub fn create_sink(config: &MetricsConfig) -> LoopResult<Box<dyn MetricSink>> {
    match config.sink {
        SinkKind::Tracing => Ok(Box::new(TracingSink::default())),
        SinkKind::None => Ok(Box::new(NullSink)),
        SinkKind::Json => {
            let path = config
                .json_path
                .as_ref()
                .ok_or_else(|| LoopError::Config("json sink requires json_path".into()))?;
            let file = File::create(path).map_err(|e| {
                LoopError::Config(format!("cannot create {}: {e}", path.display()))
            })?;
            Ok(Box::new(JsonLinesSink::new(BufWriter::new(file))))
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricSink for NullSink {
    fn record(&mut self, _name: &str, _value: f64) {}
}

/// Emits one `trace` event per cycle with all values attached.
#[derive(Debug, Default)]
pub struct TracingSink {
    pending: Vec<(String, f64)>,
    cycle: u64,
}

impl MetricSink for TracingSink {
    fn record(&mut self, name: &str, value: f64) {
        self.pending.push((name.to_owned(), value));
    }

    fn end_cycle(&mut self) {
        trace!(
            target: "cadence::metrics",
            cycle = self.cycle,
            metrics = ?self.pending,
            "Cycle metrics"
        );
        self.pending.clear();
        self.cycle += 1;
    }
}

/// Cycles between explicit flushes of a [`JsonLinesSink`].
pub const JSON_FLUSH_INTERVAL: u64 = 256;

/// Writes one JSON object per cycle: `{"cycle": n, "<name>": value, ...}`.
///
/// Output is left to the writer's buffering and flushed every
/// [`JSON_FLUSH_INTERVAL`] cycles and on [`MetricSink::flush`].
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
    current: Map<String, Value>,
    cycle: u64,
    failed: bool,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            current: Map::new(),
            cycle: 0,
            failed: false,
        }
    }

    /// Unwrap the writer.
    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_line(&mut self) -> std::io::Result<()> {
        let mut line = Map::new();
        line.insert("cycle".into(), Value::from(self.cycle));
        line.append(&mut self.current);
        serde_json::to_writer(&mut self.writer, &Value::Object(line))?;
        self.writer.write_all(b"\n")?;
        if (self.cycle + 1) % JSON_FLUSH_INTERVAL == 0 {
            self.writer.flush()?;
        }
        Ok(())
    }

    fn report(&mut self, result: std::io::Result<()>) {
        if let Err(e) = result {
            if !self.failed {
                warn!(error = %e, "Metric output failed, further errors suppressed");
                self.failed = true;
            }
        }
    }
}

impl<W: Write + Send> MetricSink for JsonLinesSink<W> {
    fn record(&mut self, name: &str, value: f64) {
        // Non-finite values have no JSON representation
        let value = Number::from_f64(value).map_or(Value::Null, Value::Number);
        self.current.insert(name.to_owned(), value);
    }

    fn end_cycle(&mut self) {
        let result = self.write_line();
        self.report(result);
        self.current.clear();
        self.cycle += 1;
    }

    fn flush(&mut self) {
        let result = self.writer.flush();
        self.report(result);
    }
}

/// One recorded value.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    /// Cycle index, starting at 0 for the init record.
    pub cycle: u64,
    /// Metric name.
    pub name: String,
    /// Value.
    pub value: f64,
}

#[derive(Debug, Default)]
struct MemoryLog {
    records: Vec<MetricRecord>,
    cycles: u64,
}

/// Keeps every record in memory; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    log: Arc<Mutex<MemoryLog>>,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records so far.
    #[must_use]
    pub fn records(&self) -> Vec<MetricRecord> {
        self.lock().records.clone()
    }

    /// Values recorded under `name`, in cycle order.
    #[must_use]
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.lock()
            .records
            .iter()
            .filter(|r| r.name == name)
            .map(|r| r.value)
            .collect()
    }

    /// Number of completed cycles.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.lock().cycles
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MetricSink for MemorySink {
    fn record(&mut self, name: &str, value: f64) {
        let mut log = self.lock();
        let cycle = log.cycles;
        log.records.push(MetricRecord {
            cycle,
            name: name.to_owned(),
            value,
        });
    }

    fn end_cycle(&mut self) {
        self.lock().cycles += 1;
    }
}
