//! Cadence daemon entry point.
//!
//! Runs a demo program on the fixed-period loop, in real time or on a
//! simulated clock, with signal-driven shutdown and periodic status logs.

mod demo;
mod signals;

use anyhow::{Context, Result};
use cadence_common::config::{LoopConfig, SinkKind};
use cadence_common::metrics::StatsSnapshot;
use cadence_runtime::{
    prepare_realtime, CounterSource, LoopExit, PeriodicScheduler, ResourceUsageSampler,
    RusageSource, SchedulerBuilder, SharedCounters, SimAlarm, SimClock,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::demo::DemoProgram;
use crate::signals::SignalHandler;

/// Simulated runs start here so early timestamps are not mistaken for "unset".
const SIM_EPOCH_US: u64 = 1_000_000;

/// Cadence daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "cadence-daemon",
    about = "Fixed-period robot loop daemon",
    version,
    long_about = None
)]
struct Args {
    /// Path to a loop configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Loop period (overrides config file), e.g. "20ms".
    #[arg(long, short = 'p', value_parser = humantime::parse_duration)]
    period: Option<Duration>,

    /// Start in free-run mode (no waiting between cycles).
    #[arg(long)]
    free_run: bool,

    /// Run on a simulated clock instead of real time.
    #[arg(long, short = 's')]
    simulated: bool,

    /// Maximum cycles to run (0 = infinite).
    #[arg(long, default_value = "0")]
    max_cycles: u64,

    /// Time the demo program spends per cycle.
    #[arg(long, default_value = "5ms", value_parser = humantime::parse_duration)]
    work: Duration,

    /// Write per-cycle metrics as JSON lines to this file.
    #[arg(long, value_name = "FILE")]
    metrics_out: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting cadence daemon");

    let mut config = load_config(&args)?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    info!(
        name = %config.name,
        period = ?config.period,
        timing_enabled = config.timing_enabled,
        alarm = ?config.alarm,
        sink = ?config.metrics.sink,
        "Configuration loaded"
    );

    prepare_realtime(&config.realtime).context("Failed to prepare real-time thread")?;

    let (mut scheduler, mut program) = build(&config, &args)?;

    let handle = scheduler.handle();
    let signal_handler = SignalHandler::install(move |_| handle.stop())
        .context("Failed to set up signal handlers")?;

    let exit = scheduler
        .run(&mut program)
        .context("Robot program terminated with an error")?;

    if signal_handler.shutdown_requested() {
        info!("Loop stopped by signal");
    }
    let snapshot = scheduler.stats().snapshot();
    log_summary(&scheduler, exit, &snapshot, &config.metrics.percentiles);
    info!(
        signals = signal_handler.state().signal_count(),
        cycles = program.cycles(),
        "Daemon shutdown complete"
    );
    Ok(())
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("cadence_daemon={level},cadence_runtime={level},cadence_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `CADENCE_CONFIG` environment variable
/// 3. `/etc/cadence/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<LoopConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return LoopConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()));
    }

    if let Ok(env_path) = std::env::var("CADENCE_CONFIG") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from CADENCE_CONFIG");
            return LoopConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from CADENCE_CONFIG={env_path}"));
        }
        warn!(
            path = %env_path,
            "CADENCE_CONFIG set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/cadence/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config");
            return LoopConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {path}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(LoopConfig::default())
}

/// Command-line flags win over the file.
fn apply_overrides(config: &mut LoopConfig, args: &Args) {
    if let Some(period) = args.period {
        config.period = period;
    }
    if args.free_run {
        config.timing_enabled = false;
    }
    if let Some(path) = &args.metrics_out {
        config.metrics.sink = SinkKind::Json;
        config.metrics.json_path = Some(path.clone());
    }
}

/// Build the scheduler and demo program for real or simulated time.
fn build(config: &LoopConfig, args: &Args) -> Result<(PeriodicScheduler, DemoProgram)> {
    let counters = SharedCounters::new();
    let demo_counter = counters.register("demo");

    let sources: Vec<Box<dyn CounterSource>> = if config.sampler.enabled {
        vec![
            Box::new(RusageSource::new(config.sampler.rusage, config.sampler.schedstat)),
            Box::new(counters),
        ]
    } else {
        Vec::new()
    };
    let sampler = ResourceUsageSampler::new(sources);

    let builder = SchedulerBuilder::new()
        .config(config.clone())
        .sampler(sampler)
        .simulation(args.simulated);
    let program = DemoProgram::new(args.work, args.max_cycles).with_counter(demo_counter);

    if args.simulated {
        let clock = SimClock::new(SIM_EPOCH_US);
        let alarm = Arc::new(SimAlarm::new(&config.name, clock.clone()));
        let scheduler = builder
            .build_with(Arc::new(clock.clone()), alarm)
            .context("Failed to create simulated scheduler")?;
        Ok((scheduler, program.simulated(clock)))
    } else {
        let scheduler = builder.build().context("Failed to create scheduler")?;
        Ok((scheduler, program))
    }
}

fn log_summary(
    scheduler: &PeriodicScheduler,
    exit: LoopExit,
    snapshot: &StatsSnapshot,
    percentiles: &[f64],
) {
    let percentiles = scheduler.stats().percentiles(percentiles);
    info!(
        name = scheduler.name(),
        ?exit,
        total_cycles = snapshot.total_cycles,
        min_us = ?snapshot.min_us,
        mean_us = ?snapshot.mean_us,
        max_us = ?snapshot.max_us,
        max_jitter_us = snapshot.max_jitter_us,
        overruns = snapshot.overrun_count,
        late = snapshot.late_count,
        ?percentiles,
        "Loop summary"
    );
    match serde_json::to_string(snapshot) {
        Ok(json) => info!(stats = %json, "Final statistics"),
        Err(e) => warn!(error = %e, "Failed to serialize statistics"),
    }
}
