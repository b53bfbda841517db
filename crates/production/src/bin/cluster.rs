//! Lamport Cluster CLI
//!
//! Launches N machines in one process on consecutive localhost ports, lets
//! them exchange clock messages for a while, then shuts them down and prints
//! a per-machine summary.

use anyhow::{Context, Result};
use clap::Parser;
use lamport_core::{EventSink, FanoutSink, MemorySink, QueueConfig};
use lamport_node::EventRanges;
use lamport_production::{
    sink_for, Backoff, ClockRateRange, Machine, MachineConfig, MachineReport, RetryPolicy,
};
use lamport_types::{EventKind, MachineId};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lamport-cluster")]
#[command(about = "Run a cluster of Lamport-clock machines on localhost")]
#[command(version)]
struct Cli {
    /// Number of machines
    #[arg(short, long)]
    machines: Option<u32>,

    /// Port of machine 1; machine N listens on base_port + N - 1
    #[arg(long)]
    base_port: Option<u16>,

    /// How long to run (e.g., "30s", "5m")
    #[arg(short, long)]
    duration: Option<humantime::Duration>,

    /// Seed for reproducible clock rates and event draws
    #[arg(long)]
    seed: Option<u64>,

    /// Directory for per-machine JSON-lines event logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// TOML file with cluster settings; flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also write diagnostic logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Cluster settings as read from a TOML file.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct ClusterFile {
    machines: u32,
    base_port: u16,
    #[serde(with = "duration_str")]
    duration: Duration,
    seed: Option<u64>,
    log_dir: Option<PathBuf>,
    clock_rate: ClockRateRange,
    retry: RetryFile,
    events: EventRanges,
    max_pending: Option<usize>,
    #[serde(with = "duration_str")]
    grace_period: Duration,
}

impl Default for ClusterFile {
    fn default() -> Self {
        Self {
            machines: 3,
            base_port: 5000,
            duration: Duration::from_secs(60),
            seed: None,
            log_dir: None,
            clock_rate: ClockRateRange::default(),
            retry: RetryFile::default(),
            events: EventRanges::default(),
            max_pending: None,
            grace_period: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RetryFile {
    max_attempts: u32,
    #[serde(with = "duration_str")]
    initial_delay: Duration,
    backoff: Backoff,
    #[serde(with = "duration_str")]
    max_delay: Duration,
}

impl Default for RetryFile {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay: policy.initial_delay,
            backoff: policy.backoff,
            max_delay: policy.max_delay,
        }
    }
}

impl From<RetryFile> for RetryPolicy {
    fn from(file: RetryFile) -> Self {
        Self {
            max_attempts: file.max_attempts,
            initial_delay: file.initial_delay,
            backoff: file.backoff,
            max_delay: file.max_delay,
        }
    }
}

/// Durations in the file are humantime strings such as "1500ms" or "2m".
mod duration_str {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

impl ClusterFile {
    fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(machines) = cli.machines {
            self.machines = machines;
        }
        if let Some(base_port) = cli.base_port {
            self.base_port = base_port;
        }
        if let Some(duration) = cli.duration {
            self.duration = *duration;
        }
        if cli.seed.is_some() {
            self.seed = cli.seed;
        }
        if cli.log_dir.is_some() {
            self.log_dir = cli.log_dir.clone();
        }
    }

    fn address(&self, id: u32) -> Result<SocketAddr> {
        let port = u32::from(self.base_port) + id - 1;
        let port = u16::try_from(port).with_context(|| format!("Port for machine {id} overflows"))?;
        Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    fn machine_config(&self, id: u32) -> Result<MachineConfig> {
        let mut config = MachineConfig::new(MachineId(id), self.address(id)?)
            .with_clock_rate(self.clock_rate)
            .with_retry(RetryPolicy::from(self.retry.clone()))
            .with_events(self.events.clone())
            .with_grace_period(self.grace_period);
        for peer in (1..=self.machines).filter(|p| *p != id) {
            config = config.with_peer(MachineId(peer), self.address(peer)?);
        }
        if let Some(max_pending) = self.max_pending {
            config = config.with_queue(QueueConfig::bounded(max_pending));
        }
        if let Some(seed) = self.seed {
            // Distinct but reproducible stream per machine.
            config = config.with_seed(seed.wrapping_add(u64::from(id)));
        }
        if let Some(dir) = &self.log_dir {
            config = config.with_log_dir(dir);
        }
        Ok(config)
    }
}

fn init_tracing(cli: &Cli) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let Some(log_file) = &cli.log_file else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
        return Ok(None);
    };

    let directory = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    fs::create_dir_all(&directory)?;
    let file_name = log_file
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Invalid log file name"))?
        .to_os_string();

    let file_appender = tracing_appender::rolling::never(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_env_filter(filter())
        .init();
    Ok(Some(guard))
}

/// Events seen by one machine, grouped by kind label.
fn events_by_kind(sink: &MemorySink) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for record in sink.records() {
        *counts.entry(record.kind.label()).or_insert(0) += 1;
    }
    counts
}

fn print_summary(results: &[(MachineId, MemorySink, Option<MachineReport>)]) {
    println!();
    println!("=== Cluster Summary ===");
    for (id, sink, report) in results {
        let Some(report) = report else {
            println!("{id}: failed to start");
            continue;
        };
        let kinds = events_by_kind(sink)
            .into_iter()
            .map(|(kind, count)| format!("{kind}={count}"))
            .collect::<Vec<_>>()
            .join(" ");
        let max_drift = sink
            .records()
            .iter()
            .filter_map(|r| match r.kind {
                EventKind::Receive { .. } => r.drift(),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        println!(
            "{id}: rate={}/s ticks={} final_clock={} max_drift={} send_failures={} degraded={} [{kinds}]",
            report.clock_rate,
            report.ticks,
            report.final_clock,
            max_drift,
            report.send_failures,
            report.degraded,
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli)?;

    let mut settings = match &cli.config {
        Some(path) => ClusterFile::load(path)?,
        None => ClusterFile::default(),
    };
    settings.apply_overrides(&cli);
    anyhow::ensure!(settings.machines >= 1, "Need at least one machine");

    info!(
        machines = settings.machines,
        base_port = settings.base_port,
        duration = %humantime::format_duration(settings.duration),
        "Starting cluster"
    );

    let mut handles = Vec::new();
    let mut tasks = Vec::new();
    let mut sinks = Vec::new();
    for id in 1..=settings.machines {
        let config = settings.machine_config(id)?;
        let memory = MemorySink::new();
        let sink: Arc<dyn EventSink> = Arc::new(
            FanoutSink::new()
                .with(sink_for(&config)?)
                .with(Arc::new(memory.clone())),
        );
        let machine = Machine::new(config, sink)?;
        handles.push(machine.handle());
        sinks.push((machine.id(), memory));
        tasks.push(tokio::spawn(machine.run()));
    }

    tokio::select! {
        _ = tokio::time::sleep(settings.duration) => info!("Run duration elapsed"),
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        },
    }

    for handle in &handles {
        handle.shutdown();
    }

    let mut results = Vec::new();
    for ((id, sink), task) in sinks.into_iter().zip(tasks) {
        let report = match task.await? {
            Ok(report) => Some(report),
            Err(e) => {
                error!(machine = id.get(), error = %e, "Machine failed");
                None
            }
        };
        results.push((id, sink, report));
    }

    print_summary(&results);
    Ok(())
}
