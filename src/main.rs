use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use specter_analyzer::Analyzer;
use specter_core::config::AnalyzerConfig;
use specter_core::metadata::MetadataRegistry;
use specter_core::metrics::AnalyzerMetrics;
use specter_probe::{ProbeBackend, ReplayProbe};
use specter_protocol::DecoderRegistry;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "specter", about = "eBPF network observability collector", version)]
struct Cli {
    /// Path to a JSON config file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Unix socket the probe bridge sends events to (Linux)
    #[arg(short, long, default_value = "/tmp/specter-probe.sock")]
    socket: PathBuf,

    /// Replay events from a JSONL capture instead of the live bridge
    #[arg(short, long)]
    replay: Option<PathBuf>,

    /// Override the worker lane count from the config
    #[arg(short, long)]
    workers: Option<usize>,

    /// Seconds between metrics log lines
    #[arg(long, default_value = "30")]
    metrics_interval: u64,
}

fn build_probe(cli: &Cli) -> anyhow::Result<Box<dyn ProbeBackend>> {
    if let Some(path) = &cli.replay {
        return Ok(Box::new(ReplayProbe::new(path.clone())));
    }
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(specter_probe::UnixSocketProbe::new(
            cli.socket.clone(),
        )))
    }
    #[cfg(not(target_os = "linux"))]
    {
        anyhow::bail!("the live probe bridge is Linux-only; use --replay elsewhere")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AnalyzerConfig::from_file(path)?,
        None => AnalyzerConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }

    let registry = Arc::new(DecoderRegistry::new(config.port_protocol_map.clone()));
    // The Kubernetes watcher swaps snapshots in at runtime; until the
    // first swap, lookups miss and pairs go out unenriched.
    let metadata = Arc::new(MetadataRegistry::new());
    let metrics = AnalyzerMetrics::new();

    let mut probe = build_probe(&cli)?;
    probe.init().map_err(|e| anyhow::anyhow!("{e}"))?;
    for syscall in [
        "read", "write", "sendto", "recvfrom", "readv", "writev", "close",
    ] {
        probe
            .subscribe(syscall, "net")
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    let events_rx = probe.start().map_err(|e| anyhow::anyhow!("{e}"))?;
    info!(source = probe.name(), "event source started");

    let (analyzer, mut pairs_rx) =
        Analyzer::start(&config, registry, metadata, metrics.clone(), events_rx);

    let mut metrics_tick = tokio::time::interval(Duration::from_secs(cli.metrics_interval.max(1)));
    metrics_tick.tick().await; // the first tick is immediate

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            _ = metrics_tick.tick() => {
                let snapshot = serde_json::to_string(&metrics.snapshot())?;
                info!(metrics = %snapshot, "pipeline metrics");
            }
            pair = pairs_rx.recv() => match pair {
                Some(pair) => {
                    info!(
                        protocol = %pair.protocol,
                        latency_ms = pair.latency_ns / 1_000_000,
                        is_error = pair.is_error,
                        server = pair.server.map(|s| s.to_string()).unwrap_or_default(),
                        "pair"
                    );
                    debug!(attributes = ?pair.attributes, "pair attributes");
                }
                // Replay finished and every lane flushed.
                None => break,
            }
        }
    }

    probe.stop().map_err(|e| anyhow::anyhow!("{e}"))?;
    analyzer.stop().await;

    // Drain pairs flushed during shutdown so they still get logged.
    while let Ok(pair) = pairs_rx.try_recv() {
        info!(protocol = %pair.protocol, is_error = pair.is_error, "pair (flushed)");
    }
    let snapshot = serde_json::to_string(&metrics.snapshot())?;
    info!(metrics = %snapshot, "final metrics");

    Ok(())
}
