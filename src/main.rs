//! Air-quality exporter — polls air-quality providers and exposes the
//! readings as Prometheus gauges.
//!
//! Each configured provider instance runs its own poller task. All of
//! them publish into one shared metrics registry, which is served over
//! HTTP at `/metrics`.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod adapters;
mod config;
mod metrics;
mod poller;
mod publisher;
mod quota;
mod retry;
mod server;

use config::{ExporterConfig, LogFormat, DEFAULT_CONFIG_FILENAME};
use metrics::{MetricKind, MetricsSink, PrometheusSink};
use poller::PollerHandle;
use server::Server;

/// How long stopped pollers get to finish their current cycle.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const INFO_METRIC: &str = "airquality_exporter_info";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, env = "CONFIG_FILENAME", default_value = DEFAULT_CONFIG_FILENAME)]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

fn init_tracing(config: &ExporterConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("airquality_exporter={}", config.log_level).into());

    match config.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ExporterConfig::load(&args.config)?;

    init_tracing(&config);

    info!("🌫️  Air-quality exporter v{}", env!("CARGO_PKG_VERSION"));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(config = %args.config.display(), env = %config.env_name, "Configuration loaded");

    // ── Metrics ─────────────────────────────────────────────────────
    let sink = Arc::new(PrometheusSink::new());
    publisher::describe(&*sink);
    sink.init(INFO_METRIC, MetricKind::Gauge, "Air-quality exporter build information");
    sink.set(
        INFO_METRIC,
        1.0,
        &[("version", env!("CARGO_PKG_VERSION")), ("env", config.env_name.as_str())],
    );

    // ── Adapters ────────────────────────────────────────────────────
    let shared: Arc<dyn MetricsSink> = sink.clone();
    let adapters = adapters::build_all(&config, shared).context("Failed to configure adapters")?;
    for adapter in &adapters {
        info!(adapter = adapter.name(), provider = adapter.provider_id(), "Adapter ready");
    }
    if adapters.is_empty() {
        warn!("No providers configured, only exporter metrics will be served");
    }

    let addr = config.metrics.socket_addr()?;
    if args.check_config {
        info!(adapters = adapters.len(), listen = %addr, "✅ Configuration is valid");
        return Ok(());
    }

    // ── Serve ───────────────────────────────────────────────────────
    let server = Server::bind(addr, Arc::clone(&sink)).await?;
    let handles: Vec<PollerHandle> = adapters.into_iter().map(|a| a.spawn()).collect();
    info!(pollers = handles.len(), "🚀 Pollers started");

    let served = server.run(shutdown_signal()).await;

    // ── Shutdown ────────────────────────────────────────────────────
    for handle in &handles {
        handle.stop();
    }
    let pending = handles.len();
    let joined = join_all(handles);
    if tokio::time::timeout(SHUTDOWN_GRACE, joined).await.is_err() {
        warn!(
            pollers = pending,
            "Pollers still busy after {}s, exiting anyway",
            SHUTDOWN_GRACE.as_secs()
        );
    }

    info!("Air-quality exporter stopped");
    served
}

/// Wait for every poller task in turn.
async fn join_all(handles: Vec<PollerHandle>) {
    for handle in handles {
        let name = handle.name().to_string();
        handle.join().await;
        info!(adapter = %name, "Poller finished");
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received, shutting down"),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await
        }
    }
}
