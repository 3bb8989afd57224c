// Lanegate - Main Entry Point
//
// Loads the router configuration, wires the quota store, usage recorder,
// router, and metrics exporter together, spawns the reservation sweeper,
// and serves the operational HTTP endpoints.

use anyhow::{Context, Result};
use clap::Parser;
use lanegate::config::{ConfigHandle, RouterConfig};
use lanegate::metrics::MetricsExporter;
use lanegate::quota::QuotaStore;
use lanegate::router::{self, Router};
use lanegate::server::{self, AppState};
use lanegate::usage::UsageRecorder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Lanegate: quota-aware multi-upstream request router
#[derive(Parser, Debug)]
#[command(name = "lanegate")]
#[command(version = "0.1.0")]
#[command(about = "Quota-aware request router for multi-upstream LLM gateways", long_about = None)]
struct Args {
    /// Path to the router configuration file
    #[arg(short, long, default_value = "config/lanegate.json")]
    config: PathBuf,

    /// Address to serve the operational endpoints on
    #[arg(short, long, default_value = "127.0.0.1:8088")]
    listen: SocketAddr,

    /// How often to sweep overdue reservations, in seconds
    #[arg(long, default_value_t = 10)]
    sweep_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(filter.into())
                .from_env_lossy(),
        )
        .init();

    info!("lanegate v0.1.0 starting");

    let config = RouterConfig::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;

    let now = chrono::Utc::now();
    let recorder = Arc::new(
        UsageRecorder::open(&config.usage_log_path).with_context(|| {
            format!(
                "failed to open usage log {}",
                config.usage_log_path.display()
            )
        })?,
    );
    let store = Arc::new(QuotaStore::from_config(&config, now));
    let handle = Arc::new(ConfigHandle::new(config));
    let gate = Arc::new(Router::new(
        handle,
        Arc::clone(&store),
        Arc::clone(&recorder),
    ));

    router::spawn_sweeper(
        Arc::clone(&gate),
        Duration::from_secs(args.sweep_interval_secs),
    );

    let state = AppState {
        exporter: MetricsExporter::new(store, recorder),
        router: gate,
        config_path: args.config,
    };
    server::serve(state, args.listen).await
}
