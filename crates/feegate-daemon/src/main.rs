//! feegate-daemon - listing-fee daemon binary.
//!
//! Loads the TOML configuration, opens the fee store and runs the configured
//! drivers until SIGINT or SIGTERM:
//!
//! - executor polling pass and the execution queue consumer
//! - reconciler cycle (discovery, settlement, pending repair, deactivation)
//! - health endpoint (`GET /healthz`)
//!
//! Each driver finishes its in-flight cycle before the process exits.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use feegate_core::config::FeegateConfig;
use feegate_daemon::daemon::Daemon;
use feegate_daemon::state::{ShutdownTrigger, shutdown_channel};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// feegate daemon command-line arguments
#[derive(Parser, Debug)]
#[command(name = "feegate-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "feegate.toml")]
    config: PathBuf,

    /// Fee store path (overrides config)
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) or an `EnvFilter` directive
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Health endpoint port (overrides config)
    #[arg(long)]
    health_port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<FeegateConfig> {
    let mut config = FeegateConfig::from_file(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(path) = &args.store_path {
        config.store.path.clone_from(path);
    }
    if let Some(port) = args.health_port {
        config.health.port = port;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn async_main(args: Args) -> Result<()> {
    init_tracing(&args)?;
    let config = load_config(&args)?;

    info!(
        config = %args.config.display(),
        store = %config.store.path.display(),
        asset = %config.fee.asset,
        amount = %config.fee.amount,
        destination = %config.fee.destination,
        signer = %config.signer.base_url,
        "feegate daemon starting"
    );

    let (trigger, shutdown) = shutdown_channel();
    let daemon = Daemon::start(&config, shutdown)
        .await
        .context("failed to start daemon")?;

    wait_for_signal(&trigger).await?;
    daemon.join().await;

    info!("feegate daemon stopped");
    Ok(())
}

async fn wait_for_signal(trigger: &ShutdownTrigger) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    trigger.request_shutdown();
    Ok(())
}
