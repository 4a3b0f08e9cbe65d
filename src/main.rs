use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use roundhouse::config::Config;
use roundhouse::pipeline::{NoopServiceManager, Pipeline};
use roundhouse::store::MemStore;

/// Round-robin-archive time-series ingestion engine.
#[derive(Parser)]
#[command(name = "roundhouse", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Graceful-restart protocol list. When nonempty, listener sockets
    /// are inherited from the parent process, which is then signalled to
    /// flush and exit.
    #[arg(long, default_value = "")]
    graceful: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("roundhouse {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = cfg.workers,
        "starting roundhouse",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg, &cli.graceful).await })
}

async fn run(cfg: Config, graceful: &str) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // The durable store is a deployment concern; the in-memory store
    // stands in until a disk- or DB-backed implementation is wired here.
    let store = Arc::new(MemStore::new());

    let mut pipeline = Pipeline::new(cfg, store, Box::new(NoopServiceManager))
        .context("creating pipeline")?;
    pipeline.start(graceful).await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    pipeline.stop().await;

    tracing::info!("roundhouse stopped");

    Ok(())
}
