//! Hypha - multi-agent orchestration runtime server
//!
//! Boots a runtime with the built-in blueprints and serves the HTTP control
//! surface until interrupted.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use hypha::http_api::{bind, create_app, serve_with_graceful_shutdown};
use hypha::{MemoryStore, Runtime, RuntimeConfig};

/// Command-line options.
#[derive(Debug, Parser)]
#[command(name = "hypha", about = "A supervised multi-agent orchestration runtime")]
struct Cli {
    /// Path to a JSON runtime configuration; development defaults when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address the HTTP control surface listens on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Attempt a warm restart from the configured store before serving.
    #[arg(long)]
    restore: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("hypha=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RuntimeConfig::load_from_file(path)?,
        None => RuntimeConfig::development(),
    };
    info!(
        workers = config.worker_thread_count.as_usize(),
        inbox_capacity = config.inbox_capacity.as_usize(),
        health_interval_ms = config.health_interval_ms.as_u64(),
        "configuration loaded"
    );

    let scheduler = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_thread_count.as_usize())
        .enable_all()
        .build()?;
    scheduler.block_on(serve(cli, config))
}

async fn serve(cli: Cli, config: RuntimeConfig) -> Result<()> {
    let runtime = Runtime::builder(config)
        .store(Arc::new(MemoryStore::new()))
        .build()?;
    if cli.restore {
        let report = runtime.restore().await?;
        info!(
            agents = report.agents,
            messages = report.messages,
            "warm restart applied"
        );
    }
    runtime.start();

    let (listener, addr) = bind(cli.listen).await?;
    info!("control surface listening on http://{addr}");

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve_with_graceful_shutdown(
        listener,
        create_app(runtime.control()),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received; shutting down");
    shutdown.cancel();
    server.await??;
    runtime.shutdown().await;

    Ok(())
}
