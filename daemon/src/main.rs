mod events;
mod http;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stacksync::config::{default_cache_dir, load_applications, TargetMode};

use crate::state::Daemon;

/// Reconciles declared applications against their target environments.
#[derive(Debug, Parser)]
#[command(name = "stacksyncd", version, about)]
struct Cli {
    /// Application file or directory of application files.
    #[arg(short, long, env = "STACKSYNC_CONFIG")]
    config: PathBuf,

    /// Address of the HTTP API.
    #[arg(long, env = "STACKSYNC_LISTEN", default_value = "127.0.0.1:8089")]
    listen: SocketAddr,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// kubeconfig context for every application, overriding destination.context.
    #[arg(long)]
    kubectl_context: Option<String>,

    /// Keep live state in memory instead of talking to a cluster.
    #[arg(long, conflicts_with = "kubectl_context")]
    in_memory: bool,

    /// Where git mirrors are kept.
    #[arg(long, env = "STACKSYNC_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
}

impl Cli {
    fn target_mode(&self) -> TargetMode {
        if self.in_memory {
            TargetMode::InMemory
        } else {
            TargetMode::Kubectl {
                context: self.kubectl_context.clone(),
            }
        }
    }
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    // Prefer RUST_LOG from env, otherwise use the provided level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json());
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = tracing_subscriber::registry().with(filter).with(fmt::layer());
        tracing::subscriber::set_global_default(subscriber)?;
    }

    // The library logs through the `log` facade
    tracing_log::LogTracer::init()?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json)?;

    info!("Starting stacksyncd v{}", env!("CARGO_PKG_VERSION"));

    let applications = load_applications(&cli.config)
        .with_context(|| format!("failed to load applications from {}", cli.config.display()))?;
    let cache_root = cli.cache_dir.clone().unwrap_or_else(default_cache_dir);
    info!(
        applications = applications.len(),
        cache = %cache_root.display(),
        "Configuration loaded"
    );

    let mut daemon = Daemon::build(&applications, &cache_root, &cli.target_mode())?;
    let event_logger = events::spawn_event_logger(daemon.broadcaster().subscribe());
    daemon.start();

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    info!("HTTP API listening on {}", cli.listen);

    let served = axum::serve(listener, http::router(daemon.api_state()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tokio::task::spawn_blocking(move || daemon.shutdown())
        .await
        .context("shutdown task failed")?;
    event_logger.abort();

    served.context("HTTP server failed")?;
    Ok(())
}
