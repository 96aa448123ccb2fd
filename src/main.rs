//! Stratus Store
//!
//! Quota-bounded file store serving direct transfers over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Stratus Store                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐    │
//! │  │  Lifecycle   │───▶│ File Service │◀───│     REST     │    │
//! │  │   Handler    │    │              │    │   Handler    │    │
//! │  └──────┬───────┘    └──────┬───────┘    └──────────────┘    │
//! │         │ replies           │                                 │
//! │         ▼                   ▼                                 │
//! │   origin hosts      Storage Controller ── disk                │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stratus_store::adapters::{HttpOriginClient, OriginConfig};
use stratus_store::connector::DisposalConfig;
use stratus_store::handlers::{LifecycleHandler, RestConfig, RestHandler};
use stratus_store::metrics;
use stratus_store::service::{FileService, ServiceConfig};
use stratus_store::storage::StorageController;

/// Queued lifecycle commands before `POST /commands` applies backpressure
const COMMAND_QUEUE: usize = 256;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Stratus Store - quota-bounded local object store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the objects
    #[arg(long, env = "STORAGE_PATH", default_value = "./data")]
    storage_path: PathBuf,

    /// Quota ceiling in bytes
    #[arg(long, env = "STORAGE_SIZE")]
    storage_size: u64,

    /// Smallest reader buffer in bytes
    #[arg(long, env = "MIN_BUFFER_SIZE", default_value = "65536")]
    min_buffer_size: usize,

    /// Largest reader buffer in bytes
    #[arg(long, env = "MAX_BUFFER_SIZE", default_value = "5242880")]
    max_buffer_size: usize,

    /// Minutes between disposal sweeps
    #[arg(long, env = "DISPOSAL_SLEEP_IN_MINUTES", default_value = "20")]
    disposal_sleep_minutes: u64,

    /// Minutes a connection may stay idle before it is evicted
    #[arg(long, env = "DISPOSAL_KEEP_ALIVE_IN_MINUTES", default_value = "10")]
    disposal_keep_alive_minutes: u64,

    /// HTTP bind address
    #[arg(long, env = "URL", default_value = "0.0.0.0:8080")]
    url: SocketAddr,

    /// Seconds an HTTP connection may idle between requests
    #[arg(long, env = "HTTP_IDLE_TIMEOUT", default_value = "120")]
    http_idle_timeout: u64,

    /// Bearer token for calls to origin hosts
    #[arg(long, env = "EXCHANGE_TOKEN", hide_env_values = true)]
    exchange_token: Option<String>,

    /// Public host of this store, reported in lifecycle replies
    #[arg(long, env = "FOR_RABBIT_HOST", default_value = "")]
    public_host: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Deployment environment; `production` implies JSON logs
    #[arg(long, env = "ENV", default_value = "development")]
    env: String,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!(
        root = %args.storage_path.display(),
        max_bytes = args.storage_size,
        addr = %args.url,
        env = %args.env,
        "Starting Stratus Store"
    );
    metrics::init();

    tokio::fs::create_dir_all(&args.storage_path)
        .await
        .with_context(|| format!("creating {}", args.storage_path.display()))?;
    let controller = StorageController::open_local(&args.storage_path, args.storage_size)
        .await
        .context("opening storage")?;
    info!(
        files = controller.file_count(),
        used_bytes = controller.ledger().current(),
        "Storage opened"
    );

    let origin = Arc::new(
        HttpOriginClient::new(OriginConfig {
            token: args.exchange_token.clone(),
            ..OriginConfig::default()
        })
        .context("building origin client")?,
    );

    let service = Arc::new(FileService::new(
        Arc::new(controller),
        origin.clone(),
        ServiceConfig {
            min_buffer_size: args.min_buffer_size,
            max_buffer_size: args.max_buffer_size,
        },
    ));
    let disposal = service.start_disposal(DisposalConfig {
        interval: Duration::from_secs(args.disposal_sleep_minutes * 60),
        keep_alive: Duration::from_secs(args.disposal_keep_alive_minutes * 60),
    });

    let shutdown = CancellationToken::new();
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);

    if args.public_host.is_empty() {
        warn!("FOR_RABBIT_HOST is empty, replies will not name this store");
    }
    let lifecycle = Arc::new(LifecycleHandler::new(
        Arc::clone(&service),
        origin,
        args.public_host.clone(),
    ));
    let lifecycle_task = tokio::spawn(lifecycle.run(commands_rx, shutdown.clone()));

    let rest = Arc::new(RestHandler::new(Arc::clone(&service)).with_commands(commands_tx));
    let rest_config = RestConfig {
        addr: args.url,
        idle_timeout: Duration::from_secs(args.http_idle_timeout),
    };
    let mut rest_task = tokio::spawn(rest.serve(rest_config, shutdown.clone()));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for shutdown signal")?;
            info!("Shutdown requested");
        }
        served = &mut rest_task => {
            match served {
                Ok(Ok(())) => warn!("HTTP server exited"),
                Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
                Err(e) => error!(error = %e, "HTTP server task panicked"),
            }
        }
    }

    shutdown.cancel();
    if !rest_task.is_finished() {
        let _ = rest_task.await;
    }
    if let Err(e) = lifecycle_task.await {
        error!(error = %e, "Lifecycle handler panicked");
    }
    for task in disposal {
        task.stop().await;
    }

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=warn,reqwest=warn",
            args.log_level.to_lowercase()
        ))
    });

    if args.log_json || args.env.eq_ignore_ascii_case("production") {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
