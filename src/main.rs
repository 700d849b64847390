//! Bybit Market Data Collector
//!
//! Streams ticker data (and optionally orderbook, trade and kline data) from
//! the Bybit public WebSocket API and stores it in SQLite or PostgreSQL.
//!
//! ## Features
//! - Ticker change detection, only new prices are stored
//! - Per-symbol batch writes through a single persistence worker
//! - Periodic database growth logging
//! - Graceful shutdown on SIGINT/SIGTERM

use bybit_collector::config::{redact, Config, StorageTarget};
use bybit_collector::errors::{CollectorError, Result};
use bybit_collector::persistence::PersistenceWorker;
use bybit_collector::size_monitor::StorageGrowthMonitor;
use bybit_collector::storage;
use bybit_collector::stream::StreamClient;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so LOG_LEVEL can seed the filter
    let config = Config::from_env()?;
    init_tracing(&config.log_level);

    info!("Starting Bybit Market Data Collector");
    info!("Configuration loaded:");
    info!("  WebSocket URL: {}", config.stream_url);
    info!("  Symbols: {}", config.symbols.join(", "));
    if !config.channels.is_empty() {
        info!("  Extra channels: {}", config.channels.join(", "));
    }
    info!("  Ticker batch size: {}", config.ticker_batch_size);
    info!("  Change detection: {}", config.change_detection);
    info!("  Size check interval: {:?}", config.size_check_interval);
    match &config.database.target {
        StorageTarget::Sqlite { path } => info!("  Database: sqlite {}", path.display()),
        StorageTarget::Postgres { url } => info!("  Database: {}", redact(url)),
    }

    // Initialize storage
    info!("Connecting to database...");
    let store = match storage::open(&config.database).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            return Err(e);
        }
    };
    store.ensure_schema().await?;
    info!("Database schema ready");

    let monitor = StorageGrowthMonitor::start(store.clone(), config.size_check_interval).await;
    let persistence = PersistenceWorker::new(store, Some(monitor)).start();

    let mut client = StreamClient::new(&config, persistence);
    if let Err(e) = client.connect(&config.symbols).await {
        // Stop the worker before bailing so the monitor logs its exit
        let _ = client.disconnect().await;
        return Err(e);
    }

    info!("Collector started, waiting for shutdown signal...");
    let connection_lost = tokio::select! {
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
            false
        }
        _ = client.closed() => true,
    };

    let stats = client.disconnect().await?;
    info!(
        "Collector stopped: {} jobs committed, {} failed, {} rows written",
        stats.jobs_committed, stats.jobs_failed, stats.rows_written
    );

    if connection_lost {
        return Err(CollectorError::channel("WebSocket connection lost"));
    }
    Ok(())
}

/// Initialize tracing subscriber. RUST_LOG wins over LOG_LEVEL.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
