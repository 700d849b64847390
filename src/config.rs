//! Configuration module for the collector.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::detector::ComparisonFields;
use crate::errors::{CollectorError, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const MAINNET_STREAM_URL: &str = "wss://stream.bybit.com/v5/public/linear";
const TESTNET_STREAM_URL: &str = "wss://stream-testnet.bybit.com/v5/public/linear";

/// Main configuration struct for the collector.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bybit public WebSocket URL
    pub stream_url: String,

    /// Symbols to subscribe to (ticker stream for each)
    pub symbols: Vec<String>,

    /// Extra channel prefixes, e.g. `orderbook.50`, `publicTrade`, `kline.1`
    pub channels: Vec<String>,

    /// Number of changed tickers buffered per symbol before a write
    pub ticker_batch_size: usize,

    /// Minimum time between two database size samples
    pub size_check_interval: Duration,

    /// Which ticker fields decide whether an update is new
    pub change_detection: ComparisonFields,

    /// Heartbeat interval for the `{"op":"ping"}` keepalive
    pub ping_interval: Duration,

    /// Database connection settings
    pub database: DatabaseConfig,

    /// Log level used when RUST_LOG is unset
    pub log_level: String,
}

/// Database connection configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub target: StorageTarget,
    pub pool_max: usize,
}

/// Backing store selected by the connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    /// Embedded file database
    Sqlite { path: PathBuf },
    /// Server database, the URL is handed to tokio-postgres as-is
    Postgres { url: String },
}

impl StorageTarget {
    /// Parse a `sqlite://path` or `postgres(ql)://...` connection string.
    pub fn parse(url: &str) -> Result<Self> {
        if let Some(path) = url
            .strip_prefix("sqlite:///")
            .or_else(|| url.strip_prefix("sqlite://"))
        {
            if path.is_empty() {
                return Err(CollectorError::config("SQLite URL has no file path"));
            }
            return Ok(Self::Sqlite {
                path: PathBuf::from(path),
            });
        }

        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Ok(Self::Postgres {
                url: url.to_string(),
            });
        }

        Err(CollectorError::config(format!(
            "Unsupported database URL: {}",
            redact(url)
        )))
    }

    /// Short engine name for logs.
    pub fn engine(&self) -> &'static str {
        match self {
            StorageTarget::Sqlite { .. } => "sqlite",
            StorageTarget::Postgres { .. } => "postgresql",
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let testnet = env_bool("USE_TESTNET", false);
        let stream_url = env::var("BYBIT_STREAM_URL").unwrap_or_else(|_| {
            if testnet {
                TESTNET_STREAM_URL.to_string()
            } else {
                MAINNET_STREAM_URL.to_string()
            }
        });
        url::Url::parse(&stream_url)?;

        let symbols = parse_list(
            &env::var("SYMBOLS").unwrap_or_else(|_| "BTCUSDT,ETHUSDT,LTCUSDT,SOLUSDT".to_string()),
        )
        .into_iter()
        .map(|s| s.to_uppercase())
        .collect::<Vec<_>>();
        if symbols.is_empty() {
            return Err(CollectorError::config("SYMBOLS must list at least one symbol"));
        }

        let ticker_batch_size: usize = env::var("TICKER_BATCH_SIZE")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .map_err(|_| CollectorError::config("Invalid TICKER_BATCH_SIZE"))?;
        if ticker_batch_size == 0 {
            return Err(CollectorError::config("TICKER_BATCH_SIZE must be at least 1"));
        }

        let change_detection = env::var("CHANGE_DETECTION")
            .unwrap_or_else(|_| "last_price".to_string())
            .parse()?;

        let database_url = match env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => database_url_from_parts()?,
        };

        Ok(Self {
            stream_url,
            symbols,
            channels: parse_list(&env::var("CHANNELS").unwrap_or_default()),
            ticker_batch_size,
            size_check_interval: Duration::from_secs(
                env::var("DB_SIZE_CHECK_INTERVAL")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .map_err(|_| CollectorError::config("Invalid DB_SIZE_CHECK_INTERVAL"))?,
            ),
            change_detection,
            ping_interval: Duration::from_secs(
                env::var("PING_INTERVAL")
                    .unwrap_or_else(|_| "20".to_string())
                    .parse()
                    .unwrap_or(20)
                    .max(1),
            ),
            database: DatabaseConfig {
                target: StorageTarget::parse(&database_url)?,
                pool_max: env::var("DB_POOL_MAX")
                    .unwrap_or_else(|_| "4".to_string())
                    .parse()
                    .unwrap_or(4),
            },
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Build a connection string from DB_TYPE and friends.
fn database_url_from_parts() -> Result<String> {
    let db_type = env::var("DB_TYPE").unwrap_or_else(|_| "sqlite".to_string()).to_lowercase();
    let name = env::var("DB_NAME").unwrap_or_else(|_| "bybit_data".to_string());

    match db_type.as_str() {
        "sqlite" => Ok(format!("sqlite://{}.db", name)),
        "postgresql" | "postgres" => {
            let host = env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string());
            let user = env::var("DB_USER").unwrap_or_default();
            let password = env::var("DB_PASSWORD").unwrap_or_default();
            let port = env::var("DB_PORT")
                .ok()
                .filter(|p| !p.is_empty())
                .map(|p| format!(":{}", p))
                .unwrap_or_default();
            Ok(format!(
                "postgresql://{}:{}@{}{}/{}",
                user, password, host, port, name
            ))
        }
        other => Err(CollectorError::config(format!(
            "Unsupported database type: {}",
            other
        ))),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "t" | "yes"))
        .unwrap_or(default)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Hide the password part of a connection string before logging it.
pub fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}
