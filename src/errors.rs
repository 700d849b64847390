//! Error types for the collector.
//!
//! Every failure in the pipeline maps onto one of these variants. Only
//! connection and startup errors ever reach the caller; everything on the
//! ingestion path is logged and dropped.

use thiserror::Error;

/// Main error type for the collector.
#[derive(Error, Debug)]
pub enum CollectorError {
    /// WebSocket connection errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// PostgreSQL query errors
    #[error("Postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// PostgreSQL pool errors
    #[error("Database pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// SQLite errors
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// SQLite pool errors
    #[error("SQLite pool error: {0}")]
    SqlitePool(#[from] r2d2::Error),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame had the wrong shape or was missing a key
    #[error("Parse error: {0}")]
    Parse(String),

    /// A record could not be converted into a storage row
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel communication errors
    #[error("Channel error: {0}")]
    Channel(String),

    /// Background task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

impl CollectorError {
    /// Create a configuration error with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a channel error with a message.
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    /// Create a frame parse error with a message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a record conversion error with a message.
    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }
}

/// Result type alias using CollectorError.
pub type Result<T> = std::result::Result<T, CollectorError>;
