//! Relational storage for market data.
//!
//! Two engines sit behind [`MarketStore`]: an embedded SQLite file and a
//! PostgreSQL server. Every call checks out its own pooled connection, so the
//! size probe never shares a transaction with a write.
//!
//! Tables:
//! - `ticker_data`: append-only ticker snapshots
//! - `trades`: unique on `trade_id`, duplicates skipped
//! - `klines`: unique on (`symbol`, `interval`, `start_time`), upserted
//! - `orderbooks`: append-only book snapshots

mod postgres;
mod sqlite;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use crate::config::{DatabaseConfig, StorageTarget};
use crate::errors::Result;
use crate::models::{KlineRecord, OrderbookSnapshot, TickerRow, TradeRecord};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Storage operations used by the persistence worker and the size monitor.
#[async_trait]
pub trait MarketStore: Send + Sync {
    /// Engine name for logs.
    fn backend(&self) -> &'static str;

    /// Create tables and indexes if missing.
    async fn ensure_schema(&self) -> Result<()>;

    /// Insert all rows in one transaction. Returns rows inserted.
    async fn insert_tickers(&self, rows: &[TickerRow]) -> Result<usize>;

    /// Insert trades whose id is not stored yet. Returns rows inserted.
    async fn insert_trades(&self, trades: &[TradeRecord]) -> Result<usize>;

    /// Insert or update candles by natural key. Returns rows touched.
    async fn upsert_klines(&self, klines: &[KlineRecord]) -> Result<usize>;

    /// Insert one book snapshot.
    async fn insert_orderbook(&self, snapshot: &OrderbookSnapshot) -> Result<()>;

    /// Total database size in bytes.
    async fn size_bytes(&self) -> Result<u64>;
}

/// Open the store selected by the configuration.
pub async fn open(config: &DatabaseConfig) -> Result<Arc<dyn MarketStore>> {
    let store: Arc<dyn MarketStore> = match &config.target {
        StorageTarget::Sqlite { path } => Arc::new(SqliteStore::open(path, config.pool_max as u32)?),
        StorageTarget::Postgres { url } => Arc::new(PostgresStore::connect(url, config.pool_max).await?),
    };
    info!("Storage backend ready: {}", store.backend());
    Ok(store)
}

/// Column list shared by both engines' ticker inserts, in bind order.
pub(crate) const TICKER_COLUMNS: [&str; 24] = [
    "timestamp",
    "symbol",
    "tick_direction",
    "price_24h_pcnt",
    "last_price",
    "prev_price_24h",
    "high_price_24h",
    "low_price_24h",
    "prev_price_1h",
    "mark_price",
    "index_price",
    "open_interest",
    "open_interest_value",
    "turnover_24h",
    "volume_24h",
    "next_funding_time",
    "funding_rate",
    "bid1_price",
    "bid1_size",
    "ask1_price",
    "ask1_size",
    "pre_open_price",
    "pre_qty",
    "cur_pre_listing_phase",
];
