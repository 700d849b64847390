use super::{MarketStore, TICKER_COLUMNS};
use crate::errors::{CollectorError, Result};
use crate::models::{KlineRecord, OrderbookSnapshot, TickerRow, TradeRecord};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS ticker_data (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        symbol TEXT NOT NULL,
        tick_direction TEXT,
        price_24h_pcnt REAL,
        last_price REAL NOT NULL,
        prev_price_24h REAL,
        high_price_24h REAL,
        low_price_24h REAL,
        prev_price_1h REAL,
        mark_price REAL,
        index_price REAL,
        open_interest REAL,
        open_interest_value REAL,
        turnover_24h REAL,
        volume_24h REAL,
        next_funding_time INTEGER,
        funding_rate REAL,
        bid1_price REAL,
        bid1_size REAL,
        ask1_price REAL,
        ask1_size REAL,
        pre_open_price TEXT,
        pre_qty TEXT,
        cur_pre_listing_phase TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_ticker_symbol_timestamp ON ticker_data(symbol, timestamp);

    CREATE TABLE IF NOT EXISTS trades (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        trade_id TEXT NOT NULL UNIQUE,
        price REAL NOT NULL,
        size REAL NOT NULL,
        side TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_trades_symbol_timestamp ON trades(symbol, timestamp);

    CREATE TABLE IF NOT EXISTS klines (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol TEXT NOT NULL,
        "interval" TEXT NOT NULL,
        start_time TEXT NOT NULL,
        open_price REAL NOT NULL,
        high_price REAL NOT NULL,
        low_price REAL NOT NULL,
        close_price REAL NOT NULL,
        volume REAL NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (symbol, "interval", start_time)
    );

    CREATE TABLE IF NOT EXISTS orderbooks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        asks TEXT NOT NULL,
        bids TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_orderbooks_symbol_timestamp ON orderbooks(symbol, timestamp);
"#;

const INSERT_TRADE_SQL: &str = r#"
    INSERT INTO trades (symbol, timestamp, trade_id, price, size, side)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT (trade_id) DO NOTHING
"#;

const UPSERT_KLINE_SQL: &str = r#"
    INSERT INTO klines (symbol, "interval", start_time, open_price, high_price, low_price, close_price, volume)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT (symbol, "interval", start_time) DO UPDATE SET
        open_price = excluded.open_price,
        high_price = excluded.high_price,
        low_price = excluded.low_price,
        close_price = excluded.close_price,
        volume = excluded.volume
"#;

const INSERT_ORDERBOOK_SQL: &str =
    "INSERT INTO orderbooks (symbol, timestamp, asks, bids) VALUES (?1, ?2, ?3, ?4)";

const SIZE_SQL: &str =
    "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()";

/// Embedded SQLite file behind an r2d2 pool.
///
/// rusqlite is blocking, so every operation runs on the blocking thread pool.
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, pool_max: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(&path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.busy_timeout(Duration::from_secs(5))
        });

        // Worker and size probe each need a connection of their own.
        let pool = Pool::builder().max_size(pool_max.max(2)).build(manager)?;

        info!("SQLite database opened at {}", path.display());
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut *conn)
        })
        .await?
    }
}

fn insert_ticker_sql() -> String {
    let placeholders: Vec<String> = (1..=TICKER_COLUMNS.len()).map(|i| format!("?{}", i)).collect();
    format!(
        "INSERT INTO ticker_data ({}) VALUES ({})",
        TICKER_COLUMNS.join(", "),
        placeholders.join(", ")
    )
}

#[async_trait]
impl MarketStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA_SQL)?;
            Ok(())
        })
        .await
    }

    async fn insert_tickers(&self, rows: &[TickerRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let rows = rows.to_vec();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&insert_ticker_sql())?;
                for row in &rows {
                    let f = &row.fields;
                    stmt.execute(params![
                        row.timestamp,
                        row.symbol,
                        f.tick_direction,
                        f.price_24h_pcnt,
                        f.last_price,
                        f.prev_price_24h,
                        f.high_price_24h,
                        f.low_price_24h,
                        f.prev_price_1h,
                        f.mark_price,
                        f.index_price,
                        f.open_interest,
                        f.open_interest_value,
                        f.turnover_24h,
                        f.volume_24h,
                        f.next_funding_time,
                        f.funding_rate,
                        f.bid1_price,
                        f.bid1_size,
                        f.ask1_price,
                        f.ask1_size,
                        f.pre_open_price,
                        f.pre_qty,
                        f.cur_pre_listing_phase,
                    ])?;
                }
            }
            tx.commit()?;
            debug!("Inserted {} ticker rows into SQLite", rows.len());
            Ok(rows.len())
        })
        .await
    }

    async fn insert_trades(&self, trades: &[TradeRecord]) -> Result<usize> {
        if trades.is_empty() {
            return Ok(0);
        }
        let trades = trades.to_vec();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare_cached(INSERT_TRADE_SQL)?;
                for trade in &trades {
                    inserted += stmt.execute(params![
                        trade.symbol,
                        trade.timestamp,
                        trade.trade_id,
                        trade.price,
                        trade.size,
                        trade.side,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn upsert_klines(&self, klines: &[KlineRecord]) -> Result<usize> {
        if klines.is_empty() {
            return Ok(0);
        }
        let klines = klines.to_vec();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut touched = 0;
            {
                let mut stmt = tx.prepare_cached(UPSERT_KLINE_SQL)?;
                for k in &klines {
                    touched += stmt.execute(params![
                        k.symbol,
                        k.interval,
                        k.start_time,
                        k.open,
                        k.high,
                        k.low,
                        k.close,
                        k.volume,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(touched)
        })
        .await
    }

    async fn insert_orderbook(&self, snapshot: &OrderbookSnapshot) -> Result<()> {
        let asks = snapshot.asks_json()?;
        let bids = snapshot.bids_json()?;
        let symbol = snapshot.symbol.clone();
        let timestamp = snapshot.timestamp;

        self.with_conn(move |conn| {
            conn.execute(INSERT_ORDERBOOK_SQL, params![symbol, timestamp, asks, bids])?;
            Ok(())
        })
        .await
    }

    async fn size_bytes(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let size: i64 = conn.query_row(SIZE_SQL, [], |row| row.get(0))?;
            u64::try_from(size)
                .map_err(|_| CollectorError::conversion(format!("negative database size {}", size)))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TickerFields, TickerUpdate};
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    async fn open_store(dir: &tempfile::TempDir) -> SqliteStore {
        let store = SqliteStore::open(dir.path().join("market.db"), 2).unwrap();
        store.ensure_schema().await.unwrap();
        store
    }

    fn count(path: &Path, table: &str) -> i64 {
        let conn = Connection::open(path).unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }

    fn trade(id: &str, price: f64) -> TradeRecord {
        TradeRecord {
            trade_id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            price,
            size: 0.01,
            side: "Sell".to_string(),
        }
    }

    fn kline(close: f64, volume: f64) -> KlineRecord {
        KlineRecord {
            symbol: "BTCUSDT".to_string(),
            interval: "1".to_string(),
            start_time: Utc.timestamp_millis_opt(1_700_000_040_000).unwrap(),
            open: 100.0,
            high: 110.0,
            low: 95.0,
            close,
            volume,
        }
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        store.ensure_schema().await.unwrap();
        assert_eq!(count(store.path(), "ticker_data"), 0);
    }

    #[tokio::test]
    async fn test_ticker_rows_inserted_in_one_batch() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let rows: Vec<TickerRow> = [100.0, 101.0, 102.0]
            .iter()
            .map(|&p| {
                let update = TickerUpdate::new(
                    "BTCUSDT",
                    Utc::now(),
                    TickerFields {
                        last_price: p,
                        bid1_price: Some(p - 0.5),
                        next_funding_time: Some(1_700_003_600_000),
                        tick_direction: Some("PlusTick".to_string()),
                        ..Default::default()
                    },
                );
                TickerRow::try_from(&update).unwrap()
            })
            .collect();

        assert_eq!(store.insert_tickers(&rows).await.unwrap(), 3);
        assert_eq!(count(store.path(), "ticker_data"), 3);

        let conn = Connection::open(store.path()).unwrap();
        let max_price: f64 = conn
            .query_row("SELECT MAX(last_price) FROM ticker_data", [], |row| row.get(0))
            .unwrap();
        assert_eq!(max_price, 102.0);
        let created: Option<String> = conn
            .query_row("SELECT created_at FROM ticker_data LIMIT 1", [], |row| row.get(0))
            .unwrap();
        assert!(created.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_trade_id_stored_once() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        assert_eq!(store.insert_trades(&[trade("t-1", 100.0)]).await.unwrap(), 1);
        assert_eq!(
            store
                .insert_trades(&[trade("t-1", 100.0), trade("t-2", 101.0)])
                .await
                .unwrap(),
            1
        );
        assert_eq!(count(store.path(), "trades"), 2);
    }

    #[tokio::test]
    async fn test_kline_upsert_keeps_latest_values() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        store.upsert_klines(&[kline(101.0, 5.0)]).await.unwrap();
        store.upsert_klines(&[kline(104.0, 9.0)]).await.unwrap();

        assert_eq!(count(store.path(), "klines"), 1);
        let conn = Connection::open(store.path()).unwrap();
        let (close, volume): (f64, f64) = conn
            .query_row("SELECT close_price, volume FROM klines", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(close, 104.0);
        assert_eq!(volume, 9.0);
    }

    #[tokio::test]
    async fn test_orderbooks_always_appended() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let snapshot = OrderbookSnapshot {
            symbol: "BTCUSDT".to_string(),
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            asks: vec![["100.5".to_string(), "1.2".to_string()]],
            bids: vec![["100.0".to_string(), "3".to_string()]],
        };
        store.insert_orderbook(&snapshot).await.unwrap();
        store.insert_orderbook(&snapshot).await.unwrap();

        assert_eq!(count(store.path(), "orderbooks"), 2);
    }

    #[tokio::test]
    async fn test_size_probe_reports_pages() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let size = store.size_bytes().await.unwrap();
        assert!(size > 0);
        assert_eq!(size % 512, 0);
    }
}
