use super::{MarketStore, TICKER_COLUMNS};
use crate::errors::{CollectorError, Result};
use crate::models::{KlineRecord, OrderbookSnapshot, TickerRow, TradeRecord};
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use std::time::Duration;
use tokio_postgres::{types::ToSql, NoTls};
use tracing::{debug, info};

const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS ticker_data (
        id BIGSERIAL PRIMARY KEY,
        timestamp TIMESTAMPTZ NOT NULL,
        symbol VARCHAR(20) NOT NULL,
        tick_direction VARCHAR(20),
        price_24h_pcnt DOUBLE PRECISION,
        last_price DOUBLE PRECISION NOT NULL,
        prev_price_24h DOUBLE PRECISION,
        high_price_24h DOUBLE PRECISION,
        low_price_24h DOUBLE PRECISION,
        prev_price_1h DOUBLE PRECISION,
        mark_price DOUBLE PRECISION,
        index_price DOUBLE PRECISION,
        open_interest DOUBLE PRECISION,
        open_interest_value DOUBLE PRECISION,
        turnover_24h DOUBLE PRECISION,
        volume_24h DOUBLE PRECISION,
        next_funding_time BIGINT,
        funding_rate DOUBLE PRECISION,
        bid1_price DOUBLE PRECISION,
        bid1_size DOUBLE PRECISION,
        ask1_price DOUBLE PRECISION,
        ask1_size DOUBLE PRECISION,
        pre_open_price VARCHAR(50),
        pre_qty VARCHAR(50),
        cur_pre_listing_phase VARCHAR(50),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    CREATE INDEX IF NOT EXISTS idx_ticker_symbol_timestamp ON ticker_data (symbol, timestamp);

    CREATE TABLE IF NOT EXISTS trades (
        id BIGSERIAL PRIMARY KEY,
        symbol VARCHAR(20) NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        trade_id VARCHAR(64) NOT NULL UNIQUE,
        price DOUBLE PRECISION NOT NULL,
        size DOUBLE PRECISION NOT NULL,
        side VARCHAR(8) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    CREATE INDEX IF NOT EXISTS idx_trades_symbol_timestamp ON trades (symbol, timestamp);

    CREATE TABLE IF NOT EXISTS klines (
        id BIGSERIAL PRIMARY KEY,
        symbol VARCHAR(20) NOT NULL,
        "interval" VARCHAR(8) NOT NULL,
        start_time TIMESTAMPTZ NOT NULL,
        open_price DOUBLE PRECISION NOT NULL,
        high_price DOUBLE PRECISION NOT NULL,
        low_price DOUBLE PRECISION NOT NULL,
        close_price DOUBLE PRECISION NOT NULL,
        volume DOUBLE PRECISION NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (symbol, "interval", start_time)
    );

    CREATE TABLE IF NOT EXISTS orderbooks (
        id BIGSERIAL PRIMARY KEY,
        symbol VARCHAR(20) NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        asks TEXT NOT NULL,
        bids TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    CREATE INDEX IF NOT EXISTS idx_orderbooks_symbol_timestamp ON orderbooks (symbol, timestamp);
"#;

const INSERT_TRADE_SQL: &str = r#"
    INSERT INTO trades (symbol, timestamp, trade_id, price, size, side)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (trade_id) DO NOTHING
"#;

const UPSERT_KLINE_SQL: &str = r#"
    INSERT INTO klines (symbol, "interval", start_time, open_price, high_price, low_price, close_price, volume)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (symbol, "interval", start_time) DO UPDATE SET
        open_price = EXCLUDED.open_price,
        high_price = EXCLUDED.high_price,
        low_price = EXCLUDED.low_price,
        close_price = EXCLUDED.close_price,
        volume = EXCLUDED.volume
"#;

const INSERT_ORDERBOOK_SQL: &str =
    "INSERT INTO orderbooks (symbol, timestamp, asks, bids) VALUES ($1, $2, $3, $4)";

const SIZE_SQL: &str = "SELECT pg_database_size(current_database())";

/// PostgreSQL server behind a deadpool connection pool.
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Build the pool from a `postgresql://` URL and test one connection.
    pub async fn connect(url: &str, pool_max: usize) -> Result<Self> {
        let pg_config: tokio_postgres::Config = url
            .parse()
            .map_err(|e| CollectorError::config(format!("Invalid PG config: {}", e)))?;

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);

        let pool = Pool::builder(mgr)
            .max_size(pool_max.max(2))
            .wait_timeout(Some(Duration::from_secs(10)))
            .create_timeout(Some(Duration::from_secs(10)))
            .recycle_timeout(Some(Duration::from_secs(10)))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| CollectorError::config(format!("Failed to create pool: {}", e)))?;

        // Test connection
        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;
        info!("Database connection pool established");

        Ok(Self { pool })
    }
}

/// Bind parameters PostgreSQL accepts in one statement.
const MAX_BIND_PARAMS: usize = u16::MAX as usize;

/// Largest ticker batch that fits one multi-row insert.
fn ticker_rows_per_insert() -> usize {
    MAX_BIND_PARAMS / TICKER_COLUMNS.len()
}

fn ticker_insert_sql(rows: usize) -> String {
    format!(
        "INSERT INTO ticker_data ({}) VALUES {}",
        TICKER_COLUMNS.join(", "),
        values_placeholders(rows, TICKER_COLUMNS.len())
    )
}

/// `($1, $2, ...), ($25, ...)` for `rows` rows of `width` columns.
fn values_placeholders(rows: usize, width: usize) -> String {
    (0..rows)
        .map(|r| {
            let cols: Vec<String> = (1..=width).map(|c| format!("${}", r * width + c)).collect();
            format!("({})", cols.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn push_ticker_params<'a>(params: &mut Vec<&'a (dyn ToSql + Sync)>, row: &'a TickerRow) {
    let f = &row.fields;
    params.extend_from_slice(&[
        &row.timestamp as &(dyn ToSql + Sync),
        &row.symbol,
        &f.tick_direction,
        &f.price_24h_pcnt,
        &f.last_price,
        &f.prev_price_24h,
        &f.high_price_24h,
        &f.low_price_24h,
        &f.prev_price_1h,
        &f.mark_price,
        &f.index_price,
        &f.open_interest,
        &f.open_interest_value,
        &f.turnover_24h,
        &f.volume_24h,
        &f.next_funding_time,
        &f.funding_rate,
        &f.bid1_price,
        &f.bid1_size,
        &f.ask1_price,
        &f.ask1_size,
        &f.pre_open_price,
        &f.pre_qty,
        &f.cur_pre_listing_phase,
    ]);
}

#[async_trait]
impl MarketStore for PostgresStore {
    fn backend(&self) -> &'static str {
        "postgresql"
    }

    async fn ensure_schema(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA_SQL).await?;
        Ok(())
    }

    async fn insert_tickers(&self, rows: &[TickerRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let mut inserted = 0;
        for chunk in rows.chunks(ticker_rows_per_insert()) {
            let sql = ticker_insert_sql(chunk.len());
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * TICKER_COLUMNS.len());
            for row in chunk {
                push_ticker_params(&mut params, row);
            }
            inserted += tx.execute(sql.as_str(), &params).await?;
        }
        tx.commit().await?;

        debug!("Inserted {} ticker rows into PostgreSQL", inserted);
        Ok(inserted as usize)
    }

    async fn insert_trades(&self, trades: &[TradeRecord]) -> Result<usize> {
        if trades.is_empty() {
            return Ok(0);
        }

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let statement = tx.prepare(INSERT_TRADE_SQL).await?;

        let mut inserted = 0;
        for trade in trades {
            inserted += tx
                .execute(
                    &statement,
                    &[
                        &trade.symbol,
                        &trade.timestamp,
                        &trade.trade_id,
                        &trade.price,
                        &trade.size,
                        &trade.side,
                    ],
                )
                .await?;
        }
        tx.commit().await?;

        Ok(inserted as usize)
    }

    async fn upsert_klines(&self, klines: &[KlineRecord]) -> Result<usize> {
        if klines.is_empty() {
            return Ok(0);
        }

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let statement = tx.prepare(UPSERT_KLINE_SQL).await?;

        let mut touched = 0;
        for k in klines {
            touched += tx
                .execute(
                    &statement,
                    &[
                        &k.symbol,
                        &k.interval,
                        &k.start_time,
                        &k.open,
                        &k.high,
                        &k.low,
                        &k.close,
                        &k.volume,
                    ],
                )
                .await?;
        }
        tx.commit().await?;

        Ok(touched as usize)
    }

    async fn insert_orderbook(&self, snapshot: &OrderbookSnapshot) -> Result<()> {
        let asks = snapshot.asks_json()?;
        let bids = snapshot.bids_json()?;

        let client = self.pool.get().await?;
        client
            .execute(
                INSERT_ORDERBOOK_SQL,
                &[&snapshot.symbol, &snapshot.timestamp, &asks, &bids],
            )
            .await?;
        Ok(())
    }

    async fn size_bytes(&self) -> Result<u64> {
        let client = self.pool.get().await?;
        let row = client.query_one(SIZE_SQL, &[]).await?;
        let size: i64 = row.get(0);
        u64::try_from(size)
            .map_err(|_| CollectorError::conversion(format!("negative database size {}", size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_placeholders_are_numbered_per_row() {
        assert_eq!(values_placeholders(2, 3), "($1, $2, $3), ($4, $5, $6)");
        assert_eq!(values_placeholders(1, 1), "($1)");
    }

    #[test]
    fn test_large_batches_stay_under_bind_limit() {
        let per_insert = ticker_rows_per_insert();
        assert_eq!(per_insert, 2730);
        assert!(per_insert * TICKER_COLUMNS.len() <= MAX_BIND_PARAMS);
        assert!((per_insert + 1) * TICKER_COLUMNS.len() > MAX_BIND_PARAMS);

        let sql = ticker_insert_sql(per_insert);
        assert!(sql.ends_with("$65520)"));
        assert!(!sql.contains("$65521"));

        let rows = vec![0u8; 6000];
        let chunks: Vec<usize> = rows.chunks(per_insert).map(<[u8]>::len).collect();
        assert_eq!(chunks, vec![2730, 2730, 540]);
    }

    #[test]
    fn test_ticker_params_match_columns() {
        let row = TickerRow {
            timestamp: chrono::Utc::now(),
            symbol: "BTCUSDT".to_string(),
            fields: Default::default(),
        };
        let mut params = Vec::new();
        push_ticker_params(&mut params, &row);
        assert_eq!(params.len(), TICKER_COLUMNS.len());
    }
}
