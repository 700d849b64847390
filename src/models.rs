//! Market data records moved through the pipeline.
//!
//! `TickerUpdate` is what the stream produces and the accumulator buffers.
//! The remaining types are storage records built directly from frames, plus
//! `TickerRow`, the validated form the worker writes.

use crate::errors::{CollectorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest symbol the ticker table accepts.
pub const MAX_SYMBOL_LEN: usize = 20;

/// Market state carried by a ticker frame, without identity or timestamp.
///
/// `PartialEq` over this struct is what full-field change detection compares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickerFields {
    pub tick_direction: Option<String>,
    pub last_price: f64,
    pub price_24h_pcnt: Option<f64>,
    pub prev_price_24h: Option<f64>,
    pub high_price_24h: Option<f64>,
    pub low_price_24h: Option<f64>,
    pub prev_price_1h: Option<f64>,
    pub mark_price: Option<f64>,
    pub index_price: Option<f64>,
    pub open_interest: Option<f64>,
    pub open_interest_value: Option<f64>,
    pub turnover_24h: Option<f64>,
    pub volume_24h: Option<f64>,
    pub funding_rate: Option<f64>,
    /// Epoch milliseconds
    pub next_funding_time: Option<i64>,
    pub bid1_price: Option<f64>,
    pub bid1_size: Option<f64>,
    pub ask1_price: Option<f64>,
    pub ask1_size: Option<f64>,
    pub pre_open_price: Option<String>,
    pub pre_qty: Option<String>,
    pub cur_pre_listing_phase: Option<String>,
}

/// One ticker snapshot for a symbol at the time it was received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerUpdate {
    pub symbol: String,
    pub received_at: DateTime<Utc>,
    pub fields: TickerFields,
}

impl TickerUpdate {
    pub fn new(symbol: impl Into<String>, received_at: DateTime<Utc>, fields: TickerFields) -> Self {
        Self {
            symbol: symbol.into(),
            received_at,
            fields,
        }
    }

    pub fn last_price(&self) -> f64 {
        self.fields.last_price
    }
}

/// Full per-symbol buffer detached by the accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerBatch {
    symbol: String,
    updates: Vec<TickerUpdate>,
}

impl TickerBatch {
    pub fn new(symbol: impl Into<String>, updates: Vec<TickerUpdate>) -> Self {
        Self {
            symbol: symbol.into(),
            updates,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn updates(&self) -> &[TickerUpdate] {
        &self.updates
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Convert every update into a row; any failure rejects the whole batch.
    pub fn to_rows(&self) -> Result<Vec<TickerRow>> {
        self.updates.iter().map(TickerRow::try_from).collect()
    }
}

/// A ticker update validated for the `ticker_data` table.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerRow {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub fields: TickerFields,
}

impl TryFrom<&TickerUpdate> for TickerRow {
    type Error = CollectorError;

    fn try_from(update: &TickerUpdate) -> Result<Self> {
        if update.symbol.is_empty() || update.symbol.len() > MAX_SYMBOL_LEN {
            return Err(CollectorError::conversion(format!(
                "symbol {:?} does not fit the ticker table",
                update.symbol
            )));
        }

        let f = &update.fields;
        let prices = [
            Some(f.last_price),
            f.price_24h_pcnt,
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
            f.funding_rate,
            f.bid1_price,
            f.bid1_size,
            f.ask1_price,
            f.ask1_size,
        ];
        if prices.iter().flatten().any(|v| !v.is_finite()) {
            return Err(CollectorError::conversion(format!(
                "non-finite value in ticker for {}",
                update.symbol
            )));
        }

        Ok(Self {
            timestamp: update.received_at,
            symbol: update.symbol.clone(),
            fields: f.clone(),
        })
    }
}

/// A single public trade. `trade_id` is the exchange-assigned natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub size: f64,
    pub side: String,
}

/// One candle, keyed by (symbol, interval, start_time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlineRecord {
    pub symbol: String,
    pub interval: String,
    pub start_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Book levels as sent by the exchange: `[price, size]` string pairs.
pub type BookLevels = Vec<[String; 2]>;

/// Order book state at a timestamp. Always stored as a new row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub asks: BookLevels,
    pub bids: BookLevels,
}

impl OrderbookSnapshot {
    pub fn asks_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.asks)?)
    }

    pub fn bids_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.bids)?)
    }
}
