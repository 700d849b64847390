//! Bybit v5 public stream frames.
//!
//! A frame is either a control reply (`op`/`success` keys, no topic) or a data
//! frame with a `topic` of the form `{channel}[.{param}].{symbol}`. Data
//! frames are classified into a closed set of [`Channel`] variants and then
//! turned into pipeline records by the helpers below.

use crate::errors::{CollectorError, Result};
use crate::models::{BookLevels, KlineRecord, OrderbookSnapshot, TickerFields, TickerUpdate, TradeRecord};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Data channel parsed from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    /// `tickers.{symbol}`
    Ticker,
    /// `orderbook.{depth}.{symbol}`
    Orderbook { depth: String },
    /// `publicTrade.{symbol}` (also accepts `trade.{symbol}`)
    Trade,
    /// `kline.{interval}.{symbol}`
    Kline { interval: String },
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Ticker => write!(f, "tickers"),
            Channel::Orderbook { depth } => write!(f, "orderbook.{}", depth),
            Channel::Trade => write!(f, "publicTrade"),
            Channel::Kline { interval } => write!(f, "kline.{}", interval),
        }
    }
}

/// Channel plus symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub channel: Channel,
    pub symbol: String,
}

impl Topic {
    pub fn parse(topic: &str) -> Result<Self> {
        let parts: Vec<&str> = topic.split('.').collect();
        let symbol = match parts.last() {
            Some(s) if parts.len() >= 2 && !s.is_empty() => s.to_string(),
            _ => return Err(CollectorError::parse(format!("topic without symbol: {}", topic))),
        };

        let channel = match (parts[0], parts.len()) {
            ("tickers", 2) => Channel::Ticker,
            ("publicTrade" | "trade", 2) => Channel::Trade,
            ("orderbook", 3) => Channel::Orderbook {
                depth: parts[1].to_string(),
            },
            ("kline", 3) => Channel::Kline {
                interval: parts[1].to_string(),
            },
            _ => return Err(CollectorError::parse(format!("unknown topic: {}", topic))),
        };

        Ok(Self { channel, symbol })
    }
}

/// Whether a data frame carries the full state or only changed fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Snapshot,
    Delta,
}

/// Reply to something we sent.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    Pong,
    Subscribed { success: bool, message: String },
    Other { op: String, success: bool, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub topic: Topic,
    pub kind: UpdateKind,
    /// Frame timestamp, epoch ms
    pub ts: Option<i64>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlFrame),
    Data(DataFrame),
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    topic: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    ts: Option<i64>,
    data: Option<Value>,
    op: Option<String>,
    success: Option<bool>,
    ret_msg: Option<String>,
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawFrame = serde_json::from_str(text)?;

        if let Some(topic) = raw.topic {
            let data = raw
                .data
                .ok_or_else(|| CollectorError::parse(format!("frame for {} has no data", topic)))?;
            let kind = match raw.kind.as_deref() {
                Some("delta") => UpdateKind::Delta,
                _ => UpdateKind::Snapshot,
            };
            return Ok(Frame::Data(DataFrame {
                topic: Topic::parse(&topic)?,
                kind,
                ts: raw.ts,
                data,
            }));
        }

        if raw.op.is_none() && raw.success.is_none() {
            return Err(CollectorError::parse("frame has neither topic nor op"));
        }

        let op = raw.op.unwrap_or_default();
        let message = raw.ret_msg.unwrap_or_default();
        let success = raw.success.unwrap_or(true);

        let control = if op == "pong" || (op == "ping" && message == "pong") {
            ControlFrame::Pong
        } else if op == "subscribe" {
            ControlFrame::Subscribed { success, message }
        } else {
            ControlFrame::Other { op, success, message }
        };
        Ok(Frame::Control(control))
    }
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CollectorError::parse(format!("timestamp out of range: {}", ms)))
}

fn parse_number(field: &str, raw: &str) -> Result<f64> {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(CollectorError::parse(format!("{} is not a number: {:?}", field, raw))),
    }
}

/// Numeric ticker field; missing, null or empty is `None`.
fn opt_f64(map: &Map<String, Value>, key: &str) -> Result<Option<f64>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => parse_number(key, s).map(Some),
        Some(Value::Number(n)) => Ok(n.as_f64().filter(|v| v.is_finite())),
        Some(other) => Err(CollectorError::parse(format!("{} has unexpected value {}", key, other))),
    }
}

fn opt_i64(map: &Map<String, Value>, key: &str) -> Result<Option<i64>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CollectorError::parse(format!("{} is not an integer: {:?}", key, s))),
        Some(Value::Number(n)) => Ok(n.as_i64()),
        Some(other) => Err(CollectorError::parse(format!("{} has unexpected value {}", key, other))),
    }
}

fn opt_string(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Build a ticker update from a (merged) ticker object.
pub fn ticker_from_map(
    topic_symbol: &str,
    map: &Map<String, Value>,
    received_at: DateTime<Utc>,
) -> Result<TickerUpdate> {
    let symbol = opt_string(map, "symbol").unwrap_or_else(|| topic_symbol.to_string());
    let last_price = opt_f64(map, "lastPrice")?
        .ok_or_else(|| CollectorError::parse(format!("ticker for {} has no lastPrice", symbol)))?;

    let fields = TickerFields {
        tick_direction: opt_string(map, "tickDirection"),
        last_price,
        price_24h_pcnt: opt_f64(map, "price24hPcnt")?,
        prev_price_24h: opt_f64(map, "prevPrice24h")?,
        high_price_24h: opt_f64(map, "highPrice24h")?,
        low_price_24h: opt_f64(map, "lowPrice24h")?,
        prev_price_1h: opt_f64(map, "prevPrice1h")?,
        mark_price: opt_f64(map, "markPrice")?,
        index_price: opt_f64(map, "indexPrice")?,
        open_interest: opt_f64(map, "openInterest")?,
        open_interest_value: opt_f64(map, "openInterestValue")?,
        turnover_24h: opt_f64(map, "turnover24h")?,
        volume_24h: opt_f64(map, "volume24h")?,
        funding_rate: opt_f64(map, "fundingRate")?,
        next_funding_time: opt_i64(map, "nextFundingTime")?,
        bid1_price: opt_f64(map, "bid1Price")?,
        bid1_size: opt_f64(map, "bid1Size")?,
        ask1_price: opt_f64(map, "ask1Price")?,
        ask1_size: opt_f64(map, "ask1Size")?,
        pre_open_price: opt_string(map, "preOpenPrice"),
        pre_qty: opt_string(map, "preQty"),
        cur_pre_listing_phase: opt_string(map, "curPreListingPhase"),
    };

    Ok(TickerUpdate::new(symbol, received_at, fields))
}

/// Latest merged ticker object per symbol.
///
/// Bybit sends one `snapshot` per subscription and then `delta` frames that
/// only carry the fields that changed.
#[derive(Debug, Default)]
pub struct TickerSnapshots {
    by_symbol: HashMap<String, Map<String, Value>>,
}

impl TickerSnapshots {
    /// Merge a frame into the symbol's view and build the update from it.
    ///
    /// The merge is only kept when the merged view yields a valid update, so
    /// a bad delta is dropped on its own and later deltas apply cleanly.
    pub fn apply(
        &mut self,
        symbol: &str,
        kind: UpdateKind,
        data: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<TickerUpdate> {
        let object = data
            .as_object()
            .ok_or_else(|| CollectorError::parse(format!("ticker data for {} is not an object", symbol)))?;

        let mut merged = match (kind, self.by_symbol.get(symbol)) {
            (UpdateKind::Delta, Some(current)) => current.clone(),
            _ => Map::new(),
        };
        for (key, value) in object {
            merged.insert(key.clone(), value.clone());
        }

        let update = ticker_from_map(symbol, &merged, received_at)?;
        self.by_symbol.insert(symbol.to_string(), merged);
        Ok(update)
    }
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "i")]
    trade_id: String,
    #[serde(rename = "T")]
    time: i64,
    #[serde(rename = "s")]
    symbol: Option<String>,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "v")]
    size: String,
    #[serde(rename = "S")]
    side: String,
}

/// Trades in a `publicTrade` frame.
pub fn trades_from(topic: &Topic, data: &Value) -> Result<Vec<TradeRecord>> {
    let raw: Vec<RawTrade> = serde_json::from_value(data.clone())?;

    raw.into_iter()
        .map(|t| {
            Ok(TradeRecord {
                symbol: t.symbol.unwrap_or_else(|| topic.symbol.clone()),
                timestamp: millis_to_utc(t.time)?,
                price: parse_number("p", &t.price)?,
                size: parse_number("v", &t.size)?,
                side: t.side,
                trade_id: t.trade_id,
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct RawKline {
    start: i64,
    interval: Option<String>,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
}

/// Candles in a `kline` frame.
pub fn klines_from(topic: &Topic, data: &Value) -> Result<Vec<KlineRecord>> {
    let topic_interval = match &topic.channel {
        Channel::Kline { interval } => interval.clone(),
        other => return Err(CollectorError::parse(format!("{} frame is not a kline", other))),
    };
    let raw: Vec<RawKline> = serde_json::from_value(data.clone())?;

    raw.into_iter()
        .map(|k| {
            Ok(KlineRecord {
                symbol: topic.symbol.clone(),
                interval: k.interval.unwrap_or_else(|| topic_interval.clone()),
                start_time: millis_to_utc(k.start)?,
                open: parse_number("open", &k.open)?,
                high: parse_number("high", &k.high)?,
                low: parse_number("low", &k.low)?,
                close: parse_number("close", &k.close)?,
                volume: parse_number("volume", &k.volume)?,
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct RawOrderbook {
    #[serde(rename = "s")]
    symbol: Option<String>,
    #[serde(rename = "a", default)]
    asks: BookLevels,
    #[serde(rename = "b", default)]
    bids: BookLevels,
    ts: Option<i64>,
}

/// One side of a local book, kept sorted best price first.
#[derive(Debug, Clone, Default)]
struct BookSide {
    /// (price, size, raw level)
    levels: Vec<(f64, f64, [String; 2])>,
    descending: bool,
}

impl BookSide {
    fn new(descending: bool) -> Self {
        Self {
            levels: Vec::new(),
            descending,
        }
    }

    /// Upsert levels by price; size zero removes the level.
    fn apply(&mut self, updates: &BookLevels) -> Result<()> {
        for level in updates {
            let price = parse_number("price", &level[0])?;
            let size = parse_number("size", &level[1])?;
            let existing = self.levels.iter().position(|(p, _, _)| *p == price);

            match (existing, size == 0.0) {
                (Some(i), true) => {
                    self.levels.remove(i);
                }
                (Some(i), false) => self.levels[i] = (price, size, level.clone()),
                (None, true) => {}
                (None, false) => self.levels.push((price, size, level.clone())),
            }
        }

        let descending = self.descending;
        self.levels.sort_by(|a, b| {
            if descending {
                b.0.total_cmp(&a.0)
            } else {
                a.0.total_cmp(&b.0)
            }
        });
        Ok(())
    }

    fn to_levels(&self) -> BookLevels {
        self.levels.iter().map(|(_, _, raw)| raw.clone()).collect()
    }
}

#[derive(Debug, Clone)]
struct LocalBook {
    asks: BookSide,
    bids: BookSide,
}

impl Default for LocalBook {
    fn default() -> Self {
        Self {
            asks: BookSide::new(false),
            bids: BookSide::new(true),
        }
    }
}

/// Local order book per symbol.
///
/// `orderbook` topics deliver a snapshot followed by deltas that list only
/// changed levels, with size `"0"` meaning the level is gone. Every frame
/// yields the full merged book.
#[derive(Debug, Default)]
pub struct OrderBooks {
    by_symbol: HashMap<String, LocalBook>,
}

impl OrderBooks {
    /// Apply a frame and return the full book. The timestamp comes from
    /// `data.ts`, falling back to the frame's `ts`.
    pub fn apply(
        &mut self,
        topic: &Topic,
        kind: UpdateKind,
        data: &Value,
        frame_ts: Option<i64>,
    ) -> Result<OrderbookSnapshot> {
        let raw: RawOrderbook = serde_json::from_value(data.clone())?;
        let ts = raw
            .ts
            .or(frame_ts)
            .ok_or_else(|| CollectorError::parse(format!("orderbook for {} has no ts", topic.symbol)))?;
        let timestamp = millis_to_utc(ts)?;
        let symbol = raw.symbol.unwrap_or_else(|| topic.symbol.clone());

        let mut book = match (kind, self.by_symbol.get(&symbol)) {
            (UpdateKind::Delta, Some(current)) => current.clone(),
            _ => LocalBook::default(),
        };
        book.asks.apply(&raw.asks)?;
        book.bids.apply(&raw.bids)?;

        let snapshot = OrderbookSnapshot {
            symbol: symbol.clone(),
            timestamp,
            asks: book.asks.to_levels(),
            bids: book.bids.to_levels(),
        };
        self.by_symbol.insert(symbol, book);
        Ok(snapshot)
    }
}
