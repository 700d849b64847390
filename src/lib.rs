//! Bybit Market Data Collector Library
//!
//! This crate provides components for streaming Bybit linear-perpetual
//! market data over the public WebSocket API and storing it in SQLite or
//! PostgreSQL.

pub mod accumulator;
pub mod config;
pub mod detector;
pub mod errors;
pub mod frames;
pub mod models;
pub mod persistence;
pub mod router;
pub mod size_monitor;
pub mod storage;
pub mod stream;

pub use accumulator::{BatchAccumulator, Offer};
pub use config::{Config, DatabaseConfig, StorageTarget};
pub use detector::{ChangeDetector, ComparisonFields};
pub use errors::{CollectorError, Result};
pub use models::{KlineRecord, OrderbookSnapshot, TickerBatch, TickerFields, TickerUpdate, TradeRecord};
pub use persistence::{Intake, PersistJob, PersistenceHandle, PersistenceWorker, WorkerStats};
pub use router::{Dispatch, FrameRouter};
pub use size_monitor::{GrowthReport, StorageGrowthMonitor};
pub use storage::{MarketStore, PostgresStore, SqliteStore};
pub use stream::StreamClient;
