//! Background persistence worker.
//!
//! One tokio task owns the receiving end of an unbounded channel and writes
//! jobs in arrival order, one transaction per job. Producers never wait:
//! `Intake::submit` is a plain unbounded send.
//!
//! Durability is at-most-once. A job whose conversion or write fails is
//! logged with its symbol and row count and then discarded; there is no
//! retry and no dead-letter queue. Updates still sitting in the
//! accumulator's partial buffers at shutdown are never written.

use crate::errors::{CollectorError, Result};
use crate::models::{KlineRecord, OrderbookSnapshot, TickerBatch, TradeRecord};
use crate::size_monitor::StorageGrowthMonitor;
use crate::storage::MarketStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Unit of work for the worker.
#[derive(Debug, Clone)]
pub enum PersistJob {
    /// Full ticker buffer for one symbol, one multi-row insert.
    Tickers(TickerBatch),
    /// Trades from one frame, existing trade ids are skipped.
    Trades(Vec<TradeRecord>),
    /// Candles from one frame, upserted on (symbol, interval, start).
    Klines(Vec<KlineRecord>),
    /// Book snapshot, always inserted.
    Orderbook(OrderbookSnapshot),
}

impl PersistJob {
    pub fn kind(&self) -> &'static str {
        match self {
            PersistJob::Tickers(_) => "tickers",
            PersistJob::Trades(_) => "trades",
            PersistJob::Klines(_) => "klines",
            PersistJob::Orderbook(_) => "orderbook",
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            PersistJob::Tickers(batch) => batch.symbol(),
            PersistJob::Trades(trades) => trades.first().map_or("", |t| t.symbol.as_str()),
            PersistJob::Klines(klines) => klines.first().map_or("", |k| k.symbol.as_str()),
            PersistJob::Orderbook(book) => &book.symbol,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PersistJob::Tickers(batch) => batch.len(),
            PersistJob::Trades(trades) => trades.len(),
            PersistJob::Klines(klines) => klines.len(),
            PersistJob::Orderbook(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Message on the intake channel. `Stop` is the shutdown sentinel.
#[derive(Debug)]
pub enum WorkerMessage {
    Job(PersistJob),
    Stop,
}

/// Sending side of the worker queue. Cheap to clone.
///
/// All clones share one sender slot. `close` empties the slot under the same
/// lock `submit` sends under, so no job can be queued behind `Stop`.
#[derive(Clone)]
pub struct Intake {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<WorkerMessage>>>>,
}

/// Receiving side of the worker queue.
pub struct IntakeReceiver {
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
}

impl Intake {
    /// Create a connected intake pair.
    pub fn channel() -> (Intake, IntakeReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Intake {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            IntakeReceiver { rx },
        )
    }

    /// Queue a job without blocking.
    pub fn submit(&self, job: PersistJob) -> Result<()> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(CollectorError::channel(format!(
                "persistence worker stopped, {} job rejected",
                job.kind()
            )));
        };
        tx.send(WorkerMessage::Job(job))
            .map_err(|_| CollectorError::channel("persistence worker is gone"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().as_ref().map_or(true, |tx| tx.is_closed())
    }

    /// Refuse further jobs and queue the sentinel behind everything sent so far.
    fn close(&self) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .take()
            .ok_or_else(|| CollectorError::channel("persistence intake already closed"))?;
        tx.send(WorkerMessage::Stop)
            .map_err(|_| CollectorError::channel("persistence worker is gone"))
    }
}

impl IntakeReceiver {
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WorkerMessage> {
        self.rx.try_recv().ok()
    }
}

/// Counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub jobs_committed: u64,
    pub jobs_failed: u64,
    pub rows_written: u64,
}

#[derive(Default)]
struct StatsInner {
    jobs_committed: AtomicU64,
    jobs_failed: AtomicU64,
    rows_written: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            jobs_committed: self.jobs_committed.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
            rows_written: self.rows_written.load(Ordering::SeqCst),
        }
    }
}

/// Single consumer of the intake queue.
pub struct PersistenceWorker {
    store: Arc<dyn MarketStore>,
    monitor: Option<StorageGrowthMonitor>,
    stats: Arc<StatsInner>,
}

impl PersistenceWorker {
    pub fn new(store: Arc<dyn MarketStore>, monitor: Option<StorageGrowthMonitor>) -> Self {
        Self {
            store,
            monitor,
            stats: Arc::new(StatsInner::default()),
        }
    }

    /// Create the intake channel and spawn the worker task on it.
    pub fn start(self) -> PersistenceHandle {
        let (intake, rx) = Intake::channel();
        self.spawn(intake, rx)
    }

    /// Spawn the worker on an existing channel pair.
    pub fn spawn(self, intake: Intake, rx: IntakeReceiver) -> PersistenceHandle {
        let stats = self.stats.clone();
        let join = tokio::spawn(self.run(rx));
        PersistenceHandle {
            intake,
            join,
            stats,
        }
    }

    async fn run(mut self, mut rx: IntakeReceiver) {
        info!("Persistence worker started ({})", self.store.backend());

        loop {
            match rx.recv().await {
                Some(WorkerMessage::Job(job)) => {
                    self.process(job).await;
                    if let Some(monitor) = self.monitor.as_mut() {
                        monitor.check_size().await;
                    }
                }
                Some(WorkerMessage::Stop) => {
                    info!("Persistence worker received stop");
                    break;
                }
                None => {
                    info!("Persistence intake closed");
                    break;
                }
            }
        }

        if let Some(monitor) = self.monitor.as_ref() {
            monitor.stop();
        }

        let stats = self.stats.snapshot();
        info!(
            "Persistence worker stopped: {} jobs committed, {} failed, {} rows written",
            stats.jobs_committed, stats.jobs_failed, stats.rows_written
        );
    }

    async fn process(&self, job: PersistJob) {
        let kind = job.kind();
        let symbol = job.symbol().to_string();
        let count = job.len();
        let start = Instant::now();

        match self.execute(job).await {
            Ok(written) => {
                self.stats.jobs_committed.fetch_add(1, Ordering::SeqCst);
                self.stats.rows_written.fetch_add(written as u64, Ordering::SeqCst);
                if kind == "tickers" {
                    info!(
                        "Saved {} tickers for {} in {:?}",
                        written,
                        symbol,
                        start.elapsed()
                    );
                } else {
                    debug!(
                        "Saved {} of {} {} for {} in {:?}",
                        written,
                        count,
                        kind,
                        symbol,
                        start.elapsed()
                    );
                }
            }
            Err(e) => {
                self.stats.jobs_failed.fetch_add(1, Ordering::SeqCst);
                error!(
                    kind,
                    symbol = %symbol,
                    count,
                    "Discarding {} batch after failed write: {}",
                    kind,
                    e
                );
            }
        }
    }

    /// Write one job in its own transaction. Returns rows actually written.
    async fn execute(&self, job: PersistJob) -> Result<usize> {
        match job {
            PersistJob::Tickers(batch) => {
                let rows = batch.to_rows()?;
                self.store.insert_tickers(&rows).await
            }
            PersistJob::Trades(trades) => self.store.insert_trades(&trades).await,
            PersistJob::Klines(klines) => self.store.upsert_klines(&klines).await,
            PersistJob::Orderbook(book) => {
                self.store.insert_orderbook(&book).await?;
                Ok(1)
            }
        }
    }
}

/// Owner's side of a running worker.
pub struct PersistenceHandle {
    intake: Intake,
    join: JoinHandle<()>,
    stats: Arc<StatsInner>,
}

impl PersistenceHandle {
    /// A sender for producers.
    pub fn intake(&self) -> Intake {
        self.intake.clone()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    /// Queue the stop sentinel and wait until every job submitted before it
    /// has been written and the worker task has exited.
    pub async fn stop(self) -> Result<WorkerStats> {
        if let Err(e) = self.intake.close() {
            warn!("Persistence worker already gone: {}", e);
        }
        self.join.await?;
        Ok(self.stats.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TickerFields, TickerUpdate};
    use crate::storage::test_support::RecordingStore;
    use chrono::{TimeZone, Utc};

    fn batch(symbol: &str, prices: &[f64]) -> TickerBatch {
        TickerBatch::new(
            symbol,
            prices
                .iter()
                .map(|&p| {
                    TickerUpdate::new(
                        symbol,
                        Utc::now(),
                        TickerFields {
                            last_price: p,
                            ..Default::default()
                        },
                    )
                })
                .collect(),
        )
    }

    fn trade(id: &str) -> TradeRecord {
        TradeRecord {
            trade_id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            price: 100.0,
            size: 0.5,
            side: "Buy".to_string(),
        }
    }

    #[tokio::test]
    async fn test_stop_drains_queued_batches() {
        let store = Arc::new(RecordingStore::default());
        let handle = PersistenceWorker::new(store.clone(), None).start();
        let intake = handle.intake();

        intake.submit(PersistJob::Tickers(batch("BTCUSDT", &[1.0, 2.0]))).unwrap();
        intake.submit(PersistJob::Tickers(batch("ETHUSDT", &[3.0, 4.0]))).unwrap();
        intake.submit(PersistJob::Tickers(batch("SOLUSDT", &[5.0, 6.0]))).unwrap();

        let stats = handle.stop().await.unwrap();

        assert_eq!(stats.jobs_committed, 3);
        assert_eq!(stats.rows_written, 6);
        assert_eq!(store.ticker_batches(), vec![2, 2, 2]);
        assert!(intake.is_closed());
    }

    #[tokio::test]
    async fn test_submit_after_stop_is_rejected() {
        let store = Arc::new(RecordingStore::default());
        let handle = PersistenceWorker::new(store, None).start();
        let intake = handle.intake();

        handle.stop().await.unwrap();

        let result = intake.submit(PersistJob::Tickers(batch("BTCUSDT", &[1.0])));
        assert!(matches!(result, Err(CollectorError::Channel(_))));
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_stop_worker() {
        let store = Arc::new(RecordingStore::default());
        store.fail_next_writes(1);
        let handle = PersistenceWorker::new(store.clone(), None).start();
        let intake = handle.intake();

        intake.submit(PersistJob::Tickers(batch("BTCUSDT", &[1.0, 2.0]))).unwrap();
        intake.submit(PersistJob::Tickers(batch("BTCUSDT", &[3.0, 4.0]))).unwrap();

        let stats = handle.stop().await.unwrap();
        assert_eq!(stats.jobs_failed, 1);
        assert_eq!(stats.jobs_committed, 1);
        assert_eq!(store.ticker_batches(), vec![2]);
    }

    #[tokio::test]
    async fn test_conversion_failure_discards_whole_batch() {
        let store = Arc::new(RecordingStore::default());
        let handle = PersistenceWorker::new(store.clone(), None).start();

        let mut bad = batch("BTCUSDT", &[1.0, 2.0]).updates().to_vec();
        bad[1].fields.mark_price = Some(f64::NAN);
        handle
            .intake()
            .submit(PersistJob::Tickers(TickerBatch::new("BTCUSDT", bad)))
            .unwrap();

        let stats = handle.stop().await.unwrap();
        assert_eq!(stats.jobs_failed, 1);
        assert_eq!(stats.rows_written, 0);
        assert!(store.ticker_batches().is_empty());
    }

    #[tokio::test]
    async fn test_trade_jobs_report_new_rows_only() {
        let store = Arc::new(RecordingStore::default());
        let handle = PersistenceWorker::new(store.clone(), None).start();
        let intake = handle.intake();

        intake.submit(PersistJob::Trades(vec![trade("a"), trade("b")])).unwrap();
        intake.submit(PersistJob::Trades(vec![trade("b"), trade("c")])).unwrap();

        let stats = handle.stop().await.unwrap();
        assert_eq!(stats.jobs_committed, 2);
        assert_eq!(stats.rows_written, 3);
    }

    #[tokio::test]
    async fn test_worker_exits_when_all_senders_dropped() {
        let store = Arc::new(RecordingStore::default());
        let (intake, rx) = Intake::channel();
        let handle = PersistenceWorker::new(store, None).spawn(intake, rx);

        let PersistenceHandle { intake, join, .. } = handle;
        drop(intake);
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_kline_and_orderbook_jobs() {
        let store = Arc::new(RecordingStore::default());
        let handle = PersistenceWorker::new(store.clone(), None).start();
        let intake = handle.intake();

        let kline = |close: f64| KlineRecord {
            symbol: "BTCUSDT".to_string(),
            interval: "1".to_string(),
            start_time: Utc.timestamp_millis_opt(1_700_000_040_000).unwrap(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close,
            volume: 10.0,
        };
        let book = OrderbookSnapshot {
            symbol: "BTCUSDT".to_string(),
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            asks: vec![["101".to_string(), "1".to_string()]],
            bids: vec![["99".to_string(), "1".to_string()]],
        };

        intake.submit(PersistJob::Klines(vec![kline(1.5)])).unwrap();
        intake.submit(PersistJob::Klines(vec![kline(1.8)])).unwrap();
        intake.submit(PersistJob::Orderbook(book.clone())).unwrap();
        intake.submit(PersistJob::Orderbook(book)).unwrap();

        while handle.stats().jobs_committed < 4 {
            tokio::task::yield_now().await;
        }
        let stats = handle.stop().await.unwrap();
        assert_eq!(stats.jobs_committed, 4);
        assert_eq!(store.kline("BTCUSDT", "1", 1_700_000_040_000).unwrap().close, 1.8);
        assert_eq!(store.orderbook_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_every_accepted_submit_is_written_across_stop() {
        let store = Arc::new(RecordingStore::default());
        let handle = PersistenceWorker::new(store, None).start();

        let producers: Vec<_> = (0..4)
            .map(|t| {
                let intake = handle.intake();
                tokio::task::spawn_blocking(move || {
                    let mut accepted = 0u64;
                    for i in 0..5_000 {
                        let job = PersistJob::Trades(vec![trade(&format!("{}-{}", t, i))]);
                        if intake.submit(job).is_err() {
                            break;
                        }
                        accepted += 1;
                    }
                    accepted
                })
            })
            .collect();

        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        let stats = handle.stop().await.unwrap();

        let mut accepted = 0;
        for producer in producers {
            accepted += producer.await.unwrap();
        }
        assert_eq!(stats.jobs_committed + stats.jobs_failed, accepted);
    }

    #[test]
    fn test_job_description() {
        let job = PersistJob::Trades(vec![trade("1"), trade("2")]);
        assert_eq!(job.kind(), "trades");
        assert_eq!(job.symbol(), "BTCUSDT");
        assert_eq!(job.len(), 2);
        assert!(PersistJob::Klines(vec![]).is_empty());
    }
}
