//! Frame dispatch into the pipeline.
//!
//! Ticker frames go through delta merging, change detection and the batch
//! accumulator. Orderbook frames are merged into a local book per symbol.
//! Trade, kline and book records are queued as their own persistence jobs.

use crate::accumulator::{BatchAccumulator, Offer};
use crate::detector::ChangeDetector;
use crate::errors::Result;
use crate::frames::{self, Channel, ControlFrame, DataFrame, Frame, OrderBooks, TickerSnapshots};
use crate::persistence::{Intake, PersistJob};
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

/// What a frame turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Control,
    Ticker(Offer),
    Trades { count: usize },
    Klines { count: usize },
    Orderbook,
}

struct TickerState {
    snapshots: TickerSnapshots,
    accumulator: BatchAccumulator,
}

/// Routes raw frames to the ticker pipeline or the per-kind handlers.
///
/// Ticker state sits behind one mutex so merge, detect, append and detach
/// happen as one step even if frames arrive from several tasks.
pub struct FrameRouter {
    ticker: Mutex<TickerState>,
    books: Mutex<OrderBooks>,
    intake: Intake,
}

impl FrameRouter {
    pub fn new(batch_size: usize, detector: ChangeDetector, intake: Intake) -> Self {
        Self {
            ticker: Mutex::new(TickerState {
                snapshots: TickerSnapshots::default(),
                accumulator: BatchAccumulator::new(batch_size, detector, intake.clone()),
            }),
            books: Mutex::new(OrderBooks::default()),
            intake,
        }
    }

    /// Handle a frame, logging and dropping anything that fails.
    pub fn on_frame(&self, text: &str) {
        if let Err(e) = self.handle_frame(text) {
            warn!("Dropping frame: {}", e);
            debug!("Dropped frame body: {}", text);
        }
    }

    pub fn handle_frame(&self, text: &str) -> Result<Dispatch> {
        match Frame::parse(text)? {
            Frame::Control(control) => {
                handle_control(control);
                Ok(Dispatch::Control)
            }
            Frame::Data(frame) => self.handle_data(frame),
        }
    }

    fn handle_data(&self, frame: DataFrame) -> Result<Dispatch> {
        let topic = &frame.topic;
        match &topic.channel {
            Channel::Ticker => {
                let received_at = Utc::now();
                let mut state = self.ticker.lock();
                let TickerState {
                    snapshots,
                    accumulator,
                } = &mut *state;

                let update = snapshots.apply(&topic.symbol, frame.kind, &frame.data, received_at)?;
                Ok(Dispatch::Ticker(accumulator.offer(update)))
            }
            Channel::Trade => {
                let trades = frames::trades_from(topic, &frame.data)?;
                let count = trades.len();
                if count > 0 {
                    self.intake.submit(PersistJob::Trades(trades))?;
                }
                Ok(Dispatch::Trades { count })
            }
            Channel::Kline { .. } => {
                let klines = frames::klines_from(topic, &frame.data)?;
                let count = klines.len();
                if count > 0 {
                    self.intake.submit(PersistJob::Klines(klines))?;
                }
                Ok(Dispatch::Klines { count })
            }
            Channel::Orderbook { .. } => {
                let book = self
                    .books
                    .lock()
                    .apply(topic, frame.kind, &frame.data, frame.ts)?;
                self.intake.submit(PersistJob::Orderbook(book))?;
                Ok(Dispatch::Orderbook)
            }
        }
    }

    /// Updates sitting in partial ticker buffers.
    pub fn pending_tickers(&self) -> usize {
        self.ticker.lock().accumulator.total_pending()
    }

    pub fn pending_for(&self, symbol: &str) -> usize {
        self.ticker.lock().accumulator.pending_len(symbol)
    }
}

fn handle_control(control: ControlFrame) {
    match control {
        ControlFrame::Pong => debug!("Received pong"),
        ControlFrame::Subscribed {
            success: true,
            message,
        } => info!("Subscription confirmed {}", message),
        ControlFrame::Subscribed {
            success: false,
            message,
        } => error!("Subscription failed: {}", message),
        ControlFrame::Other {
            op,
            success,
            message,
        } => {
            if success {
                debug!("Control frame op={} {}", op, message)
            } else {
                warn!("Control frame op={} failed: {}", op, message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ComparisonFields;
    use crate::persistence::{IntakeReceiver, WorkerMessage};
    use serde_json::json;

    fn router(batch_size: usize) -> (FrameRouter, IntakeReceiver) {
        let (intake, rx) = Intake::channel();
        (
            FrameRouter::new(batch_size, ChangeDetector::new(ComparisonFields::LastPrice), intake),
            rx,
        )
    }

    fn ticker_frame(kind: &str, data: serde_json::Value) -> String {
        json!({"topic": "tickers.BTCUSDT", "type": kind, "ts": 1673853746003i64, "cs": 2588407389i64, "data": data})
            .to_string()
    }

    fn jobs(rx: &mut IntakeReceiver) -> Vec<PersistJob> {
        let mut out = Vec::new();
        while let Some(WorkerMessage::Job(job)) = rx.try_recv() {
            out.push(job);
        }
        out
    }

    #[test]
    fn test_control_frames_produce_no_jobs() {
        let (router, mut rx) = router(1);

        let ack = r#"{"success":true,"ret_msg":"","conn_id":"x","op":"subscribe"}"#;
        assert_eq!(router.handle_frame(ack).unwrap(), Dispatch::Control);
        let pong = r#"{"success":true,"ret_msg":"pong","conn_id":"x","op":"ping"}"#;
        assert_eq!(router.handle_frame(pong).unwrap(), Dispatch::Control);

        assert!(jobs(&mut rx).is_empty());
    }

    #[test]
    fn test_ticker_deltas_flow_through_detector() {
        let (router, mut rx) = router(2);

        let snapshot = ticker_frame("snapshot", json!({"symbol": "BTCUSDT", "lastPrice": "100", "markPrice": "100.5"}));
        assert_eq!(
            router.handle_frame(&snapshot).unwrap(),
            Dispatch::Ticker(Offer::Buffered { pending: 1 })
        );

        // Delta without lastPrice keeps the merged price, so nothing changes.
        let delta = ticker_frame("delta", json!({"symbol": "BTCUSDT", "markPrice": "100.7"}));
        assert_eq!(router.handle_frame(&delta).unwrap(), Dispatch::Ticker(Offer::Unchanged));

        let delta = ticker_frame("delta", json!({"symbol": "BTCUSDT", "lastPrice": "101"}));
        assert_eq!(
            router.handle_frame(&delta).unwrap(),
            Dispatch::Ticker(Offer::Flushed { count: 2 })
        );

        let jobs = jobs(&mut rx);
        assert_eq!(jobs.len(), 1);
        match &jobs[0] {
            PersistJob::Tickers(batch) => {
                assert_eq!(batch.len(), 2);
                assert_eq!(batch.updates()[1].fields.mark_price, Some(100.7));
            }
            other => panic!("unexpected job {:?}", other),
        }
    }

    #[test]
    fn test_trade_frame_becomes_job() {
        let (router, mut rx) = router(100);
        let frame = json!({
            "topic": "publicTrade.BTCUSDT", "type": "snapshot", "ts": 1672304486868i64,
            "data": [{"T": 1672304486865i64, "s": "BTCUSDT", "S": "Buy", "v": "0.001", "p": "16578.50", "i": "t-1"}]
        })
        .to_string();

        assert_eq!(router.handle_frame(&frame).unwrap(), Dispatch::Trades { count: 1 });
        assert!(matches!(jobs(&mut rx).as_slice(), [PersistJob::Trades(t)] if t[0].trade_id == "t-1"));
    }

    #[test]
    fn test_kline_and_orderbook_frames() {
        let (router, mut rx) = router(100);
        let kline = json!({
            "topic": "kline.1.BTCUSDT", "type": "snapshot", "ts": 1672324988882i64,
            "data": [{"start": 1672324800000i64, "open": "1", "high": "2", "low": "0.5", "close": "1.5", "volume": "10"}]
        })
        .to_string();
        let book = json!({
            "topic": "orderbook.50.BTCUSDT", "type": "snapshot", "ts": 1672304484978i64,
            "data": {"s": "BTCUSDT", "b": [["1", "2"]], "a": [["3", "4"]], "u": 1, "seq": 2}
        })
        .to_string();

        assert_eq!(router.handle_frame(&kline).unwrap(), Dispatch::Klines { count: 1 });
        assert_eq!(router.handle_frame(&book).unwrap(), Dispatch::Orderbook);
        assert_eq!(jobs(&mut rx).len(), 2);
    }

    #[test]
    fn test_bad_frame_is_dropped_and_pipeline_continues() {
        let (router, _rx) = router(10);

        router.on_frame("{not json");
        router.on_frame(&ticker_frame("snapshot", json!({"symbol": "BTCUSDT"})));
        assert_eq!(router.pending_tickers(), 0);

        router.on_frame(&ticker_frame("snapshot", json!({"symbol": "BTCUSDT", "lastPrice": "1"})));
        assert_eq!(router.pending_for("BTCUSDT"), 1);
    }

    #[test]
    fn test_symbol_recovers_after_bad_delta() {
        let (router, _rx) = router(10);

        router.on_frame(&ticker_frame("snapshot", json!({"symbol": "BTCUSDT", "lastPrice": "100"})));
        let bad = ticker_frame("delta", json!({"symbol": "BTCUSDT", "markPrice": {"x": 1}}));
        assert!(router.handle_frame(&bad).is_err());

        let good = ticker_frame("delta", json!({"symbol": "BTCUSDT", "lastPrice": "101"}));
        assert_eq!(
            router.handle_frame(&good).unwrap(),
            Dispatch::Ticker(Offer::Buffered { pending: 2 })
        );
    }

    #[test]
    fn test_orderbook_deltas_are_stored_as_full_books() {
        let (router, mut rx) = router(100);
        let frame = |kind: &str, data: serde_json::Value| {
            json!({"topic": "orderbook.50.BTCUSDT", "type": kind, "ts": 1672304484978i64, "data": data}).to_string()
        };

        router
            .handle_frame(&frame(
                "snapshot",
                json!({"s": "BTCUSDT", "b": [["99", "1"], ["98", "2"]], "a": [["101", "1"], ["102", "2"]]}),
            ))
            .unwrap();
        router
            .handle_frame(&frame("delta", json!({"s": "BTCUSDT", "b": [["99", "0"]], "a": []})))
            .unwrap();

        let jobs = jobs(&mut rx);
        match jobs.as_slice() {
            [PersistJob::Orderbook(_), PersistJob::Orderbook(book)] => {
                assert_eq!(book.bids, vec![["98".to_string(), "2".to_string()]]);
                assert_eq!(book.asks.len(), 2);
            }
            other => panic!("unexpected jobs {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_frames_hand_off_whole_batches() {
        let (router, mut rx) = router(10);
        let router = std::sync::Arc::new(router);
        let symbols = ["BTCUSDT", "ETHUSDT"];

        // Four threads per symbol, every price distinct, so all 400 updates
        // per symbol are accepted.
        std::thread::scope(|scope| {
            for symbol in symbols {
                for t in 0..4 {
                    let router = router.clone();
                    scope.spawn(move || {
                        for i in 0..100 {
                            let price = (t * 1000 + i + 1).to_string();
                            let frame = json!({
                                "topic": format!("tickers.{}", symbol), "type": "delta", "ts": 1i64,
                                "data": {"symbol": symbol, "lastPrice": price}
                            })
                            .to_string();
                            router.handle_frame(&frame).unwrap();
                        }
                    });
                }
            }
        });

        assert_eq!(router.pending_tickers(), 0);
        let jobs = jobs(&mut rx);
        assert_eq!(jobs.len(), 80);
        for symbol in symbols {
            let batches: Vec<usize> = jobs
                .iter()
                .filter(|job| job.symbol() == symbol)
                .map(PersistJob::len)
                .collect();
            assert_eq!(batches, vec![10; 40]);
        }
    }
}
