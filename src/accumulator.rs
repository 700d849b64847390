//! Per-symbol batching of accepted ticker updates.
//!
//! Each symbol keeps the last accepted update (what the detector compares
//! against) and the ordered list of updates waiting to be written. When the
//! list reaches the batch size it is detached whole and submitted to the
//! persistence intake.
//!
//! There is no timer flush: a symbol that stops moving keeps its partial
//! buffer until enough changes arrive.

use crate::detector::ChangeDetector;
use crate::models::{TickerBatch, TickerUpdate};
use crate::persistence::{Intake, PersistJob};
use std::collections::HashMap;
use tracing::{debug, error, info};

/// Result of offering an update to the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Same compared fields as the last accepted update.
    Unchanged,
    /// Appended; buffer holds `pending` updates.
    Buffered { pending: usize },
    /// Appended and the full buffer of `count` updates was handed off.
    Flushed { count: usize },
}

#[derive(Debug, Default)]
struct SymbolState {
    last_accepted: Option<TickerUpdate>,
    pending: Vec<TickerUpdate>,
}

/// Explicit per-symbol state plus the intake that receives full batches.
pub struct BatchAccumulator {
    batch_size: usize,
    detector: ChangeDetector,
    intake: Intake,
    symbols: HashMap<String, SymbolState>,
    batches_flushed: u64,
}

impl BatchAccumulator {
    /// `batch_size` below 1 is treated as 1.
    pub fn new(batch_size: usize, detector: ChangeDetector, intake: Intake) -> Self {
        Self {
            batch_size: batch_size.max(1),
            detector,
            intake,
            symbols: HashMap::new(),
            batches_flushed: 0,
        }
    }

    /// Run the change detector and append the update if it is new.
    pub fn offer(&mut self, update: TickerUpdate) -> Offer {
        let previous = self
            .symbols
            .get(&update.symbol)
            .and_then(|state| state.last_accepted.as_ref());

        if !self.detector.should_accept(previous, &update) {
            return Offer::Unchanged;
        }

        self.append(update)
    }

    /// Refresh the last-accepted cache, buffer the update, and hand off the
    /// whole buffer once it reaches the batch size.
    pub fn append(&mut self, update: TickerUpdate) -> Offer {
        let symbol = update.symbol.clone();
        let state = self.symbols.entry(symbol.clone()).or_default();

        state.last_accepted = Some(update.clone());
        state.pending.push(update);

        if state.pending.len() < self.batch_size {
            return Offer::Buffered {
                pending: state.pending.len(),
            };
        }

        let updates = std::mem::take(&mut state.pending);
        let count = updates.len();
        info!("Queueing {} tickers for {}", count, symbol);

        if let Err(e) = self
            .intake
            .submit(PersistJob::Tickers(TickerBatch::new(symbol.clone(), updates)))
        {
            error!("Dropping {} tickers for {}: {}", count, symbol, e);
        } else {
            self.batches_flushed += 1;
        }

        debug!("Buffer for {} reset after hand-off", symbol);
        Offer::Flushed { count }
    }

    /// Updates buffered for `symbol` and not yet handed off.
    pub fn pending_len(&self, symbol: &str) -> usize {
        self.symbols.get(symbol).map_or(0, |state| state.pending.len())
    }

    pub fn last_accepted(&self, symbol: &str) -> Option<&TickerUpdate> {
        self.symbols
            .get(symbol)
            .and_then(|state| state.last_accepted.as_ref())
    }

    /// Total updates sitting in partial buffers.
    pub fn total_pending(&self) -> usize {
        self.symbols.values().map(|state| state.pending.len()).sum()
    }

    pub fn batches_flushed(&self) -> u64 {
        self.batches_flushed
    }
}
