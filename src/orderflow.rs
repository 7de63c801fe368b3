// ===============================
// src/orderflow.rs
// ===============================
//
// Order-flow imbalance per symbol.
//
//   ratio = 100 * (Bq - Aq) / (Bq + Aq)
//
// Bq / Aq = total volume of the top-N bid / ask levels. Each snapshot
// replaces the book wholesale (no diffs). A book with an empty side, or with
// zero volume on both sides, reads as 0.0 (neutral).
//

use tracing::debug;

use crate::domain::{FlowSignal, OrderBookLevel, OrderBookSnapshot, Symbol};

pub const DEFAULT_DEPTH: usize = 10;
pub const DEFAULT_THRESHOLD: f64 = 30.0;

#[derive(Debug, Clone)]
pub struct OrderFlowTracker {
    symbol: Symbol,
    depth: usize,
    threshold: f64,
    book: OrderBookSnapshot,
    last_ratio: f64,
}

impl OrderFlowTracker {
    pub fn new(symbol: impl Into<Symbol>, depth: usize, threshold: f64) -> Self {
        Self {
            symbol: symbol.into(),
            depth,
            threshold,
            book: OrderBookSnapshot::default(),
            last_ratio: 0.0,
        }
    }

    pub fn with_defaults(symbol: impl Into<Symbol>) -> Self {
        Self::new(symbol, DEFAULT_DEPTH, DEFAULT_THRESHOLD)
    }

    /// Replace the stored book and recompute the ratio. Returns the new ratio.
    pub fn ingest(&mut self, snapshot: OrderBookSnapshot) -> f64 {
        self.book = snapshot;
        self.last_ratio = imbalance_ratio(&self.book, self.depth);
        debug!(symbol = %self.symbol, ratio = self.last_ratio, "imbalance updated");
        self.last_ratio
    }

    pub fn ratio(&self) -> f64 {
        self.last_ratio
    }

    pub fn signal(&self) -> FlowSignal {
        if self.last_ratio > self.threshold {
            FlowSignal::Buy
        } else if self.last_ratio < -self.threshold {
            FlowSignal::Sell
        } else {
            FlowSignal::Neutral
        }
    }
}

fn top_volume(levels: &[OrderBookLevel], depth: usize) -> u128 {
    levels.iter().take(depth).map(|l| l.volume as u128).sum()
}

pub fn imbalance_ratio(book: &OrderBookSnapshot, depth: usize) -> f64 {
    if book.bids.is_empty() || book.asks.is_empty() {
        return 0.0;
    }
    let bq = top_volume(&book.bids, depth);
    let aq = top_volume(&book.asks, depth);
    let total = bq + aq;
    if total == 0 {
        return 0.0;
    }
    let ratio = 100.0 * (bq as f64 - aq as f64) / total as f64;
    ratio.clamp(-100.0, 100.0)
}
