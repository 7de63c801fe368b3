// ===============================
// src/scanner.rs
// ===============================
//
// Universe shortlists, both computed from one bulk quote call:
// - surge scan      : intraday movers (scanner mode, re-run every cycle)
// - liquidity rank  : most tradeable names (multi-agent targets, run once)
//
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::domain::{Quote, Symbol};
use crate::feed::{DataError, MarketData};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurgeFilter {
    /// minimum % change from the day's open
    pub min_change_pct: Decimal,
    /// volume must be strictly above this
    pub min_volume: u64,
}

impl Default for SurgeFilter {
    fn default() -> Self {
        Self { min_change_pct: Decimal::new(15, 1), min_volume: 500_000 }
    }
}

impl SurgeFilter {
    pub fn matches(&self, q: &Quote) -> bool {
        if q.open_price <= Decimal::ZERO || q.last_price <= Decimal::ZERO || q.volume == 0 {
            return false;
        }
        let change = (q.last_price - q.open_price) / q.open_price * Decimal::ONE_HUNDRED;
        change >= self.min_change_pct && q.volume > self.min_volume
    }
}

/// Symbols surging from the open, in universe order.
pub fn surges(quotes: &[Quote], filter: &SurgeFilter) -> Vec<Symbol> {
    quotes
        .iter()
        .filter(|q| filter.matches(q))
        .inspect(|q| debug!(symbol = %q.symbol, last = %q.last_price, open = %q.open_price, volume = q.volume, "surge"))
        .map(|q| q.symbol.clone())
        .collect()
}

pub async fn scan_for_surges(feed: &dyn MarketData, universe: &[Symbol], filter: &SurgeFilter) -> Result<Vec<Symbol>, DataError> {
    let quotes = feed.quotes(universe).await?;
    let out = surges(&quotes, filter);
    info!(universe = universe.len(), quoted = quotes.len(), shortlist = out.len(), "surge scan");
    Ok(out)
}

/// Turnover per unit of spread. None when the quote cannot be scored.
pub fn liquidity_score(q: &Quote) -> Option<f64> {
    let spread = q.ask - q.bid;
    if q.volume == 0 || spread <= Decimal::ZERO {
        return None;
    }
    let turnover = Decimal::from(q.volume) * q.last_price;
    (turnover / spread).to_f64()
}

/// Top `n` by liquidity score, best first. Ties keep universe order.
pub fn rank_by_liquidity(quotes: &[Quote], n: usize) -> Vec<Symbol> {
    let mut scored: Vec<(f64, &Symbol)> = quotes
        .iter()
        .filter_map(|q| liquidity_score(q).map(|s| (s, &q.symbol)))
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.into_iter().take(n).map(|(_, s)| s.clone()).collect()
}

pub async fn top_liquid(feed: &dyn MarketData, universe: &[Symbol], n: usize) -> Result<Vec<Symbol>, DataError> {
    let quotes = feed.quotes(universe).await?;
    let out = rank_by_liquidity(&quotes, n);
    info!(universe = universe.len(), ?out, "liquidity ranking");
    Ok(out)
}
