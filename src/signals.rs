// ===============================
// src/signals.rs
// ===============================
//
// SignalAggregator: one SignalVector per symbol per cycle.
//
// Only the sources the active rule set needs are queried, so an
// order-flow-only profile never touches candles or oracles and a sentiment
// gate that is switched off never costs an LLM call.
//
// Failure policy:
// - candles / order book missing -> DataError (cycle skipped for the symbol)
// - oracle failure               -> Unknown in the vector (gate fails closed)
//
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use tracing::{debug, warn};

use crate::confluence::ConfluenceRules;
use crate::domain::{MlPrediction, Regime, SignalVector, Symbol, Timeframe};
use crate::feed::{DataError, MarketData};
use crate::oracle::{MlOracle, NewsSource, SentimentOracle};
use crate::orderflow::OrderFlowTracker;
use crate::strategy::{self, TechnicalSnapshot};

pub const ENTRY_LOOKBACK_DAYS: u32 = 5;
pub const REGIME_LOOKBACK_DAYS: u32 = 30;
pub const HEADLINE_COUNT: usize = 5;

/// Where the sentiment score comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum SentimentScope {
    /// headlines of the traded symbol itself
    PerSymbol,
    /// weighted sum over index constituents (weights in percent)
    Index(Vec<(Symbol, f64)>),
}

#[derive(Clone)]
pub struct SignalSources {
    pub feed: Arc<dyn MarketData>,
    pub sentiment: Arc<dyn SentimentOracle>,
    pub ml: Arc<dyn MlOracle>,
    pub news: Arc<dyn NewsSource>,
}

pub struct SignalAggregator {
    sources: SignalSources,
    rules: ConfluenceRules,
    sector_map: Arc<HashMap<Symbol, Symbol>>,
    scope: SentimentScope,
}

impl SignalAggregator {
    pub fn new(
        sources: SignalSources,
        rules: ConfluenceRules,
        sector_map: Arc<HashMap<Symbol, Symbol>>,
        scope: SentimentScope,
    ) -> Self {
        Self { sources, rules, sector_map, scope }
    }

    pub async fn aggregate(&self, symbol: &str, tracker: &mut OrderFlowTracker) -> Result<SignalVector, DataError> {
        let feed = &self.sources.feed;

        let (technicals, entry_bars) = if self.rules.needs_candles() {
            let entry = feed.candles(symbol, Timeframe::Min5, ENTRY_LOOKBACK_DAYS).await?;
            if entry.is_empty() {
                return Err(DataError::unavailable(symbol, "no entry-timeframe candles"));
            }
            let higher = if self.rules.regime {
                feed.candles(symbol, Timeframe::Min45, REGIME_LOOKBACK_DAYS).await?
            } else {
                Vec::new()
            };
            (Some(strategy::analyze(&entry, &higher)), entry)
        } else {
            (None, Vec::new())
        };

        let sector_regime = if self.rules.sector_regime {
            self.sector_regime(symbol).await?
        } else {
            Regime::Neutral
        };

        let imbalance_ratio = if self.rules.imbalance {
            let book = feed.order_book(symbol).await?;
            let r = tracker.ingest(book);
            crate::metrics::IMBALANCE.with_label_values(&[symbol]).set(r);
            r
        } else {
            tracker.ratio()
        };

        let context = technical_context(symbol, technicals.as_ref());
        let (sentiment_score, ml_prediction) = tokio::join!(
            self.sentiment(symbol, &context),
            self.ml(&entry_bars),
        );

        let v = SignalVector {
            regime: technicals.map(|t| t.regime).unwrap_or(Regime::Neutral),
            sector_regime,
            entry_signal: technicals.map(|t| t.entry_signal).unwrap_or(crate::domain::EntrySignal::None),
            trend_strong: technicals.map(|t| t.trend_strong).unwrap_or(false),
            sentiment_score,
            ml_prediction,
            imbalance_ratio,
        };
        debug!(%symbol, ?v, "signals");
        Ok(v)
    }

    async fn sector_regime(&self, symbol: &str) -> Result<Regime, DataError> {
        let Some(index) = self.sector_map.get(symbol) else {
            debug!(%symbol, "no sector mapping, sector regime neutral");
            return Ok(Regime::Neutral);
        };
        let bars = self.sources.feed.candles(index, Timeframe::Min45, REGIME_LOOKBACK_DAYS).await?;
        Ok(strategy::regime(&bars))
    }

    async fn sentiment(&self, symbol: &str, context: &str) -> Option<f64> {
        if !self.rules.sentiment {
            return None;
        }
        match &self.scope {
            SentimentScope::PerSymbol => {
                let headlines = self.sources.news.headlines(symbol, HEADLINE_COUNT).await;
                let text = if headlines.is_empty() { "No recent news.".to_string() } else { headlines.join("\n") };
                match self.sources.sentiment.analyze(context, &text).await {
                    Ok(r) => Some(r.score()),
                    Err(e) => {
                        warn!(%symbol, %e, "sentiment unknown");
                        None
                    }
                }
            }
            SentimentScope::Index(weights) => weighted_sentiment(&self.sources, context, weights).await,
        }
    }

    async fn ml(&self, entry_bars: &[crate::domain::Candle]) -> MlPrediction {
        if !self.rules.ml {
            return MlPrediction::Unknown;
        }
        let Some(row) = strategy::feature_row(entry_bars) else {
            warn!(bars = entry_bars.len(), "not enough bars for ML features");
            return MlPrediction::Unknown;
        };
        match self.sources.ml.predict(&row).await {
            Ok(p) => p,
            Err(e) => {
                warn!(%e, "ml prediction unknown");
                MlPrediction::Unknown
            }
        }
    }
}

/// Σ sign × confidence × weight/100. Constituents without headlines or with
/// a failed oracle call are skipped; None only when every one was skipped.
pub async fn weighted_sentiment(sources: &SignalSources, context: &str, weights: &[(Symbol, f64)]) -> Option<f64> {
    let mut total = 0.0;
    let mut any = false;
    for (name, weight) in weights {
        let headlines = sources.news.headlines(name, HEADLINE_COUNT).await;
        if headlines.is_empty() {
            debug!(constituent = %name, "no headlines, skipped");
            continue;
        }
        match sources.sentiment.analyze(context, &headlines.join("\n")).await {
            Ok(r) => {
                total += r.score() * weight / 100.0;
                any = true;
            }
            Err(e) => warn!(constituent = %name, %e, "constituent sentiment skipped"),
        }
    }
    any.then_some(total)
}

fn technical_context(symbol: &str, t: Option<&TechnicalSnapshot>) -> String {
    match t {
        Some(t) => format!(
            "{symbol}: regime={:?} entry_signal={:?} trend_strong={} adx={} last={:.2}",
            t.regime,
            t.entry_signal,
            t.trend_strong,
            t.adx.map(|a| format!("{a:.1}")).unwrap_or_else(|| "n/a".into()),
            t.latest_price
        ),
        None => format!("{symbol}: no technical context"),
    }
}
