// ===============================
// src/agent.rs
// ===============================
//
// One worker = one ledger. Each cycle runs in a fixed order:
//   1) exits   : quote every open position, apply EOD > SL > TP
//   2) entries : before the cutoff, for each flat candidate
//                signals -> confluence -> instrument -> size -> buy
//   3) summary : gauges + log line
//
// The ledger is only touched synchronously between awaits, so dropping a
// cycle on shutdown never leaves a half-applied trade.
//
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use chrono::{NaiveDateTime, Utc};
use chrono_tz::Tz;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, info_span, warn, Instrument as _};

use crate::config::Settings;
use crate::confluence::ConfluenceEngine;
use crate::domain::{Direction, Event, ExecutionRequest, ExitReason, Side, Symbol, TradeRecord};
use crate::feed::{DataError, MarketData};
use crate::instrument::InstrumentResolver;
use crate::metrics;
use crate::orderflow::OrderFlowTracker;
use crate::positions::{AccountSummary, PositionLedger};
use crate::recorder;
use crate::risk;
use crate::scanner::{self, SurgeFilter};
use crate::signals::{SentimentScope, SignalAggregator, SignalSources};

/// Exchange-local wall clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.tz).naive_local()
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Data(#[from] DataError),
}

impl AgentError {
    pub fn label(&self) -> &'static str {
        match self {
            AgentError::Data(e) => e.label(),
        }
    }
}

/// What the agent looks at each cycle.
#[derive(Debug, Clone)]
pub enum Watchlist {
    Symbols(Vec<Symbol>),
    /// shortlist re-scanned every cycle
    Scanner { universe: Vec<Symbol>, filter: SurgeFilter },
}

/// Injected collaborators. Nothing here is process-global.
#[derive(Clone)]
pub struct AgentDeps {
    pub sources: SignalSources,
    pub resolver: Arc<dyn InstrumentResolver>,
    pub clock: Arc<dyn Clock>,
    pub recorder: Option<mpsc::Sender<Event>>,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub exits: Vec<(TradeRecord, ExitReason)>,
    pub entries: Vec<TradeRecord>,
    /// candidates skipped this cycle, with the reason
    pub skipped: Vec<(Symbol, String)>,
    pub summary: AccountSummary,
}

pub struct Agent {
    id: String,
    watchlist: Watchlist,
    cfg: Arc<Settings>,
    feed: Arc<dyn MarketData>,
    aggregator: SignalAggregator,
    engine: ConfluenceEngine,
    resolver: Arc<dyn InstrumentResolver>,
    clock: Arc<dyn Clock>,
    recorder: Option<mpsc::Sender<Event>>,
    ledger: PositionLedger,
    trackers: HashMap<Symbol, OrderFlowTracker>,
}

impl Agent {
    pub fn new(id: impl Into<String>, watchlist: Watchlist, ledger: PositionLedger, deps: AgentDeps, cfg: Arc<Settings>) -> Self {
        let rules = cfg.rules();
        let scope = if cfg.index_weights.is_empty() {
            SentimentScope::PerSymbol
        } else {
            SentimentScope::Index(cfg.index_weights.clone())
        };
        let aggregator = SignalAggregator::new(deps.sources.clone(), rules.clone(), Arc::new(cfg.sector_map.clone()), scope);
        Self {
            id: id.into(),
            watchlist,
            feed: deps.sources.feed.clone(),
            aggregator,
            engine: ConfluenceEngine::new(rules),
            resolver: deps.resolver,
            clock: deps.clock,
            recorder: deps.recorder,
            ledger,
            trackers: HashMap::new(),
            cfg,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn into_ledger(self) -> PositionLedger {
        self.ledger
    }

    pub async fn run_cycle(&mut self) -> Result<CycleReport, AgentError> {
        let now = self.clock.now();

        // (1) manage open positions first
        let exits = self.manage_exits(now).await;

        // (2) scan for new entries
        let mut entries = Vec::new();
        let mut skipped = Vec::new();
        if self.cfg.session.before_cutoff(now.time()) {
            for symbol in self.candidates().await? {
                if self.ledger.at_capacity() {
                    debug!(open = self.ledger.open_count(), "at max open positions, no more entries this cycle");
                    break;
                }
                // an option bought on this name counts as holding it
                if self.ledger.holds_underlying(&symbol) {
                    continue;
                }
                match self.try_enter(&symbol, now).await {
                    Ok(Some(rec)) => entries.push(rec),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(%symbol, %e, "data unavailable, skipping symbol this cycle");
                        metrics::CYCLE_ERRORS.with_label_values(&[&self.id, e.label()]).inc();
                        skipped.push((symbol, e.to_string()));
                    }
                }
            }
        } else {
            debug!(time = %now.time(), "past cutoff, no new entries");
        }

        // (3) summary
        let summary = self.ledger.summary();
        self.publish(&summary);
        info!(%summary, "cycle done");
        Ok(CycleReport { exits, entries, skipped, summary })
    }

    async fn manage_exits(&mut self, now: NaiveDateTime) -> Vec<(TradeRecord, ExitReason)> {
        let open = self.ledger.open_symbols();
        if open.is_empty() {
            return Vec::new();
        }
        let mut marks = HashMap::new();
        for symbol in &open {
            match self.feed.quote(symbol).await {
                Ok(q) => {
                    marks.insert(symbol.clone(), q.last_price);
                }
                Err(e) => warn!(%symbol, %e, "no live price for open position"),
            }
        }
        let exits = self.ledger.enforce_exits(now, self.cfg.session.eod_cutoff, &marks);
        for (rec, reason) in &exits {
            info!(
                symbol = %rec.symbol,
                qty = rec.quantity,
                fill = %rec.fill_price,
                pnl = %rec.realized_pnl,
                reason = reason.as_str(),
                "position closed"
            );
            metrics::TRADES.with_label_values(&[Side::Sell.as_str(), reason.as_str()]).inc();
            recorder::emit(&self.recorder, Event::Trade { agent: self.id.clone(), record: rec.clone(), exit: Some(*reason) });
        }
        exits
    }

    async fn candidates(&self) -> Result<Vec<Symbol>, DataError> {
        match &self.watchlist {
            Watchlist::Symbols(s) => Ok(s.clone()),
            Watchlist::Scanner { universe, filter } => scanner::scan_for_surges(self.feed.as_ref(), universe, filter).await,
        }
    }

    async fn try_enter(&mut self, symbol: &str, now: NaiveDateTime) -> Result<Option<TradeRecord>, DataError> {
        let tracker = self
            .trackers
            .entry(symbol.to_string())
            .or_insert_with(|| OrderFlowTracker::new(symbol, self.cfg.book_depth, self.cfg.imbalance_threshold));
        let signals = self.aggregator.aggregate(symbol, tracker).await?;
        let direction = self.engine.evaluate(&signals);

        metrics::DECISIONS.with_label_values(&[self.cfg.profile.name(), direction.as_str()]).inc();
        recorder::emit(
            &self.recorder,
            Event::Decision { agent: self.id.clone(), symbol: symbol.to_string(), direction, signals },
        );
        if direction == Direction::None {
            info!(%symbol, ?signals, "no confluence, standing down");
            return Ok(None);
        }
        info!(%symbol, direction = direction.as_str(), ?signals, "confluence confirmed");

        let underlying = self.feed.quote(symbol).await?;
        let Some(inst) = self.resolver.resolve(&underlying, direction, now, self.feed.as_ref()).await? else {
            self.reject(symbol, "no_instrument", "no tradeable instrument for direction");
            return Ok(None);
        };

        let hundred = Decimal::ONE_HUNDRED;
        let stop = inst.price * (Decimal::ONE - self.cfg.stop_loss_pct / hundred);
        let target = inst.price * (Decimal::ONE + self.cfg.take_profit_pct / hundred);

        let sized = risk::size(self.ledger.balance(), self.cfg.risk_percentage, inst.price, stop)
            .and_then(|t| risk::cap_to_balance(t, self.ledger.balance(), self.cfg.buy_slippage));
        let sized = match sized {
            Ok(t) => t,
            Err(e) => {
                self.reject(&inst.symbol, e.label(), &e.to_string());
                return Ok(None);
            }
        };

        let req = ExecutionRequest {
            symbol: inst.symbol.clone(),
            underlying: symbol.to_string(),
            side: Side::Buy,
            quantity: sized.quantity,
            price: inst.price,
            stop_loss: stop,
            take_profit: target,
        };
        match self.ledger.buy(&req, now) {
            Ok(rec) => {
                info!(
                    symbol = %rec.symbol,
                    qty = rec.quantity,
                    fill = %rec.fill_price,
                    stop = %req.stop_loss,
                    target = %req.take_profit,
                    risk = %sized.capped_risk,
                    "position opened"
                );
                metrics::TRADES.with_label_values(&[Side::Buy.as_str(), "entry"]).inc();
                recorder::emit(&self.recorder, Event::Trade { agent: self.id.clone(), record: rec.clone(), exit: None });
                Ok(Some(rec))
            }
            Err(e) => {
                self.reject(&inst.symbol, e.label(), &e.to_string());
                Ok(None)
            }
        }
    }

    fn reject(&self, symbol: &str, label: &'static str, reason: &str) {
        warn!(%symbol, reason = %reason, "trade rejected");
        metrics::REJECTIONS.with_label_values(&[label]).inc();
        recorder::emit(
            &self.recorder,
            Event::Rejected { agent: self.id.clone(), symbol: symbol.to_string(), reason: format!("{label}: {reason}") },
        );
    }

    fn publish(&self, s: &AccountSummary) {
        metrics::BALANCE.with_label_values(&[&self.id]).set(s.balance.to_f64().unwrap_or(0.0));
        metrics::PNL_REALIZED.with_label_values(&[&self.id]).set(s.total_realized_pnl.to_f64().unwrap_or(0.0));
        metrics::OPEN_POSITIONS.with_label_values(&[&self.id]).set(s.positions.len() as i64);
    }

    /// Worker loop. Returns the ledger once `shutdown` flips to true (or its
    /// sender is dropped). A failed cycle is logged and followed by a backoff;
    /// it never ends the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> PositionLedger {
        let span = info_span!("agent", id = %self.id);
        async move {
            info!(watchlist = ?self.watchlist, balance = %self.ledger.balance(), "agent started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let now = self.clock.now();
                let delay = if !self.cfg.session.is_open(now.time()) {
                    if self.ledger.open_count() > 0 {
                        // nothing may be carried past the cutoff, even when the last
                        // in-session cycle missed it
                        let flattened = tokio::select! {
                            e = self.manage_exits(now) => Some(e),
                            _ = shutdown.changed() => None,
                        };
                        let Some(exits) = flattened else { break };
                        if !exits.is_empty() {
                            let summary = self.ledger.summary();
                            self.publish(&summary);
                            info!(closed = exits.len(), %summary, "flattened positions outside the session");
                        }
                    }
                    debug!(time = %now.time(), "market closed, idling");
                    self.cfg.idle_interval
                } else {
                    let started = Instant::now();
                    let outcome = tokio::select! {
                        r = self.run_cycle() => Some(r),
                        _ = shutdown.changed() => None,
                    };
                    metrics::CYCLE_MS
                        .with_label_values(&[&self.id])
                        .observe(started.elapsed().as_secs_f64() * 1000.0);
                    match outcome {
                        None => break,
                        Some(Ok(_)) => {
                            metrics::CYCLES.with_label_values(&[&self.id]).inc();
                            self.cfg.cycle_interval
                        }
                        Some(Err(e)) => {
                            error!(%e, backoff = ?self.cfg.error_backoff, "cycle failed");
                            metrics::CYCLE_ERRORS.with_label_values(&[&self.id, e.label()]).inc();
                            self.cfg.error_backoff
                        }
                    }
                };
                if sleep_or_shutdown(delay, &mut shutdown).await {
                    break;
                }
            }
            info!(summary = %self.ledger.summary(), "agent stopped");
            self.into_ledger()
        }
        .instrument(span)
        .await
    }
}

/// True when shutdown was requested during the wait.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}
