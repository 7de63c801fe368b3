// ===============================
// src/domain.rs
// ===============================
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type Symbol = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side { Buy, Sell }
impl Side { pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } } }

/// Output of the confluence gate. `None` = stand down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction { Long, Short, None }
impl Direction { pub fn as_str(&self) -> &'static str { match self { Direction::Long => "long", Direction::Short => "short", Direction::None => "none" } } }

// ---- Market data ----
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderBookLevel { pub price: Decimal, pub volume: u64 }

/// Bids descending by price, asks ascending. Each tick is a full replace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot { pub bids: Vec<OrderBookLevel>, pub asks: Vec<OrderBookLevel> }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote { pub symbol: Symbol, pub last_price: Decimal, pub bid: Decimal, pub ask: Decimal, pub volume: u64, pub open_price: Decimal }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle { pub ts: NaiveDateTime, pub open: Decimal, pub high: Decimal, pub low: Decimal, pub close: Decimal, pub volume: u64 }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe { Min5, Min45 }
impl Timeframe { pub fn resolution(&self) -> &'static str { match self { Timeframe::Min5 => "5", Timeframe::Min45 => "45" } } }

// ---- Signals ----
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime { Bullish, Bearish, Neutral }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntrySignal { BullishBreakout, BearishBreakout, None }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outlook { StronglyBearish, Bearish, Neutral, Bullish, StronglyBullish }
impl Outlook {
    pub fn sign(&self) -> f64 {
        match self {
            Outlook::StronglyBullish | Outlook::Bullish => 1.0,
            Outlook::StronglyBearish | Outlook::Bearish => -1.0,
            Outlook::Neutral => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SentimentReading { pub outlook: Outlook, pub confidence: f64 }
impl SentimentReading { pub fn score(&self) -> f64 { self.outlook.sign() * self.confidence } }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MlPrediction { Up, Down, Unknown }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowSignal { Buy, Sell, Neutral }

/// One evaluation cycle's inputs for one symbol. Built once, never mutated.
/// `sentiment_score == None` means the oracle was unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalVector {
    pub regime: Regime,
    pub sector_regime: Regime,
    pub entry_signal: EntrySignal,
    pub trend_strong: bool,
    pub sentiment_score: Option<f64>,
    pub ml_prediction: MlPrediction,
    pub imbalance_ratio: f64,
}

// ---- Ledger ----
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// `underlying` is the watched name; `symbol` is what was bought (itself or an option on it).
pub struct Position { pub symbol: Symbol, pub underlying: Symbol, pub quantity: u64, pub entry_price: Decimal, pub stop_loss: Decimal, pub take_profit: Decimal, pub opened_at: NaiveDateTime }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord { pub id: u64, pub ts: NaiveDateTime, pub symbol: Symbol, pub side: Side, pub quantity: u64, pub fill_price: Decimal, pub realized_pnl: Decimal }

/// Entry request handed to the ledger after sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest { pub symbol: Symbol, pub underlying: Symbol, pub side: Side, pub quantity: u64, pub price: Decimal, pub stop_loss: Decimal, pub take_profit: Decimal }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason { EndOfDay, StopLoss, TakeProfit }
impl ExitReason { pub fn as_str(&self) -> &'static str { match self { ExitReason::EndOfDay => "eod", ExitReason::StopLoss => "stop_loss", ExitReason::TakeProfit => "take_profit" } } }

// ---- Recorder events ----
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Decision { agent: String, symbol: Symbol, direction: Direction, signals: SignalVector },
    Trade { agent: String, record: TradeRecord, exit: Option<ExitReason> },
    Rejected { agent: String, symbol: Symbol, reason: String },
    Note(String),
}
