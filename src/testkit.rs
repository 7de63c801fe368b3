// ===============================
// src/testkit.rs (test-only fakes)
// ===============================
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;

use crate::agent::Clock;
use crate::domain::{
    Candle, MlPrediction, OrderBookLevel, OrderBookSnapshot, Outlook, Quote, SentimentReading, Symbol, Timeframe,
};
use crate::feed::{DataError, MarketData};
use crate::oracle::{MlOracle, NewsSource, OracleError, SentimentOracle};
use crate::strategy::FeatureRow;

/// Thursday 2025-03-06 at hh:mm, exchange-local.
pub fn at(h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 3, 6).unwrap().and_hms_opt(h, m, 0).unwrap()
}

fn d(x: f64) -> Decimal {
    Decimal::try_from(x).unwrap().round_dp(4)
}

/// `n` bars moving `step` per bar; each bar spans +-0.5 around its close.
pub fn trend(n: usize, start: f64, step: f64, minutes: i64) -> Vec<Candle> {
    let t0 = at(9, 15) - Duration::minutes(minutes * n as i64);
    (0..n)
        .map(|i| {
            let c = start + step * i as f64;
            Candle {
                ts: t0 + Duration::minutes(minutes * i as i64),
                open: d(c - step / 2.0),
                high: d(c + 0.5),
                low: d(c - 0.5),
                close: d(c),
                volume: 1000,
            }
        })
        .collect()
}

pub fn book(bids: &[u64], asks: &[u64]) -> OrderBookSnapshot {
    OrderBookSnapshot {
        bids: bids
            .iter()
            .enumerate()
            .map(|(i, v)| OrderBookLevel { price: Decimal::from(100 - i as i64), volume: *v })
            .collect(),
        asks: asks
            .iter()
            .enumerate()
            .map(|(i, v)| OrderBookLevel { price: Decimal::from(101 + i as i64), volume: *v })
            .collect(),
    }
}

pub fn quote(symbol: &str, last: Decimal) -> Quote {
    Quote {
        symbol: symbol.to_string(),
        last_price: last,
        bid: last - Decimal::new(5, 2),
        ask: last + Decimal::new(5, 2),
        volume: 1_000_000,
        open_price: last,
    }
}

#[derive(Default)]
pub struct ScriptedFeed {
    quotes: Mutex<HashMap<Symbol, Quote>>,
    candles: Mutex<HashMap<(Symbol, Timeframe), Vec<Candle>>>,
    books: Mutex<HashMap<Symbol, OrderBookSnapshot>>,
    candle_calls: AtomicUsize,
}

impl ScriptedFeed {
    pub fn set_price(&self, symbol: &str, last: Decimal) {
        self.set_quote(quote(symbol, last));
    }
    pub fn set_quote(&self, q: Quote) {
        self.quotes.lock().unwrap().insert(q.symbol.clone(), q);
    }
    pub fn remove_quote(&self, symbol: &str) {
        self.quotes.lock().unwrap().remove(symbol);
    }
    pub fn set_candles(&self, symbol: &str, tf: Timeframe, bars: Vec<Candle>) {
        self.candles.lock().unwrap().insert((symbol.to_string(), tf), bars);
    }
    pub fn set_book(&self, symbol: &str, b: OrderBookSnapshot) {
        self.books.lock().unwrap().insert(symbol.to_string(), b);
    }
    pub fn candle_calls(&self) -> usize {
        self.candle_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketData for ScriptedFeed {
    async fn quote(&self, symbol: &str) -> Result<Quote, DataError> {
        self.quotes
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .ok_or_else(|| DataError::unavailable(symbol, "no quote scripted"))
    }

    async fn quotes(&self, symbols: &[Symbol]) -> Result<Vec<Quote>, DataError> {
        let q = self.quotes.lock().unwrap();
        Ok(symbols.iter().filter_map(|s| q.get(s).cloned()).collect())
    }

    async fn candles(&self, symbol: &str, tf: Timeframe, _: u32) -> Result<Vec<Candle>, DataError> {
        self.candle_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.candles.lock().unwrap().get(&(symbol.to_string(), tf)).cloned().unwrap_or_default())
    }

    async fn order_book(&self, symbol: &str) -> Result<OrderBookSnapshot, DataError> {
        self.books
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .ok_or_else(|| DataError::unavailable(symbol, "no book scripted"))
    }
}

pub struct FixedSentiment(Option<SentimentReading>);

impl FixedSentiment {
    pub fn ok(outlook: Outlook, confidence: f64) -> Self {
        Self(Some(SentimentReading { outlook, confidence }))
    }
    pub fn failing() -> Self {
        Self(None)
    }
}

#[async_trait]
impl SentimentOracle for FixedSentiment {
    async fn analyze(&self, _: &str, _: &str) -> Result<SentimentReading, OracleError> {
        self.0.ok_or_else(|| OracleError::Unavailable("scripted failure".into()))
    }
}

pub struct FixedMl(Option<MlPrediction>);

impl FixedMl {
    pub fn ok(p: MlPrediction) -> Self {
        Self(Some(p))
    }
    pub fn failing() -> Self {
        Self(None)
    }
}

#[async_trait]
impl MlOracle for FixedMl {
    async fn predict(&self, _: &FeatureRow) -> Result<MlPrediction, OracleError> {
        self.0.ok_or_else(|| OracleError::Unavailable("scripted failure".into()))
    }
}

pub struct StaticNews(HashMap<Symbol, Vec<String>>);

impl StaticNews {
    pub fn new(items: &[(&str, &[&str])]) -> Self {
        Self(
            items
                .iter()
                .map(|(s, h)| (s.to_string(), h.iter().map(|x| x.to_string()).collect()))
                .collect(),
        )
    }
}

#[async_trait]
impl NewsSource for StaticNews {
    async fn headlines(&self, symbol: &str, count: usize) -> Vec<String> {
        self.0.get(symbol).map(|h| h.iter().take(count).cloned().collect()).unwrap_or_default()
    }
}

pub struct ManualClock(Mutex<NaiveDateTime>);

impl ManualClock {
    pub fn new(t: NaiveDateTime) -> Self {
        Self(Mutex::new(t))
    }
    pub fn set(&self, t: NaiveDateTime) {
        *self.0.lock().unwrap() = t;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.0.lock().unwrap()
    }
}
