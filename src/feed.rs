// ===============================
// src/feed.rs
// ===============================
//
// Market data adapters behind one trait:
// - SimulatedFeed : seeded random walk (quotes, candles, depth) for running
//                   without a broker
// - HttpFeed      : broker REST (quotes / history / depth), checked once at
//                   startup with a profile call
// - Timed<M>      : wraps any feed so every call has a bounded wait
//
// Broker payloads are loose JSON; they are decoded into Raw* structs with
// every field optional, then converted with explicit MissingField errors.
//
use std::sync::Mutex;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{Candle, OrderBookLevel, OrderBookSnapshot, Quote, Symbol, Timeframe};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("data unavailable for {symbol}: {reason}")]
    Unavailable { symbol: Symbol, reason: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("decode error: {0}")]
    Decode(String),
}

impl DataError {
    pub fn unavailable(symbol: &str, reason: impl Into<String>) -> Self {
        DataError::Unavailable { symbol: symbol.to_string(), reason: reason.into() }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DataError::Timeout(_) => "timeout",
            _ => "data_unavailable",
        }
    }
}

#[async_trait]
pub trait MarketData: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<Quote, DataError>;
    /// Symbols without a usable quote are left out.
    async fn quotes(&self, symbols: &[Symbol]) -> Result<Vec<Quote>, DataError>;
    /// Oldest first. May be empty.
    async fn candles(&self, symbol: &str, tf: Timeframe, lookback_days: u32) -> Result<Vec<Candle>, DataError>;
    async fn order_book(&self, symbol: &str) -> Result<OrderBookSnapshot, DataError>;
}

// ---------------------------------------------------------------------------
// bounded waits
// ---------------------------------------------------------------------------

pub struct Timed<M> {
    inner: M,
    limit: Duration,
}

impl<M> Timed<M> {
    pub fn new(inner: M, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

async fn bounded<T>(limit: Duration, fut: impl std::future::Future<Output = Result<T, DataError>>) -> Result<T, DataError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(DataError::Timeout(limit)),
    }
}

#[async_trait]
impl<M: MarketData> MarketData for Timed<M> {
    async fn quote(&self, symbol: &str) -> Result<Quote, DataError> {
        bounded(self.limit, self.inner.quote(symbol)).await
    }
    async fn quotes(&self, symbols: &[Symbol]) -> Result<Vec<Quote>, DataError> {
        bounded(self.limit, self.inner.quotes(symbols)).await
    }
    async fn candles(&self, symbol: &str, tf: Timeframe, lookback_days: u32) -> Result<Vec<Candle>, DataError> {
        bounded(self.limit, self.inner.candles(symbol, tf, lookback_days)).await
    }
    async fn order_book(&self, symbol: &str) -> Result<OrderBookSnapshot, DataError> {
        bounded(self.limit, self.inner.order_book(symbol)).await
    }
}

// ---------------------------------------------------------------------------
// loose payloads -> structured records
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct RawQuote {
    #[serde(rename = "lp")]
    pub last_price: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume: Option<f64>,
    pub open_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct RawQuoteEntry {
    #[serde(rename = "n")]
    pub name: Option<String>,
    #[serde(rename = "v", default)]
    pub values: RawQuote,
}

#[derive(Debug, Deserialize)]
pub struct RawQuotesResponse {
    #[serde(rename = "s")]
    pub status: Option<String>,
    #[serde(rename = "d", default)]
    pub data: Vec<RawQuoteEntry>,
}

#[derive(Debug, Deserialize)]
pub struct RawHistoryResponse {
    #[serde(rename = "s")]
    pub status: Option<String>,
    #[serde(default)]
    pub candles: Vec<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
pub struct RawLevel {
    pub price: Option<f64>,
    pub volume: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct RawDepth {
    pub bids: Option<Vec<RawLevel>>,
    pub asks: Option<Vec<RawLevel>>,
}

fn dec(v: f64, field: &'static str) -> Result<Decimal, DataError> {
    Decimal::from_f64(v).ok_or(DataError::MissingField(field))
}

impl RawQuote {
    pub fn into_quote(self, symbol: &str) -> Result<Quote, DataError> {
        let lp = self.last_price.filter(|p| *p > 0.0).ok_or(DataError::MissingField("lp"))?;
        Ok(Quote {
            symbol: symbol.to_string(),
            last_price: dec(lp, "lp")?,
            bid: dec(self.bid.ok_or(DataError::MissingField("bid"))?, "bid")?,
            ask: dec(self.ask.ok_or(DataError::MissingField("ask"))?, "ask")?,
            volume: self.volume.ok_or(DataError::MissingField("volume"))?.max(0.0) as u64,
            open_price: dec(self.open_price.ok_or(DataError::MissingField("open_price"))?, "open_price")?,
        })
    }
}

impl RawQuotesResponse {
    pub fn into_quotes(self) -> Result<Vec<Quote>, DataError> {
        if self.status.as_deref() != Some("ok") {
            return Err(DataError::Decode(format!("quote status {:?}", self.status)));
        }
        let mut out = Vec::with_capacity(self.data.len());
        for entry in self.data {
            let Some(name) = entry.name else { continue };
            match entry.values.into_quote(&name) {
                Ok(q) => out.push(q),
                Err(e) => warn!(symbol = %name, %e, "skipping incomplete quote"),
            }
        }
        Ok(out)
    }
}

impl RawHistoryResponse {
    /// Rows are [epoch_secs, o, h, l, c, v]; returned sorted by time with
    /// duplicate timestamps dropped (first wins).
    pub fn into_candles(self) -> Result<Vec<Candle>, DataError> {
        if self.status.as_deref() != Some("ok") {
            return Err(DataError::Decode(format!("history status {:?}", self.status)));
        }
        let mut out: Vec<Candle> = Vec::with_capacity(self.candles.len());
        for row in self.candles {
            if row.len() < 6 {
                return Err(DataError::Decode(format!("candle row has {} fields", row.len())));
            }
            let ts = DateTime::from_timestamp(row[0] as i64, 0)
                .ok_or(DataError::MissingField("timestamp"))?
                .naive_utc();
            out.push(Candle {
                ts,
                open: dec(row[1], "open")?,
                high: dec(row[2], "high")?,
                low: dec(row[3], "low")?,
                close: dec(row[4], "close")?,
                volume: row[5].max(0.0) as u64,
            });
        }
        out.sort_by_key(|c| c.ts);
        out.dedup_by_key(|c| c.ts);
        Ok(out)
    }
}

impl RawDepth {
    pub fn into_snapshot(self) -> Result<OrderBookSnapshot, DataError> {
        let side = |levels: Vec<RawLevel>, field: &'static str| -> Result<Vec<OrderBookLevel>, DataError> {
            levels
                .into_iter()
                .map(|l| {
                    Ok(OrderBookLevel {
                        price: dec(l.price.ok_or(DataError::MissingField(field))?, field)?,
                        volume: l.volume.ok_or(DataError::MissingField(field))?.max(0.0) as u64,
                    })
                })
                .collect()
        };
        let mut bids = side(self.bids.ok_or(DataError::MissingField("bids"))?, "bids")?;
        let mut asks = side(self.asks.ok_or(DataError::MissingField("asks"))?, "asks")?;
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));
        Ok(OrderBookSnapshot { bids, asks })
    }
}

// ---------------------------------------------------------------------------
// HTTP broker feed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpFeed {
    http: reqwest::Client,
    base: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    #[serde(rename = "s")]
    status: Option<String>,
}

impl HttpFeed {
    /// Build the client and verify the session. A failed profile check is the
    /// one error that stops the process before any agent starts.
    pub async fn connect(base: &str, token: &str, timeout: Duration) -> Result<Self, DataError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DataError::Decode(e.to_string()))?;
        let feed = Self { http, base: base.trim_end_matches('/').to_string(), token: token.to_string() };
        let profile: ProfileResponse = feed.get_json("profile", &[]).await?;
        if profile.status.as_deref() != Some("ok") {
            return Err(DataError::unavailable("profile", format!("session rejected: {:?}", profile.status)));
        }
        info!(base = %feed.base, "broker session ok");
        Ok(feed)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, DataError> {
        let url = format!("{}/{}", self.base, path);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .map_err(|e| DataError::unavailable(path, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(DataError::unavailable(path, format!("status {}", resp.status())));
        }
        resp.json::<T>().await.map_err(|e| DataError::Decode(e.to_string()))
    }
}

#[async_trait]
impl MarketData for HttpFeed {
    async fn quote(&self, symbol: &str) -> Result<Quote, DataError> {
        let raw: RawQuotesResponse = self.get_json("quotes", &[("symbols", symbol.to_string())]).await?;
        raw.into_quotes()?
            .into_iter()
            .find(|q| q.symbol == symbol)
            .ok_or_else(|| DataError::unavailable(symbol, "no quote"))
    }

    async fn quotes(&self, symbols: &[Symbol]) -> Result<Vec<Quote>, DataError> {
        let raw: RawQuotesResponse = self.get_json("quotes", &[("symbols", symbols.join(","))]).await?;
        raw.into_quotes()
    }

    async fn candles(&self, symbol: &str, tf: Timeframe, lookback_days: u32) -> Result<Vec<Candle>, DataError> {
        let to = chrono::Utc::now().date_naive();
        let from = to - ChronoDuration::days(lookback_days as i64);
        let q = [
            ("symbol", symbol.to_string()),
            ("resolution", tf.resolution().to_string()),
            ("range_from", from.format("%Y-%m-%d").to_string()),
            ("range_to", to.format("%Y-%m-%d").to_string()),
        ];
        let raw: RawHistoryResponse = self.get_json("history", &q).await?;
        raw.into_candles()
    }

    async fn order_book(&self, symbol: &str) -> Result<OrderBookSnapshot, DataError> {
        let raw: RawDepth = self.get_json("depth", &[("symbol", symbol.to_string())]).await?;
        raw.into_snapshot()
    }
}

// ---------------------------------------------------------------------------
// Simulated feed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct SimState {
    rng: StdRng,
    price_ticks: i64, // 2 decimals
    open_ticks: i64,
    volume: u64,
}

/// Random walk per symbol. Each symbol gets its own RNG derived from the
/// seed and the symbol name, so one symbol's path does not depend on how
/// often other symbols are polled.
pub struct SimulatedFeed {
    seed: u64,
    start: NaiveDateTime,
    state: Mutex<HashMap<Symbol, SimState>>,
}

fn symbol_seed(seed: u64, symbol: &str) -> u64 {
    symbol.bytes().fold(seed ^ 0xcbf2_9ce4_8422_2325, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3))
}

fn ticks(t: i64) -> Decimal {
    Decimal::new(t, 2)
}

impl SimulatedFeed {
    pub fn new(seed: u64, start: NaiveDateTime) -> Self {
        Self { seed, start, state: Mutex::new(HashMap::new()) }
    }

    fn with_state<T>(&self, symbol: &str, f: impl FnOnce(&mut SimState) -> T) -> Result<T, DataError> {
        let mut guard = self.state.lock().map_err(|_| DataError::unavailable(symbol, "feed state poisoned"))?;
        let st = guard.entry(symbol.to_string()).or_insert_with(|| {
            let mut rng = StdRng::seed_from_u64(symbol_seed(self.seed, symbol));
            let px = rng.gen_range(100_00..2_000_00);
            SimState { rng, price_ticks: px, open_ticks: px, volume: 0 }
        });
        Ok(f(st))
    }

    fn step(st: &mut SimState) {
        let step = st.rng.gen_range(-30..=32);
        st.price_ticks = (st.price_ticks + step).max(1_00);
        st.volume += st.rng.gen_range(1_000..20_000);
    }
}

#[async_trait]
impl MarketData for SimulatedFeed {
    async fn quote(&self, symbol: &str) -> Result<Quote, DataError> {
        self.with_state(symbol, |st| {
            Self::step(st);
            Quote {
                symbol: symbol.to_string(),
                last_price: ticks(st.price_ticks),
                bid: ticks(st.price_ticks - 5),
                ask: ticks(st.price_ticks + 5),
                volume: st.volume,
                open_price: ticks(st.open_ticks),
            }
        })
    }

    async fn quotes(&self, symbols: &[Symbol]) -> Result<Vec<Quote>, DataError> {
        let mut out = Vec::with_capacity(symbols.len());
        for s in symbols {
            out.push(self.quote(s).await?);
        }
        Ok(out)
    }

    async fn candles(&self, symbol: &str, tf: Timeframe, lookback_days: u32) -> Result<Vec<Candle>, DataError> {
        let minutes: i64 = match tf {
            Timeframe::Min5 => 5,
            Timeframe::Min45 => 45,
        };
        // ~6h15m session
        let per_day = (375 / minutes) as usize;
        let n = per_day * lookback_days.max(1) as usize;
        self.with_state(symbol, |st| {
            // walk backwards from the current price so the last close is "now"
            let mut closes = Vec::with_capacity(n);
            let mut px = st.price_ticks;
            for _ in 0..n {
                closes.push(px);
                px = (px - st.rng.gen_range(-40..=40)).max(1_00);
            }
            closes.reverse();
            let mut prev = closes.first().copied().unwrap_or(st.price_ticks);
            closes
                .into_iter()
                .enumerate()
                .map(|(i, c)| {
                    let wick = st.rng.gen_range(0..=20);
                    let bar = Candle {
                        ts: self.start + ChronoDuration::minutes(minutes * i as i64),
                        open: ticks(prev),
                        high: ticks(prev.max(c) + wick),
                        low: ticks((prev.min(c) - wick).max(1)),
                        close: ticks(c),
                        volume: st.rng.gen_range(10_000..200_000),
                    };
                    prev = c;
                    bar
                })
                .collect()
        })
    }

    async fn order_book(&self, symbol: &str) -> Result<OrderBookSnapshot, DataError> {
        self.with_state(symbol, |st| {
            let mid = st.price_ticks;
            let bids = (1..=10)
                .map(|i| OrderBookLevel { price: ticks(mid - 5 * i), volume: st.rng.gen_range(100..10_000) })
                .collect();
            let asks = (1..=10)
                .map(|i| OrderBookLevel { price: ticks(mid + 5 * i), volume: st.rng.gen_range(100..10_000) })
                .collect();
            OrderBookSnapshot { bids, asks }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 6).unwrap().and_hms_opt(9, 15, 0).unwrap()
    }

    #[test]
    fn quote_payload_with_missing_field_is_typed() {
        let raw: RawQuote = serde_json::from_value(json!({"lp": 101.5, "bid": 101.4, "ask": 101.6, "volume": 1000})).unwrap();
        assert_eq!(raw.into_quote("X").unwrap_err(), DataError::MissingField("open_price"));
        let raw: RawQuote = serde_json::from_value(json!({"lp": 0.0})).unwrap();
        assert_eq!(raw.into_quote("X").unwrap_err(), DataError::MissingField("lp"));
    }

    #[test]
    fn quotes_response_skips_incomplete_entries() {
        let resp: RawQuotesResponse = serde_json::from_value(json!({
            "s": "ok",
            "d": [
                {"n": "A", "v": {"lp": 10.0, "bid": 9.9, "ask": 10.1, "volume": 500, "open_price": 9.5}},
                {"n": "B", "v": {"lp": 20.0}},
                {"v": {"lp": 1.0}}
            ]
        }))
        .unwrap();
        let q = resp.into_quotes().unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q[0].symbol, "A");
        assert_eq!(q[0].last_price, dec!(10));
    }

    #[test]
    fn failed_status_is_an_error() {
        let resp: RawQuotesResponse = serde_json::from_value(json!({"s": "error", "d": []})).unwrap();
        assert!(matches!(resp.into_quotes(), Err(DataError::Decode(_))));
    }

    #[test]
    fn history_is_sorted_and_deduplicated() {
        let resp: RawHistoryResponse = serde_json::from_value(json!({
            "s": "ok",
            "candles": [
                [1741250400.0, 2.0, 3.0, 1.0, 2.5, 10.0],
                [1741250100.0, 1.0, 2.0, 0.5, 1.5, 10.0],
                [1741250400.0, 9.0, 9.0, 9.0, 9.0, 10.0]
            ]
        }))
        .unwrap();
        let c = resp.into_candles().unwrap();
        assert_eq!(c.len(), 2);
        assert!(c[0].ts < c[1].ts);
        assert_eq!(c[1].close, dec!(2.5));
    }

    #[test]
    fn depth_requires_both_sides_and_orders_them() {
        let raw: RawDepth = serde_json::from_value(json!({
            "bids": [{"price": 99.0, "volume": 10}, {"price": 100.0, "volume": 5}],
            "asks": [{"price": 102.0, "volume": 1}, {"price": 101.0, "volume": 2}]
        }))
        .unwrap();
        let book = raw.into_snapshot().unwrap();
        assert_eq!(book.bids[0].price, dec!(100));
        assert_eq!(book.asks[0].price, dec!(101));
        let raw: RawDepth = serde_json::from_value(json!({"bids": []})).unwrap();
        assert_eq!(raw.into_snapshot().unwrap_err(), DataError::MissingField("asks"));
    }

    #[tokio::test]
    async fn simulated_feed_is_reproducible_per_symbol() {
        let a = SimulatedFeed::new(7, t0());
        let b = SimulatedFeed::new(7, t0());
        // polling another symbol on `b` must not disturb A's path
        b.quote("OTHER").await.unwrap();
        for _ in 0..5 {
            assert_eq!(a.quote("A").await.unwrap(), b.quote("A").await.unwrap());
        }
        let ca = a.candles("A", Timeframe::Min5, 2).await.unwrap();
        let cb = b.candles("A", Timeframe::Min5, 2).await.unwrap();
        assert_eq!(ca, cb);
        assert_eq!(ca.len(), 150);
        assert!(ca.windows(2).all(|w| w[0].ts < w[1].ts));
    }

    #[tokio::test]
    async fn simulated_book_is_well_formed() {
        let f = SimulatedFeed::new(1, t0());
        let book = f.order_book("A").await.unwrap();
        assert_eq!(book.bids.len(), 10);
        assert!(book.bids.windows(2).all(|w| w[0].price > w[1].price));
        assert!(book.asks.windows(2).all(|w| w[0].price < w[1].price));
        assert!(book.bids[0].price < book.asks[0].price);
    }

    struct Stalled;

    #[async_trait]
    impl MarketData for Stalled {
        async fn quote(&self, _: &str) -> Result<Quote, DataError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(DataError::unavailable("x", "never"))
        }
        async fn quotes(&self, _: &[Symbol]) -> Result<Vec<Quote>, DataError> {
            Ok(Vec::new())
        }
        async fn candles(&self, _: &str, _: Timeframe, _: u32) -> Result<Vec<Candle>, DataError> {
            Ok(Vec::new())
        }
        async fn order_book(&self, _: &str) -> Result<OrderBookSnapshot, DataError> {
            Ok(OrderBookSnapshot::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_call_times_out() {
        let f = Timed::new(Stalled, Duration::from_millis(250));
        assert_eq!(f.quote("X").await.unwrap_err(), DataError::Timeout(Duration::from_millis(250)));
    }
}
