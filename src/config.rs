// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : confluence_bot_rust — intraday confluence trading agents in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Runs one paper-trading agent per symbol (or one scanner agent over
          a universe), fusing regime / breakout / sentiment / ML / order-flow
          signals through a configurable confluence gate, sizing by fixed
          fractional risk, and enforcing SL / TP / end-of-day exits.
=============================================================================
*/
use std::env;
use std::str::FromStr;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::NaiveTime;
use chrono_tz::Tz;
use clap::Parser;
use dotenvy::dotenv;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::confluence::{ConfluenceRules, StrategyProfile};
use crate::domain::Symbol;
use crate::positions::{default_slippage, LedgerConfig};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid { key: &'static str, value: String, reason: String },
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("broker session check failed: {0}")]
    Session(String),
    #[error("no symbols to trade")]
    NoSymbols,
}

/// Satu agent per symbol, atau satu agent scanner dengan ledger bersama.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    Multi,
    Scanner,
}

impl RunMode {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "multi" | "multi_agent" | "per_symbol" => Some(RunMode::Multi),
            "scanner" | "scan" | "single" => Some(RunMode::Scanner),
            _ => None,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Multi => "multi",
            RunMode::Scanner => "scanner",
        }
    }
}

/// Sumber market data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Mock,
    Http,
}

impl FeedMode {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" | "sim" | "simulated" => Some(FeedMode::Mock),
            "http" | "broker" | "rest" => Some(FeedMode::Http),
            _ => None,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Mock => "mock",
            FeedMode::Http => "http",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstrumentMode {
    Underlying,
    AtmOption,
}

impl InstrumentMode {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "underlying" | "equity" | "spot" => Some(InstrumentMode::Underlying),
            "atm_option" | "option" | "options" => Some(InstrumentMode::AtmOption),
            _ => None,
        }
    }
}

/// Trading window in exchange-local time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Session {
    pub tz: Tz,
    pub open: NaiveTime,
    pub close: NaiveTime,
    /// no new entries from here on; open positions are flattened
    pub eod_cutoff: NaiveTime,
}

impl Session {
    pub fn is_open(&self, t: NaiveTime) -> bool {
        t >= self.open && t <= self.close
    }
    pub fn before_cutoff(&self, t: NaiveTime) -> bool {
        t < self.eod_cutoff
    }
}

/// CLI overrides; anything left out falls back to env / .env.
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "confluence_bot_rust", version, about = "Intraday confluence paper-trading agents")]
pub struct Cli {
    /// multi | scanner
    #[arg(long)]
    pub mode: Option<String>,
    /// comma separated, e.g. NSE:SBIN-EQ,NSE:TCS-EQ
    #[arg(long, value_delimiter = ',')]
    pub symbols: Vec<String>,
    /// strategy profile name
    #[arg(long)]
    pub strategy: Option<String>,
    /// mock | http
    #[arg(long)]
    pub feed: Option<String>,
    #[arg(long)]
    pub record_file: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Settings {
    // targets
    pub symbols: Vec<Symbol>,
    pub universe: Vec<Symbol>,
    pub run_mode: RunMode,
    pub select_by_liquidity: bool,
    pub top_n: usize,

    // strategy
    pub profile: StrategyProfile,
    pub sentiment_threshold: Option<f64>,
    pub imbalance_threshold: f64,
    pub book_depth: usize,
    pub sector_map: HashMap<Symbol, Symbol>,
    pub index_weights: Vec<(Symbol, f64)>,
    pub instrument_mode: InstrumentMode,
    pub option_prefix: String,
    pub strike_step: Decimal,

    // risk & ledger
    pub total_capital: Decimal,
    pub risk_percentage: Decimal,
    pub max_open_positions: usize,
    pub buy_slippage: Decimal,
    pub sell_slippage: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,

    // timing
    pub session: Session,
    pub cycle_interval: Duration,
    pub idle_interval: Duration,
    pub error_backoff: Duration,
    pub data_timeout: Duration,

    // collaborators
    pub feed_mode: FeedMode,
    pub broker_rest_url: String,
    pub broker_access_token: Option<String>,
    pub sentiment_url: Option<String>,
    pub ml_url: Option<String>,
    pub news_url: Option<String>,
    pub sim_seed: u64,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,
}

impl Settings {
    /// Profile rules with the configured thresholds applied.
    pub fn rules(&self) -> ConfluenceRules {
        let mut r = self.profile.rules();
        if let Some(t) = self.sentiment_threshold {
            r.sentiment_threshold = t;
        }
        r.imbalance_threshold = self.imbalance_threshold;
        r
    }

    pub fn ledger_config(&self, max_open_positions: usize) -> LedgerConfig {
        LedgerConfig {
            buy_slippage: self.buy_slippage,
            sell_slippage: self.sell_slippage,
            max_open_positions: max_open_positions.max(1),
        }
    }

    /// Scanner candidates; falls back to the symbol list.
    pub fn scan_universe(&self) -> &[Symbol] {
        if self.universe.is_empty() { &self.symbols } else { &self.universe }
    }
}

// ---------------------------------------------------------------------------
// parsing helpers (key lookup is injected so tests need no process env)
// ---------------------------------------------------------------------------

fn invalid(key: &'static str, value: &str, reason: impl ToString) -> StartupError {
    StartupError::Invalid { key, value: value.to_string(), reason: reason.to_string() }
}

fn num<T: FromStr>(get: &dyn Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, StartupError>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(v) if !v.trim().is_empty() => v.trim().parse::<T>().map_err(|e| invalid(key, &v, e)),
        _ => Ok(default),
    }
}

fn time(get: &dyn Fn(&str) -> Option<String>, key: &'static str, default: (u32, u32)) -> Result<NaiveTime, StartupError> {
    match get(key) {
        Some(v) if !v.trim().is_empty() => NaiveTime::parse_from_str(v.trim(), "%H:%M").map_err(|e| invalid(key, &v, e)),
        _ => NaiveTime::from_hms_opt(default.0, default.1, 0).ok_or_else(|| invalid(key, "", "bad default")),
    }
}

fn opt_string(get: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    get(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn symbol_list(raw: &str) -> Vec<Symbol> {
    let mut out: Vec<Symbol> = Vec::new();
    for s in raw.split(',').map(|x| x.trim().to_ascii_uppercase()).filter(|x| !x.is_empty()) {
        if !out.contains(&s) {
            out.push(s);
        }
    }
    out
}

/// `SYM=INDEX,SYM2=INDEX2`
pub fn parse_sector_map(raw: &str) -> Result<HashMap<Symbol, Symbol>, StartupError> {
    let mut out = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (sym, idx) = pair.split_once('=').ok_or_else(|| invalid("SECTOR_MAP", pair, "expected SYMBOL=INDEX"))?;
        out.insert(sym.trim().to_ascii_uppercase(), idx.trim().to_ascii_uppercase());
    }
    Ok(out)
}

/// `SYM:weight,SYM2:weight` (weights in percent).
pub fn parse_index_weights(raw: &str) -> Result<Vec<(Symbol, f64)>, StartupError> {
    let mut out = Vec::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (sym, w) = pair.rsplit_once(':').ok_or_else(|| invalid("INDEX_WEIGHTS", pair, "expected SYMBOL:WEIGHT"))?;
        let w: f64 = w.trim().parse().map_err(|e| invalid("INDEX_WEIGHTS", pair, e))?;
        if !w.is_finite() || w < 0.0 {
            return Err(invalid("INDEX_WEIGHTS", pair, "weight must be >= 0"));
        }
        out.push((sym.trim().to_string(), w));
    }
    Ok(out)
}

pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>, cli: &Cli) -> Result<Settings, StartupError> {
    // ===== Targets =====
    let symbols = if !cli.symbols.is_empty() {
        symbol_list(&cli.symbols.join(","))
    } else {
        symbol_list(&get("SYMBOLS").unwrap_or_else(|| "NSE:NIFTY50-INDEX".to_string()))
    };
    let universe = symbol_list(&get("UNIVERSE").unwrap_or_default());

    let mode_raw = cli.mode.clone().or_else(|| get("RUN_MODE")).unwrap_or_else(|| "multi".into());
    let run_mode = RunMode::parse_one(&mode_raw).ok_or_else(|| invalid("RUN_MODE", &mode_raw, "multi|scanner"))?;

    // ===== Strategy =====
    let strat_raw = cli
        .strategy
        .clone()
        .or_else(|| get("STRATEGY"))
        .unwrap_or_else(|| "confluence_breakout_v2".into());
    let profile = StrategyProfile::parse_one(&strat_raw).ok_or_else(|| invalid("STRATEGY", &strat_raw, "unknown profile"))?;
    let (sl_default, tp_default) = profile.exit_levels();

    let sentiment_threshold = match opt_string(get, "SENTIMENT_THRESHOLD") {
        Some(v) => Some(v.parse::<f64>().map_err(|e| invalid("SENTIMENT_THRESHOLD", &v, e))?),
        None => None,
    };

    let instrument_raw = get("INSTRUMENT_MODE").unwrap_or_else(|| "underlying".into());
    let instrument_mode =
        InstrumentMode::parse_one(&instrument_raw).ok_or_else(|| invalid("INSTRUMENT_MODE", &instrument_raw, "underlying|atm_option"))?;

    // ===== Risk =====
    let total_capital: Decimal = num(get, "TOTAL_CAPITAL", Decimal::new(100_000, 0))?;
    if total_capital <= Decimal::ZERO {
        return Err(invalid("TOTAL_CAPITAL", &total_capital.to_string(), "must be > 0"));
    }
    let risk_percentage: Decimal = num(get, "RISK_PERCENTAGE", Decimal::ONE)?;
    if risk_percentage <= Decimal::ZERO || risk_percentage > Decimal::ONE_HUNDRED {
        return Err(invalid("RISK_PERCENTAGE", &risk_percentage.to_string(), "must be in (0, 100]"));
    }

    // ===== Session =====
    let tz_raw = get("MARKET_TZ").unwrap_or_else(|| "Asia/Kolkata".into());
    let tz: Tz = tz_raw.trim().parse().map_err(|e| invalid("MARKET_TZ", &tz_raw, e))?;
    let session = Session {
        tz,
        open: time(get, "MARKET_OPEN", (9, 15))?,
        close: time(get, "MARKET_CLOSE", (15, 30))?,
        eod_cutoff: time(get, "EOD_CUTOFF", (15, 15))?,
    };
    if session.open >= session.close {
        return Err(invalid("MARKET_OPEN", &session.open.to_string(), "must be before MARKET_CLOSE"));
    }
    if session.eod_cutoff <= session.open || session.eod_cutoff > session.close {
        return Err(invalid("EOD_CUTOFF", &session.eod_cutoff.to_string(), "must be after MARKET_OPEN and not after MARKET_CLOSE"));
    }

    // ===== Feed =====
    let feed_raw = cli.feed.clone().or_else(|| get("FEED_MODE")).unwrap_or_else(|| "mock".into());
    let feed_mode = FeedMode::parse_one(&feed_raw).ok_or_else(|| invalid("FEED_MODE", &feed_raw, "mock|http"))?;
    let broker_access_token = opt_string(get, "BROKER_ACCESS_TOKEN");
    if feed_mode == FeedMode::Http && broker_access_token.is_none() {
        return Err(StartupError::Missing("BROKER_ACCESS_TOKEN"));
    }

    let settings = Settings {
        symbols,
        universe,
        run_mode,
        select_by_liquidity: num(get, "SELECT_BY_LIQUIDITY", false)?,
        top_n: num(get, "TOP_N", 5usize)?,

        profile,
        sentiment_threshold,
        imbalance_threshold: num(get, "IMBALANCE_THRESHOLD", crate::orderflow::DEFAULT_THRESHOLD)?,
        book_depth: num(get, "BOOK_DEPTH", crate::orderflow::DEFAULT_DEPTH)?,
        sector_map: parse_sector_map(&get("SECTOR_MAP").unwrap_or_default())?,
        index_weights: parse_index_weights(&get("INDEX_WEIGHTS").unwrap_or_default())?,
        instrument_mode,
        option_prefix: opt_string(get, "OPTION_PREFIX").unwrap_or_else(|| "NSE:NIFTY".into()),
        strike_step: num(get, "STRIKE_STEP", Decimal::new(50, 0))?,

        total_capital,
        risk_percentage,
        max_open_positions: num(get, "MAX_OPEN_POSITIONS", 3usize)?,
        buy_slippage: num(get, "BUY_SLIPPAGE", default_slippage())?,
        sell_slippage: num(get, "SELL_SLIPPAGE", default_slippage())?,
        stop_loss_pct: num(get, "STOP_LOSS_PCT", Decimal::try_from(sl_default).unwrap_or(Decimal::ONE))?,
        take_profit_pct: num(get, "TAKE_PROFIT_PCT", Decimal::try_from(tp_default).unwrap_or(Decimal::TWO))?,

        session,
        cycle_interval: Duration::from_secs(num(get, "CYCLE_INTERVAL_SECS", 60u64)?),
        idle_interval: Duration::from_secs(num(get, "IDLE_INTERVAL_SECS", 300u64)?),
        error_backoff: Duration::from_secs(num(get, "ERROR_BACKOFF_SECS", 60u64)?),
        data_timeout: Duration::from_millis(num(get, "DATA_TIMEOUT_MS", 5_000u64)?),

        feed_mode,
        broker_rest_url: opt_string(get, "BROKER_REST_URL").unwrap_or_else(|| "https://api-t1.fyers.in/data".into()),
        broker_access_token,
        sentiment_url: opt_string(get, "SENTIMENT_URL"),
        ml_url: opt_string(get, "ML_URL"),
        news_url: opt_string(get, "NEWS_URL"),
        sim_seed: num(get, "SIM_SEED", 42u64)?,

        record_file: cli.record_file.clone().or_else(|| opt_string(get, "RECORD_FILE")),
        metrics_port: num(get, "METRICS_PORT", 9898u16)?,
    };

    if settings.symbols.is_empty() && settings.universe.is_empty() {
        return Err(StartupError::NoSymbols);
    }
    Ok(settings)
}

pub fn load(cli: &Cli) -> Result<Settings, StartupError> {
    // Pastikan .env dibaca (agar SYMBOLS, STRATEGY, dll ter-load)
    let _ = dotenv();
    from_lookup(&|k: &str| env::var(k).ok(), cli)
}
