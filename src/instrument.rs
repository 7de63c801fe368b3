// ===============================
// src/instrument.rs
// ===============================
//
// What actually gets bought for a confluence direction. The ledger is
// long-only, so a bearish view either stands down (underlying) or becomes a
// long put (ATM option).
//
use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::warn;

use crate::domain::{Direction, Quote, Symbol};
use crate::feed::{DataError, MarketData};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrument {
    pub symbol: Symbol,
    pub price: Decimal,
}

#[async_trait]
pub trait InstrumentResolver: Send + Sync {
    /// `Ok(None)` means no tradeable instrument for this direction.
    async fn resolve(
        &self,
        underlying: &Quote,
        direction: Direction,
        now: NaiveDateTime,
        feed: &dyn MarketData,
    ) -> Result<Option<Instrument>, DataError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Underlying;

#[async_trait]
impl InstrumentResolver for Underlying {
    async fn resolve(&self, underlying: &Quote, direction: Direction, _: NaiveDateTime, _: &dyn MarketData) -> Result<Option<Instrument>, DataError> {
        match direction {
            Direction::Long => Ok(Some(Instrument { symbol: underlying.symbol.clone(), price: underlying.last_price })),
            Direction::Short => {
                warn!(symbol = %underlying.symbol, "bearish signal on a long-only book, standing down");
                Ok(None)
            }
            Direction::None => Ok(None),
        }
    }
}

/// Weekly index options, nearest Thursday expiry.
#[derive(Debug, Clone)]
pub struct AtmOption {
    /// e.g. "NSE:NIFTY"
    pub prefix: String,
    pub strike_step: Decimal,
    /// after this time on expiry day the next week's contract is used
    pub expiry_roll: NaiveTime,
}

impl AtmOption {
    pub fn new(prefix: impl Into<String>, strike_step: Decimal) -> Self {
        Self {
            prefix: prefix.into(),
            strike_step,
            expiry_roll: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or(NaiveTime::MIN),
        }
    }

    pub fn atm_strike(&self, spot: Decimal) -> Decimal {
        if self.strike_step <= Decimal::ZERO {
            return spot;
        }
        (spot / self.strike_step).round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven) * self.strike_step
    }

    pub fn contract_symbol(&self, expiry: NaiveDate, strike: Decimal, direction: Direction) -> Option<Symbol> {
        let kind = match direction {
            Direction::Long => "CE",
            Direction::Short => "PE",
            Direction::None => return None,
        };
        let strike = strike.trunc().to_i64()?;
        let exp = expiry.format("%y%b%d").to_string().to_ascii_uppercase();
        Some(format!("{}{}{}{}", self.prefix, exp, strike, kind))
    }
}

/// Nearest Thursday on or after `now`; on a Thursday past `roll` it is next week's.
pub fn next_weekly_expiry(now: NaiveDateTime, roll: NaiveTime) -> NaiveDate {
    let today = now.date();
    let days_ahead = (Weekday::Thu.num_days_from_monday() as i64 - today.weekday().num_days_from_monday() as i64 + 7) % 7;
    let days_ahead = if days_ahead == 0 && now.time() > roll { 7 } else { days_ahead };
    today + Duration::days(days_ahead)
}

#[async_trait]
impl InstrumentResolver for AtmOption {
    async fn resolve(
        &self,
        underlying: &Quote,
        direction: Direction,
        now: NaiveDateTime,
        feed: &dyn MarketData,
    ) -> Result<Option<Instrument>, DataError> {
        let expiry = next_weekly_expiry(now, self.expiry_roll);
        let strike = self.atm_strike(underlying.last_price);
        let Some(symbol) = self.contract_symbol(expiry, strike, direction) else {
            return Ok(None);
        };
        let q = feed.quote(&symbol).await?;
        if q.last_price <= Decimal::ZERO {
            warn!(%symbol, "option has no tradeable price");
            return Ok(None);
        }
        Ok(Some(Instrument { symbol, price: q.last_price }))
    }
}
