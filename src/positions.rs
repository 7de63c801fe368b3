// ===============================
// src/positions.rs (paper ledger & PnL)
// ===============================
//
// Per-account ledger. Per symbol: FLAT -> OPEN (buy) -> FLAT (sell).
// At most one position per symbol; sells always close the full quantity.
// Every mutating call either commits completely or returns an error with the
// account untouched.
//
use std::fmt;

use ahash::AHashMap as HashMap;
use chrono::{NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::{ExecutionRequest, ExitReason, Position, Side, Symbol, TradeRecord};

/// 5 bps each way
pub fn default_slippage() -> Decimal {
    Decimal::new(5, 4)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("{0} already has an open position")]
    AlreadyOpen(Symbol),
    #[error("max open positions ({0}) reached")]
    MaxOpenPositions(usize),
    #[error("quantity must be positive")]
    InvalidQuantity,
    #[error("insufficient balance: cost {cost} > balance {balance}")]
    InsufficientBalance { cost: Decimal, balance: Decimal },
    #[error("insufficient position in {symbol}: want {wanted}, held {held}")]
    InsufficientPosition { symbol: Symbol, wanted: u64, held: u64 },
    #[error("partial exit of {symbol} not supported: want {wanted}, held {held}")]
    PartialExit { symbol: Symbol, wanted: u64, held: u64 },
    #[error("ledger only opens longs, got a {0:?} entry")]
    UnsupportedSide(Side),
}

impl LedgerError {
    pub fn label(&self) -> &'static str {
        match self {
            LedgerError::AlreadyOpen(_) => "already_open",
            LedgerError::MaxOpenPositions(_) => "max_open_positions",
            LedgerError::InvalidQuantity => "invalid_quantity",
            LedgerError::InsufficientBalance { .. } => "insufficient_balance",
            LedgerError::InsufficientPosition { .. } => "insufficient_position",
            LedgerError::PartialExit { .. } => "partial_exit",
            LedgerError::UnsupportedSide(_) => "unsupported_side",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    pub buy_slippage: Decimal,
    pub sell_slippage: Decimal,
    /// 1 = single position at a time, N = scanner style cap.
    pub max_open_positions: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { buy_slippage: default_slippage(), sell_slippage: default_slippage(), max_open_positions: 1 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub initial_balance: Decimal,
    pub balance: Decimal,
    pub positions: HashMap<Symbol, Position>,
    pub trade_log: Vec<TradeRecord>,
}

/// Exit the ledger wants taken this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitTrigger {
    pub reason: ExitReason,
    pub price: Decimal,
}

#[derive(Debug, Clone)]
pub struct PositionLedger {
    account: Account,
    cfg: LedgerConfig,
    next_id: u64,
}

impl PositionLedger {
    pub fn new(initial_balance: Decimal, cfg: LedgerConfig) -> Self {
        Self {
            account: Account {
                initial_balance,
                balance: initial_balance,
                positions: HashMap::new(),
                trade_log: Vec::new(),
            },
            cfg,
            next_id: 1,
        }
    }

    pub fn account(&self) -> &Account { &self.account }
    pub fn balance(&self) -> Decimal { self.account.balance }
    pub fn trade_log(&self) -> &[TradeRecord] { &self.account.trade_log }
    pub fn position(&self, symbol: &str) -> Option<&Position> { self.account.positions.get(symbol) }
    pub fn is_flat(&self, symbol: &str) -> bool { !self.account.positions.contains_key(symbol) }
    /// True when any open position was entered on behalf of `underlying`.
    pub fn holds_underlying(&self, underlying: &str) -> bool {
        self.account.positions.values().any(|p| p.underlying == underlying)
    }
    pub fn open_count(&self) -> usize { self.account.positions.len() }
    pub fn at_capacity(&self) -> bool { self.open_count() >= self.cfg.max_open_positions }

    /// Open symbols in a stable order.
    pub fn open_symbols(&self) -> Vec<Symbol> {
        let mut out: Vec<Symbol> = self.account.positions.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn total_realized_pnl(&self) -> Decimal {
        self.account.trade_log.iter().map(|t| t.realized_pnl).sum()
    }

    pub fn buy(&mut self, req: &ExecutionRequest, at: NaiveDateTime) -> Result<TradeRecord, LedgerError> {
        if req.side != Side::Buy {
            return Err(LedgerError::UnsupportedSide(req.side));
        }
        if req.quantity == 0 {
            return Err(LedgerError::InvalidQuantity);
        }
        if !self.is_flat(&req.symbol) {
            return Err(LedgerError::AlreadyOpen(req.symbol.clone()));
        }
        if self.holds_underlying(&req.underlying) {
            return Err(LedgerError::AlreadyOpen(req.underlying.clone()));
        }
        if self.at_capacity() {
            return Err(LedgerError::MaxOpenPositions(self.cfg.max_open_positions));
        }

        let fill = req.price * (Decimal::ONE + self.cfg.buy_slippage);
        let cost = Decimal::from(req.quantity) * fill;
        if cost > self.account.balance {
            return Err(LedgerError::InsufficientBalance { cost, balance: self.account.balance });
        }

        self.account.balance -= cost;
        self.account.positions.insert(
            req.symbol.clone(),
            Position {
                symbol: req.symbol.clone(),
                underlying: req.underlying.clone(),
                quantity: req.quantity,
                entry_price: fill,
                stop_loss: req.stop_loss,
                take_profit: req.take_profit,
                opened_at: at,
            },
        );
        Ok(self.log(at, &req.symbol, Side::Buy, req.quantity, fill, Decimal::ZERO))
    }

    pub fn sell(&mut self, symbol: &str, qty: u64, price: Decimal, at: NaiveDateTime) -> Result<TradeRecord, LedgerError> {
        if qty == 0 {
            return Err(LedgerError::InvalidQuantity);
        }
        let held = self.account.positions.get(symbol).map(|p| p.quantity).unwrap_or(0);
        if qty > held {
            return Err(LedgerError::InsufficientPosition { symbol: symbol.to_string(), wanted: qty, held });
        }
        if qty < held {
            return Err(LedgerError::PartialExit { symbol: symbol.to_string(), wanted: qty, held });
        }
        let Some(pos) = self.account.positions.remove(symbol) else {
            return Err(LedgerError::InsufficientPosition { symbol: symbol.to_string(), wanted: qty, held: 0 });
        };

        let fill = price * (Decimal::ONE - self.cfg.sell_slippage);
        let proceeds = Decimal::from(qty) * fill;
        let pnl = proceeds - Decimal::from(qty) * pos.entry_price;
        self.account.balance += proceeds;
        Ok(self.log(at, symbol, Side::Sell, qty, fill, pnl))
    }

    /// Which exit (if any) fires for `symbol` now. EOD beats SL, SL beats TP.
    /// A position opened on an earlier day is past its cutoff whatever the
    /// time. Without a live mark only the EOD exit can fire, at the entry price.
    pub fn exit_trigger(&self, symbol: &str, now: NaiveDateTime, eod_cutoff: NaiveTime, mark: Option<Decimal>) -> Option<ExitTrigger> {
        let pos = self.account.positions.get(symbol)?;
        if now.time() >= eod_cutoff || now.date() > pos.opened_at.date() {
            return Some(ExitTrigger { reason: ExitReason::EndOfDay, price: mark.unwrap_or(pos.entry_price) });
        }
        let px = mark?;
        if px <= pos.stop_loss {
            Some(ExitTrigger { reason: ExitReason::StopLoss, price: px })
        } else if px >= pos.take_profit {
            Some(ExitTrigger { reason: ExitReason::TakeProfit, price: px })
        } else {
            None
        }
    }

    /// Run the exit rules once over every open position, selling full size
    /// where a trigger fires. `marks` holds whatever live prices were fetched.
    pub fn enforce_exits(
        &mut self,
        now: NaiveDateTime,
        eod_cutoff: NaiveTime,
        marks: &HashMap<Symbol, Decimal>,
    ) -> Vec<(TradeRecord, ExitReason)> {
        let mut fills = Vec::new();
        for symbol in self.open_symbols() {
            let Some(trig) = self.exit_trigger(&symbol, now, eod_cutoff, marks.get(&symbol).copied()) else {
                continue;
            };
            let qty = self.account.positions.get(&symbol).map(|p| p.quantity).unwrap_or(0);
            if let Ok(rec) = self.sell(&symbol, qty, trig.price, now) {
                fills.push((rec, trig.reason));
            }
        }
        fills
    }

    pub fn summary(&self) -> AccountSummary {
        let mut positions: Vec<Position> = self.account.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        AccountSummary {
            initial_balance: self.account.initial_balance,
            balance: self.account.balance,
            total_realized_pnl: self.total_realized_pnl(),
            trades: self.account.trade_log.len(),
            positions,
        }
    }

    fn log(&mut self, at: NaiveDateTime, symbol: &str, side: Side, qty: u64, fill: Decimal, pnl: Decimal) -> TradeRecord {
        let rec = TradeRecord {
            id: self.next_id,
            ts: at,
            symbol: symbol.to_string(),
            side,
            quantity: qty,
            fill_price: fill,
            realized_pnl: pnl,
        };
        self.next_id += 1;
        self.account.trade_log.push(rec.clone());
        rec
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountSummary {
    pub initial_balance: Decimal,
    pub balance: Decimal,
    pub total_realized_pnl: Decimal,
    pub trades: usize,
    pub positions: Vec<Position>,
}

impl fmt::Display for AccountSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "balance={:.2} realized_pnl={:.2} trades={} open={}",
            self.balance,
            self.total_realized_pnl,
            self.trades,
            self.positions.len()
        )?;
        for p in &self.positions {
            write!(
                f,
                " | {} qty={} @ {:.2} sl={:.2} tp={:.2}",
                p.symbol, p.quantity, p.entry_price, p.stop_loss, p.take_profit
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 6).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    fn cutoff() -> NaiveTime {
        NaiveTime::from_hms_opt(15, 15, 0).unwrap()
    }

    fn req(symbol: &str, qty: u64, price: Decimal) -> ExecutionRequest {
        ExecutionRequest {
            symbol: symbol.into(),
            underlying: symbol.into(),
            side: Side::Buy,
            quantity: qty,
            price,
            stop_loss: price * dec!(0.98),
            take_profit: price * dec!(1.04),
        }
    }

    fn frictionless(max_open: usize) -> LedgerConfig {
        LedgerConfig { buy_slippage: Decimal::ZERO, sell_slippage: Decimal::ZERO, max_open_positions: max_open }
    }

    #[test]
    fn round_trip_without_slippage_is_flat() {
        let mut l = PositionLedger::new(dec!(10000), frictionless(1));
        let b = l.buy(&req("A", 10, dec!(100)), at(10, 0)).unwrap();
        assert_eq!(b.realized_pnl, Decimal::ZERO);
        assert_eq!(l.balance(), dec!(9000));
        let s = l.sell("A", 10, dec!(100), at(10, 5)).unwrap();
        assert_eq!(s.realized_pnl, Decimal::ZERO);
        assert_eq!(l.balance(), dec!(10000));
        assert!(l.is_flat("A"));
        assert_eq!(l.trade_log().iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn round_trip_with_slippage_costs_both_legs() {
        let mut l = PositionLedger::new(dec!(10000), LedgerConfig::default());
        l.buy(&req("A", 10, dec!(100)), at(10, 0)).unwrap();
        assert_eq!(l.position("A").unwrap().entry_price, dec!(100.05));
        let s = l.sell("A", 10, dec!(100), at(10, 5)).unwrap();
        // proceeds 999.5, cost 1000.5
        assert_eq!(s.realized_pnl, dec!(-1.0));
        assert_eq!(l.balance(), dec!(9999.0));
        assert_eq!(l.total_realized_pnl(), dec!(-1.0));
    }

    #[test]
    fn buy_never_drives_balance_negative() {
        let mut l = PositionLedger::new(dec!(1000), frictionless(1));
        let err = l.buy(&req("A", 11, dec!(100)), at(10, 0)).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(l.balance(), dec!(1000));
        assert!(l.trade_log().is_empty());
        l.buy(&req("A", 10, dec!(100)), at(10, 0)).unwrap();
        assert_eq!(l.balance(), Decimal::ZERO);
    }

    #[test]
    fn second_buy_same_symbol_is_rejected() {
        let mut l = PositionLedger::new(dec!(10000), frictionless(5));
        l.buy(&req("A", 1, dec!(100)), at(10, 0)).unwrap();
        let before = l.account().clone();
        assert_eq!(l.buy(&req("A", 1, dec!(100)), at(10, 1)).unwrap_err(), LedgerError::AlreadyOpen("A".into()));
        assert_eq!(l.account(), &before);
    }

    #[test]
    fn cap_refuses_entries_once_reached() {
        let mut l = PositionLedger::new(dec!(10000), frictionless(2));
        l.buy(&req("A", 1, dec!(100)), at(10, 0)).unwrap();
        l.buy(&req("B", 1, dec!(100)), at(10, 0)).unwrap();
        assert_eq!(l.buy(&req("C", 1, dec!(100)), at(10, 0)).unwrap_err(), LedgerError::MaxOpenPositions(2));
        l.sell("A", 1, dec!(100), at(10, 1)).unwrap();
        assert!(l.buy(&req("C", 1, dec!(100)), at(10, 2)).is_ok());
    }

    #[test]
    fn oversell_and_partial_sell_are_rejected() {
        let mut l = PositionLedger::new(dec!(10000), frictionless(1));
        assert!(matches!(l.sell("A", 1, dec!(100), at(10, 0)), Err(LedgerError::InsufficientPosition { held: 0, .. })));
        l.buy(&req("A", 10, dec!(100)), at(10, 0)).unwrap();
        assert!(matches!(l.sell("A", 11, dec!(100), at(10, 1)), Err(LedgerError::InsufficientPosition { held: 10, .. })));
        assert!(matches!(l.sell("A", 4, dec!(100), at(10, 1)), Err(LedgerError::PartialExit { .. })));
        assert_eq!(l.position("A").unwrap().quantity, 10);
        assert_eq!(l.balance(), dec!(9000));
    }

    #[test]
    fn stop_loss_checked_before_take_profit() {
        let mut l = PositionLedger::new(dec!(10000), frictionless(1));
        l.buy(&req("A", 10, dec!(100)), at(10, 0)).unwrap();
        assert_eq!(l.exit_trigger("A", at(11, 0), cutoff(), Some(dec!(99))), None);
        assert_eq!(
            l.exit_trigger("A", at(11, 0), cutoff(), Some(dec!(97))).map(|t| t.reason),
            Some(ExitReason::StopLoss)
        );
        assert_eq!(
            l.exit_trigger("A", at(11, 0), cutoff(), Some(dec!(105))).map(|t| t.reason),
            Some(ExitReason::TakeProfit)
        );
        // no mark, before cutoff: nothing to act on
        assert_eq!(l.exit_trigger("A", at(11, 0), cutoff(), None), None);
    }

    #[test]
    fn eod_preempts_everything() {
        let mut l = PositionLedger::new(dec!(10000), frictionless(1));
        l.buy(&req("A", 10, dec!(100)), at(10, 0)).unwrap();
        let t = l.exit_trigger("A", at(15, 15), cutoff(), Some(dec!(50))).unwrap();
        assert_eq!(t, ExitTrigger { reason: ExitReason::EndOfDay, price: dec!(50) });
        let t = l.exit_trigger("A", at(15, 20), cutoff(), None).unwrap();
        assert_eq!(t, ExitTrigger { reason: ExitReason::EndOfDay, price: dec!(100) });
    }

    #[test]
    fn overnight_position_is_flattened_next_morning() {
        let mut l = PositionLedger::new(dec!(10000), frictionless(1));
        l.buy(&req("A", 10, dec!(100)), at(15, 0)).unwrap();
        let next_morning = at(9, 20) + chrono::Duration::days(1);
        let t = l.exit_trigger("A", next_morning, cutoff(), Some(dec!(101))).unwrap();
        assert_eq!(t, ExitTrigger { reason: ExitReason::EndOfDay, price: dec!(101) });
        let fills = l.enforce_exits(next_morning, cutoff(), &HashMap::new());
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].1, ExitReason::EndOfDay);
        assert!(l.is_flat("A"));
    }

    #[test]
    fn sell_side_request_does_not_open_a_long() {
        let mut l = PositionLedger::new(dec!(10000), frictionless(1));
        let mut r = req("A", 10, dec!(100));
        r.side = Side::Sell;
        assert_eq!(l.buy(&r, at(10, 0)).unwrap_err(), LedgerError::UnsupportedSide(Side::Sell));
        assert!(l.is_flat("A"));
        assert_eq!(l.balance(), dec!(10000));
        assert!(l.trade_log().is_empty());
    }

    #[test]
    fn one_position_per_underlying() {
        let mut l = PositionLedger::new(dec!(10000), frictionless(3));
        let mut call = req("NIFTY25MAR0622500CE", 10, dec!(100));
        call.underlying = "IDX".into();
        l.buy(&call, at(10, 0)).unwrap();
        assert!(l.holds_underlying("IDX"));
        let mut next_strike = req("NIFTY25MAR0622600CE", 10, dec!(100));
        next_strike.underlying = "IDX".into();
        assert_eq!(l.buy(&next_strike, at(10, 5)).unwrap_err(), LedgerError::AlreadyOpen("IDX".into()));
        assert_eq!(l.open_count(), 1);
        l.sell("NIFTY25MAR0622500CE", 10, dec!(100), at(10, 10)).unwrap();
        assert!(!l.holds_underlying("IDX"));
        assert!(l.buy(&next_strike, at(10, 15)).is_ok());
    }

    #[test]
    fn enforce_exits_closes_each_position_once() {
        let mut l = PositionLedger::new(dec!(10000), frictionless(3));
        l.buy(&req("A", 10, dec!(100)), at(10, 0)).unwrap();
        l.buy(&req("B", 10, dec!(100)), at(10, 0)).unwrap();
        l.buy(&req("C", 10, dec!(100)), at(10, 0)).unwrap();
        let mut marks = HashMap::new();
        marks.insert("A".to_string(), dec!(90));
        marks.insert("B".to_string(), dec!(101));
        // C has no mark
        let fills = l.enforce_exits(at(12, 0), cutoff(), &marks);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].0.symbol, "A");
        assert_eq!(fills[0].0.realized_pnl, dec!(-100));
        assert_eq!(l.open_symbols(), vec!["B".to_string(), "C".to_string()]);

        let fills = l.enforce_exits(at(15, 16), cutoff(), &marks);
        assert_eq!(fills.iter().map(|(_, r)| *r).collect::<Vec<_>>(), vec![ExitReason::EndOfDay; 2]);
        assert_eq!(l.open_count(), 0);
        assert_eq!(l.balance(), dec!(9910));
    }

    #[test]
    fn summary_reports_ledger_state() {
        let mut l = PositionLedger::new(dec!(10000), frictionless(2));
        l.buy(&req("B", 2, dec!(50)), at(10, 0)).unwrap();
        l.buy(&req("A", 1, dec!(100)), at(10, 0)).unwrap();
        let s = l.summary();
        assert_eq!(s.balance, dec!(9800));
        assert_eq!(s.trades, 2);
        assert_eq!(s.positions.iter().map(|p| p.symbol.as_str()).collect::<Vec<_>>(), vec!["A", "B"]);
        let text = s.to_string();
        assert!(text.contains("open=2"), "{text}");
    }
}
