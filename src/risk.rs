// ===============================
// src/risk.rs
// ===============================
//
// Fixed-fractional position sizing:
//   budget   = balance * risk% / 100
//   per_unit = |entry - stop|
//   qty      = floor(budget / per_unit)
// capped_risk = qty * per_unit never exceeds budget.
//
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::Direction;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RiskError {
    #[error("entry {entry} is on the wrong side of stop {stop} for a {side} trade")]
    InvalidStopPlacement { entry: Decimal, stop: Decimal, side: &'static str },
    #[error("risk per unit is zero or negative")]
    ZeroRisk,
    #[error("risk budget {budget} cannot cover one unit at {per_unit} risk per unit")]
    SizeTooSmall { budget: Decimal, per_unit: Decimal },
}

impl RiskError {
    pub fn label(&self) -> &'static str {
        match self {
            RiskError::InvalidStopPlacement { .. } => "invalid_stop_placement",
            RiskError::ZeroRisk => "zero_risk",
            RiskError::SizeTooSmall { .. } => "size_too_small",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedTrade {
    pub quantity: u64,
    pub risk_budget: Decimal,
    pub capped_risk: Decimal,
    pub entry_price: Decimal,
    pub stop_loss_price: Decimal,
}

/// Size a long entry (stop below entry).
pub fn size(
    balance: Decimal,
    risk_pct: Decimal,
    entry: Decimal,
    stop: Decimal,
) -> Result<SizedTrade, RiskError> {
    size_for(Direction::Long, balance, risk_pct, entry, stop)
}

/// Size either side: a long needs entry > stop, a short needs entry < stop.
pub fn size_for(
    direction: Direction,
    balance: Decimal,
    risk_pct: Decimal,
    entry: Decimal,
    stop: Decimal,
) -> Result<SizedTrade, RiskError> {
    let per_unit = match direction {
        Direction::Long => {
            if entry <= stop {
                return Err(RiskError::InvalidStopPlacement { entry, stop, side: "long" });
            }
            entry - stop
        }
        Direction::Short => {
            if entry >= stop {
                return Err(RiskError::InvalidStopPlacement { entry, stop, side: "short" });
            }
            stop - entry
        }
        Direction::None => return Err(RiskError::ZeroRisk),
    };
    if per_unit <= Decimal::ZERO {
        return Err(RiskError::ZeroRisk);
    }

    let budget = balance * risk_pct / Decimal::ONE_HUNDRED;
    let qty = (budget / per_unit).floor().to_u64().unwrap_or(0);
    if qty == 0 {
        return Err(RiskError::SizeTooSmall { budget, per_unit });
    }

    Ok(SizedTrade {
        quantity: qty,
        risk_budget: budget,
        capped_risk: Decimal::from(qty) * per_unit,
        entry_price: entry,
        stop_loss_price: stop,
    })
}

/// Shrink a sized trade to what the cash balance can pay for at
/// `price * (1 + slippage)`. Risk only goes down; SizeTooSmall when not even
/// one unit is affordable.
pub fn cap_to_balance(t: SizedTrade, balance: Decimal, slippage: Decimal) -> Result<SizedTrade, RiskError> {
    let unit_cost = t.entry_price * (Decimal::ONE + slippage);
    if unit_cost <= Decimal::ZERO {
        return Err(RiskError::ZeroRisk);
    }
    let affordable = (balance / unit_cost).floor().to_u64().unwrap_or(0);
    if affordable >= t.quantity {
        return Ok(t);
    }
    if affordable == 0 {
        return Err(RiskError::SizeTooSmall { budget: balance, per_unit: unit_cost });
    }
    let per_unit = (t.entry_price - t.stop_loss_price).abs();
    Ok(SizedTrade { quantity: affordable, capped_risk: Decimal::from(affordable) * per_unit, ..t })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn one_percent_of_forty_thousand() {
        let t = size(dec!(40000), dec!(1), dec!(100), dec!(80)).unwrap();
        assert_eq!(t.risk_budget, dec!(400));
        assert_eq!(t.quantity, 20);
        assert_eq!(t.capped_risk, dec!(400));
    }

    #[test]
    fn tight_stop_buys_more_units() {
        let t = size(dec!(40000), dec!(1), dec!(100), dec!(98)).unwrap();
        assert_eq!(t.quantity, 200);
        assert_eq!(t.capped_risk, dec!(400));
    }

    #[test]
    fn wide_stop_on_small_budget_is_too_small() {
        // 400 budget, 450 risk per unit
        let err = size(dec!(40000), dec!(1), dec!(500), dec!(50)).unwrap_err();
        assert_eq!(err, RiskError::SizeTooSmall { budget: dec!(400), per_unit: dec!(450) });
    }

    #[test]
    fn stop_above_entry_is_rejected() {
        let err = size(dec!(40000), dec!(1), dec!(100), dec!(105)).unwrap_err();
        assert!(matches!(err, RiskError::InvalidStopPlacement { .. }));
        assert_eq!(err.label(), "invalid_stop_placement");
    }

    #[test]
    fn stop_equal_to_entry_is_rejected() {
        let err = size(dec!(40000), dec!(1), dec!(100), dec!(100)).unwrap_err();
        assert!(matches!(err, RiskError::InvalidStopPlacement { .. }));
    }

    #[test]
    fn short_mirrors_long() {
        let t = size_for(Direction::Short, dec!(40000), dec!(1), dec!(80), dec!(100)).unwrap();
        assert_eq!(t.quantity, 20);
        let err = size_for(Direction::Short, dec!(40000), dec!(1), dec!(100), dec!(80)).unwrap_err();
        assert!(matches!(err, RiskError::InvalidStopPlacement { side: "short", .. }));
    }

    #[test]
    fn capped_risk_never_exceeds_budget() {
        let stops = [dec!(99.99), dec!(97.3), dec!(63.1), dec!(12.5), dec!(0.01)];
        for balance in [dec!(1234.56), dec!(40000), dec!(987654.3)] {
            for pct in [dec!(0.5), dec!(1), dec!(2.25)] {
                for stop in stops {
                    if let Ok(t) = size(balance, pct, dec!(100), stop) {
                        assert!(t.capped_risk <= t.risk_budget, "{balance} {pct} {stop}");
                        assert!(t.quantity > 0);
                    }
                }
            }
        }
    }

    #[test]
    fn tight_stop_is_capped_by_cash() {
        // 0.5% stop on 1% risk wants 2x the balance
        let t = size(dec!(10000), dec!(1), dec!(100), dec!(99.5)).unwrap();
        assert_eq!(t.quantity, 200);
        let c = cap_to_balance(t.clone(), dec!(10000), dec!(0.0005)).unwrap();
        assert_eq!(c.quantity, 99);
        assert!(c.capped_risk < t.capped_risk);
        assert_eq!(cap_to_balance(t.clone(), dec!(1000000), dec!(0)).unwrap(), t);
        assert!(matches!(cap_to_balance(t, dec!(50), dec!(0)), Err(RiskError::SizeTooSmall { .. })));
    }
}
