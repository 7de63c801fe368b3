// ===============================
// src/confluence.rs
// ===============================
//
// Rule gate: SignalVector -> Long / Short / None.
//
// Rules are evaluated in a fixed order: the bullish conjunction first, then
// the bearish mirror, otherwise stand down. Every enabled gate must pass on
// its own. A gate whose input is unknown (sentiment oracle down, ML model
// unavailable) blocks both directions.
//
// Which gates are enabled is configuration: each named StrategyProfile maps
// to one ConfluenceRules value, so historical rule sets live side by side
// instead of overwriting one another.
//

use serde::{Deserialize, Serialize};

use crate::domain::{Direction, EntrySignal, MlPrediction, Regime, SignalVector};

/// How the sentiment and ML gates combine when both are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OracleCombine {
    /// both must agree with the direction
    All,
    /// either may confirm the direction
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfluenceRules {
    pub regime: bool,
    pub sector_regime: bool,
    pub breakout: bool,
    pub trend_strength: bool,
    pub sentiment: bool,
    pub ml: bool,
    pub oracle_combine: OracleCombine,
    pub imbalance: bool,
    /// long needs score >= threshold, short needs score <= -threshold
    pub sentiment_threshold: f64,
    pub imbalance_threshold: f64,
}

impl ConfluenceRules {
    /// Nothing enabled; callers switch on what they need.
    pub fn none() -> Self {
        Self {
            regime: false,
            sector_regime: false,
            breakout: false,
            trend_strength: false,
            sentiment: false,
            ml: false,
            oracle_combine: OracleCombine::All,
            imbalance: false,
            sentiment_threshold: 0.0,
            imbalance_threshold: crate::orderflow::DEFAULT_THRESHOLD,
        }
    }

    /// True when no gate is enabled. Such a rule set never trades.
    pub fn is_empty(&self) -> bool {
        !(self.regime
            || self.sector_regime
            || self.breakout
            || self.trend_strength
            || self.sentiment
            || self.ml
            || self.imbalance)
    }

    pub fn needs_candles(&self) -> bool {
        self.regime || self.breakout || self.trend_strength || self.ml
    }
}

/// Named rule sets. The suffix carries the version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyProfile {
    ConfluenceBreakoutV1,
    ConfluenceBreakoutV2,
    ConfluenceBreakoutV2Ml,
    OrderFlowImbalance,
    EquitySurge,
}

impl StrategyProfile {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "confluence_breakout_v1" | "cb_v1" | "v1" => Some(Self::ConfluenceBreakoutV1),
            "confluence_breakout_v2" | "cb_v2" | "v2" => Some(Self::ConfluenceBreakoutV2),
            "confluence_breakout_v2_ml" | "cb_v2_ml" | "v2_ml" => Some(Self::ConfluenceBreakoutV2Ml),
            "orderflow_imbalance" | "orderflow" | "ofi" => Some(Self::OrderFlowImbalance),
            "equity_surge" | "surge" => Some(Self::EquitySurge),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ConfluenceBreakoutV1 => "confluence_breakout_v1",
            Self::ConfluenceBreakoutV2 => "confluence_breakout_v2",
            Self::ConfluenceBreakoutV2Ml => "confluence_breakout_v2_ml",
            Self::OrderFlowImbalance => "orderflow_imbalance",
            Self::EquitySurge => "equity_surge",
        }
    }

    pub fn rules(&self) -> ConfluenceRules {
        let base = ConfluenceRules::none();
        match self {
            Self::ConfluenceBreakoutV1 => ConfluenceRules {
                regime: true,
                breakout: true,
                trend_strength: true,
                sentiment: true,
                sentiment_threshold: 0.5,
                ..base
            },
            Self::ConfluenceBreakoutV2 => ConfluenceRules {
                regime: true,
                sector_regime: true,
                breakout: true,
                sentiment: true,
                sentiment_threshold: 0.005,
                ..base
            },
            Self::ConfluenceBreakoutV2Ml => ConfluenceRules {
                regime: true,
                sector_regime: true,
                breakout: true,
                trend_strength: true,
                sentiment: true,
                ml: true,
                oracle_combine: OracleCombine::Any,
                sentiment_threshold: 0.005,
                ..base
            },
            Self::OrderFlowImbalance => ConfluenceRules { imbalance: true, ..base },
            Self::EquitySurge => ConfluenceRules {
                sector_regime: true,
                sentiment: true,
                // Bullish outlook at any confidence
                sentiment_threshold: f64::MIN_POSITIVE,
                ..base
            },
        }
    }

    /// (stop-loss %, take-profit %) off the entry price.
    pub fn exit_levels(&self) -> (f64, f64) {
        match self {
            // option premium: wide brackets
            Self::ConfluenceBreakoutV1 | Self::ConfluenceBreakoutV2 | Self::ConfluenceBreakoutV2Ml => (20.0, 40.0),
            Self::OrderFlowImbalance => (0.5, 1.0),
            Self::EquitySurge => (2.0, 4.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfluenceEngine {
    rules: ConfluenceRules,
}

impl ConfluenceEngine {
    pub fn new(rules: ConfluenceRules) -> Self {
        Self { rules }
    }

    pub fn for_profile(profile: StrategyProfile) -> Self {
        Self::new(profile.rules())
    }

    pub fn rules(&self) -> &ConfluenceRules {
        &self.rules
    }

    pub fn evaluate(&self, v: &SignalVector) -> Direction {
        if self.rules.is_empty() || self.has_unknown_gate(v) {
            return Direction::None;
        }
        if self.passes(v, Direction::Long) {
            Direction::Long
        } else if self.passes(v, Direction::Short) {
            Direction::Short
        } else {
            Direction::None
        }
    }

    fn has_unknown_gate(&self, v: &SignalVector) -> bool {
        (self.rules.sentiment && v.sentiment_score.map_or(true, |s| !s.is_finite()))
            || (self.rules.ml && v.ml_prediction == MlPrediction::Unknown)
            || (self.rules.imbalance && !v.imbalance_ratio.is_finite())
    }

    fn passes(&self, v: &SignalVector, dir: Direction) -> bool {
        let r = &self.rules;
        let (regime, breakout, ml, sign) = match dir {
            Direction::Long => (Regime::Bullish, EntrySignal::BullishBreakout, MlPrediction::Up, 1.0),
            Direction::Short => (Regime::Bearish, EntrySignal::BearishBreakout, MlPrediction::Down, -1.0),
            Direction::None => return false,
        };

        if r.regime && v.regime != regime {
            return false;
        }
        if r.sector_regime && v.sector_regime != regime {
            return false;
        }
        if r.breakout && v.entry_signal != breakout {
            return false;
        }
        if r.trend_strength && !v.trend_strong {
            return false;
        }
        if r.imbalance && sign * v.imbalance_ratio <= r.imbalance_threshold {
            return false;
        }

        let sentiment_ok = v
            .sentiment_score
            .map(|s| sign * s >= r.sentiment_threshold)
            .unwrap_or(false);
        let ml_ok = v.ml_prediction == ml;
        match (r.sentiment, r.ml) {
            (false, false) => true,
            (true, false) => sentiment_ok,
            (false, true) => ml_ok,
            (true, true) => match r.oracle_combine {
                OracleCombine::All => sentiment_ok && ml_ok,
                OracleCombine::Any => sentiment_ok || ml_ok,
            },
        }
    }
}
