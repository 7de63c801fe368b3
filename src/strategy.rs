// ===============================
// src/strategy.rs
// ===============================
//
// Technical inputs for the confluence gate:
// 1) Regime (higher timeframe, 45m)
//    close > EMA(50) -> Bullish, otherwise Bearish. No candles -> Neutral.
// 2) Breakout (entry timeframe, 5m)
//    last close above the previous bar's high -> BullishBreakout,
//    below the previous bar's low -> BearishBreakout.
// 3) Trend strength
//    Wilder ADX(14) on the same 5m bars; strong when > 20.
//
// Breakout and ADX need more than 14 bars; with fewer we report no signal
// and a weak trend.
//
// EMAs here follow the "adjust=false" recursion: seeded with the first
// value, then e = a*x + (1-a)*e_prev.
//

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{Candle, EntrySignal, Regime};

pub const REGIME_EMA_SPAN: usize = 50;
pub const ADX_PERIOD: usize = 14;
pub const ADX_STRONG: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TechnicalSnapshot {
    pub regime: Regime,
    pub entry_signal: EntrySignal,
    pub trend_strong: bool,
    pub adx: Option<f64>,
    pub latest_price: f64,
}

/// Feature row handed to the ML oracle. Named columns so a remote model can
/// align them to its training order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub close: f64,
    pub ema_10: f64,
    pub ema_21: f64,
    pub ema_50: f64,
    pub adx_14: f64,
    pub return_1h: f64,
    pub return_1d: f64,
}

fn f(d: rust_decimal::Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

fn closes(c: &[Candle]) -> Vec<f64> {
    c.iter().map(|x| f(x.close)).collect()
}

pub fn ema_series(values: &[f64], alpha: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<f64> = None;
    for &v in values {
        let e = match prev {
            None => v,
            Some(p) => alpha * v + (1.0 - alpha) * p,
        };
        out.push(e);
        prev = Some(e);
    }
    out
}

pub fn ema_last(values: &[f64], span: usize) -> Option<f64> {
    let alpha = 2.0 / (span as f64 + 1.0);
    ema_series(values, alpha).last().copied()
}

pub fn regime(higher_tf: &[Candle]) -> Regime {
    let cl = closes(higher_tf);
    match (cl.last(), ema_last(&cl, REGIME_EMA_SPAN)) {
        (Some(&last), Some(ema)) => {
            if last > ema { Regime::Bullish } else { Regime::Bearish }
        }
        _ => Regime::Neutral,
    }
}

pub fn breakout(bars: &[Candle]) -> EntrySignal {
    if bars.len() <= ADX_PERIOD {
        return EntrySignal::None;
    }
    let last = &bars[bars.len() - 1];
    let prev = &bars[bars.len() - 2];
    if last.close > prev.high {
        EntrySignal::BullishBreakout
    } else if last.close < prev.low {
        EntrySignal::BearishBreakout
    } else {
        EntrySignal::None
    }
}

/// Wilder ADX. Directional movement is zeroed when negative or not the
/// larger of the two legs.
pub fn adx(bars: &[Candle], period: usize) -> Option<f64> {
    if bars.len() <= period {
        return None;
    }
    let alpha = 1.0 / period as f64;
    let n = bars.len() - 1;
    let mut plus = Vec::with_capacity(n);
    let mut minus = Vec::with_capacity(n);
    let mut tr = Vec::with_capacity(n);

    for w in bars.windows(2) {
        let (p, c) = (&w[0], &w[1]);
        let (h, l, pc) = (f(c.high), f(c.low), f(p.close));
        let mut up = h - f(p.high);
        let mut down = f(p.low) - l;
        if up < 0.0 || up <= down {
            up = 0.0;
        }
        if down < 0.0 || down <= up {
            down = 0.0;
        }
        plus.push(up);
        minus.push(down);
        tr.push((h - l).max((h - pc).abs()).max((l - pc).abs()));
    }

    let atr = ema_series(&tr, alpha);
    let pdm = ema_series(&plus, alpha);
    let mdm = ema_series(&minus, alpha);
    let dx: Vec<f64> = (0..n)
        .map(|i| {
            if atr[i] <= 0.0 {
                return 0.0;
            }
            let pdi = 100.0 * pdm[i] / atr[i];
            let mdi = 100.0 * mdm[i] / atr[i];
            let sum = pdi + mdi;
            if sum <= 0.0 { 0.0 } else { 100.0 * (pdi - mdi).abs() / sum }
        })
        .collect();
    ema_series(&dx, alpha).last().copied()
}

pub fn analyze(entry_tf: &[Candle], higher_tf: &[Candle]) -> TechnicalSnapshot {
    let regime = regime(higher_tf);
    if higher_tf.is_empty() {
        warn!("no higher-timeframe candles, regime neutral");
    }
    if entry_tf.len() <= ADX_PERIOD {
        warn!(bars = entry_tf.len(), "not enough entry-timeframe bars for breakout/ADX");
        return TechnicalSnapshot {
            regime,
            entry_signal: EntrySignal::None,
            trend_strong: false,
            adx: None,
            latest_price: entry_tf.last().map(|c| f(c.close)).unwrap_or(0.0),
        };
    }
    let adx = adx(entry_tf, ADX_PERIOD);
    TechnicalSnapshot {
        regime,
        entry_signal: breakout(entry_tf),
        trend_strong: adx.map(|a| a > ADX_STRONG).unwrap_or(false),
        adx,
        latest_price: entry_tf.last().map(|c| f(c.close)).unwrap_or(0.0),
    }
}

fn pct_change(cl: &[f64], periods: usize) -> f64 {
    if cl.len() <= periods {
        return 0.0;
    }
    let then = cl[cl.len() - 1 - periods];
    if then == 0.0 { 0.0 } else { cl[cl.len() - 1] / then - 1.0 }
}

/// 12 x 5m = 1h, 75 x 5m = one session.
pub fn feature_row(entry_tf: &[Candle]) -> Option<FeatureRow> {
    let cl = closes(entry_tf);
    let close = *cl.last()?;
    Some(FeatureRow {
        close,
        ema_10: ema_last(&cl, 10)?,
        ema_21: ema_last(&cl, 21)?,
        ema_50: ema_last(&cl, 50)?,
        adx_14: adx(entry_tf, ADX_PERIOD)?,
        return_1h: pct_change(&cl, 12),
        return_1d: pct_change(&cl, 75),
    })
}
