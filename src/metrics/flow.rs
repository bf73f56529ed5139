//! Order-flow imbalance: per-minute taker-buy ratio, its aggregate label,
//! a smoothed "immediate" reading, and a persistence score correlating flow
//! direction with price direction across the window.

use crate::types::{clamp, Candle};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlowLabel {
    BuyStrong,
    SellStrong,
    Balanced,
}

impl FlowLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowLabel::BuyStrong => "buy-strong",
            FlowLabel::SellStrong => "sell-strong",
            FlowLabel::Balanced => "balanced",
        }
    }
}

/// Per-minute taker-buy ratio, `0.5` when `quoteVolume <= 0`.
fn minute_flow(c: &Candle) -> f64 {
    if c.quote_volume > 0.0 {
        clamp(c.taker_buy_quote_volume / c.quote_volume, 0.0, 1.0)
    } else {
        0.5
    }
}

/// Window-aggregate `sum(taker) / sum(quote)`, `None` when total quote
/// volume is non-positive.
pub fn flow_ratio(window: &[Candle]) -> Option<f64> {
    let sum_taker: f64 = window.iter().map(|c| c.taker_buy_quote_volume).sum();
    let sum_quote: f64 = window.iter().map(|c| c.quote_volume).sum();
    if sum_quote > 0.0 {
        Some(sum_taker / sum_quote)
    } else {
        None
    }
}

pub fn flow_label(ratio: f64) -> FlowLabel {
    if ratio >= 0.62 {
        FlowLabel::BuyStrong
    } else if ratio <= 0.38 {
        FlowLabel::SellStrong
    } else {
        FlowLabel::Balanced
    }
}

/// `(tanh((ratio-0.5)/0.2) + 1) / 2`; `0.5` when no ratio is available.
pub fn flow_immediate_base(ratio: Option<f64>) -> f64 {
    match ratio {
        Some(r) => (((r - 0.5) / 0.2).tanh() + 1.0) / 2.0,
        None => 0.5,
    }
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

fn std_dev(xs: &[f64], m: f64) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64;
    var.sqrt()
}

fn zscore_all(xs: &[f64]) -> Vec<f64> {
    let m = mean(xs);
    let s = std_dev(xs, m);
    if s <= 1e-12 {
        return vec![0.0; xs.len()];
    }
    xs.iter().map(|x| (x - m) / s).collect()
}

/// Correlate the minute-by-minute flow series with minute-by-minute returns,
/// combined with a directional-agreement ratio.
pub fn flow_persistence(window: &[Candle]) -> f64 {
    if window.is_empty() {
        return 0.0;
    }

    let flows: Vec<f64> = window.iter().map(|c| minute_flow(c) - 0.5).collect();
    let returns: Vec<f64> = window
        .iter()
        .map(|c| if c.open > 0.0 { (c.close - c.open) / c.open } else { 0.0 })
        .collect();

    let z_flow = zscore_all(&flows);
    let z_ret = zscore_all(&returns);

    let corr = clamp(
        z_flow
            .iter()
            .zip(z_ret.iter())
            .map(|(f, r)| f * r)
            .sum::<f64>()
            / window.len() as f64,
        -1.0,
        1.0,
    );

    let mut compared = 0usize;
    let mut agreed = 0usize;
    for (f, r) in flows.iter().zip(returns.iter()) {
        if *f == 0.0 || *r == 0.0 {
            continue;
        }
        compared += 1;
        if f.signum() == r.signum() {
            agreed += 1;
        }
    }

    let agree_ratio = if compared > 0 {
        agreed as f64 / compared as f64
    } else {
        0.0
    };

    clamp(((corr + 1.0) / 2.0) * agree_ratio, 0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(taker: f64, quote: f64, open: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume: 1.0,
            quote_volume: quote,
            taker_buy_quote_volume: taker,
        }
    }

    #[test]
    fn buy_strong_label_and_percent() {
        let window = vec![candle(700.0, 1000.0, 100.0, 101.0)];
        let ratio = flow_ratio(&window).unwrap();
        assert!((ratio - 0.7).abs() < 1e-9);
        assert_eq!(flow_label(ratio), FlowLabel::BuyStrong);
    }

    #[test]
    fn none_when_no_quote_volume() {
        let window = vec![candle(0.0, 0.0, 100.0, 101.0)];
        assert_eq!(flow_ratio(&window), None);
        assert_eq!(flow_immediate_base(None), 0.5);
    }

    #[test]
    fn immediate_base_is_half_at_neutral_ratio() {
        assert!((flow_immediate_base(Some(0.5)) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn persistence_high_when_flow_and_return_move_together() {
        let window = vec![
            candle(900.0, 1000.0, 100.0, 101.0),
            candle(100.0, 1000.0, 101.0, 100.0),
            candle(900.0, 1000.0, 100.0, 101.5),
            candle(100.0, 1000.0, 101.5, 100.5),
        ];
        let p = flow_persistence(&window);
        assert!(p > 0.5, "expected high persistence, got {p}");
    }

    #[test]
    fn persistence_zero_on_empty_window() {
        assert_eq!(flow_persistence(&[]), 0.0);
    }
}
