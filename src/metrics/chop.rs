//! Chop: wasted incremental motion as a fraction of total motion.

use crate::types::{clamp, Candle};

/// `inc = sum((close-open)/open)`, `waste = max(0, inc - netChange)`,
/// `chop = waste / (waste + |netChange|)`, clamped. `0` when both are ~0.
pub fn chop(window: &[Candle], net_change: f64) -> f64 {
    let inc: f64 = window
        .iter()
        .filter(|c| c.open > 0.0)
        .map(|c| (c.close - c.open) / c.open)
        .sum();

    let waste = (inc - net_change).max(0.0);
    let denom = waste + net_change.abs();

    if denom <= 1e-12 {
        return 0.0;
    }

    clamp(waste / denom, 0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume: 1.0,
            quote_volume: 1.0,
            taker_buy_quote_volume: 0.5,
        }
    }

    #[test]
    fn zero_on_pure_trend() {
        let window: Vec<Candle> = (0..60).map(|_| candle(100.0, 100.1)).collect();
        let net_change = 0.06f64; // approx, matches trend direction
        assert!(chop(&window, net_change) < 1e-6);
    }

    #[test]
    fn zero_when_no_motion() {
        let window = vec![candle(100.0, 100.0), candle(100.0, 100.0)];
        assert_eq!(chop(&window, 0.0), 0.0);
    }

    #[test]
    fn positive_when_incremental_motion_exceeds_net() {
        // Up then down: incremental motion is large, net change small.
        let window = vec![candle(100.0, 105.0), candle(105.0, 100.2)];
        let net_change = (100.2 - 100.0) / 100.0;
        let c = chop(&window, net_change);
        assert!(c > 0.5);
    }
}
