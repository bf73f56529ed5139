//! Efficiency: net log-return over gross log-return, how "directional" a move was.

use crate::types::{clamp, Candle};

/// `|sum(log(close/open))| / sum(|log(close/open)|)`, clamped to `[0,1]`.
/// `0` when the denominator is zero (no motion at all).
pub fn efficiency(window: &[Candle]) -> f64 {
    let mut net = 0.0;
    let mut gross = 0.0;

    for c in window {
        if c.open <= 0.0 || c.close <= 0.0 {
            continue;
        }
        let r = (c.close / c.open).ln();
        net += r;
        gross += r.abs();
    }

    if gross <= 0.0 {
        return 0.0;
    }

    clamp(net.abs() / gross, 0.0, 1.0)
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
    fn one_when_all_moves_same_sign() {
        let window: Vec<Candle> = (0..10).map(|_| candle(100.0, 100.1)).collect();
        assert!((efficiency(&window) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_when_moves_perfectly_cancel() {
        let window = vec![candle(100.0, 101.0), candle(101.0, 100.0)];
        assert!(efficiency(&window) < 1e-9);
    }

    #[test]
    fn zero_on_empty_window() {
        assert_eq!(efficiency(&[]), 0.0);
    }
}
