//! Plain-mean ATR over a fixed window -- distinct from Wilder's smoothed ATR.
//!
//! The engine's window is single-shot (exactly the candles in one metric
//! window, no warm-up period carried from before it), so the mean of true
//! ranges is used directly rather than Wilder's recursive smoothing, which
//! needs history the window doesn't provide.

use crate::types::Candle;

/// True range for one candle against the previous candle's close. The first
/// candle in a series has no previous close, so callers pass `None` and get
/// back `high - low`.
fn true_range(candle: &Candle, prev_close: Option<f64>) -> f64 {
    let hl = candle.high - candle.low;
    match prev_close {
        Some(pc) => hl.max((candle.high - pc).abs()).max((candle.low - pc).abs()),
        None => hl,
    }
}

/// Mean true range over `window`, using `seed_prev_close` as the close just
/// before `window[0]` (if available) so the first bar's true range accounts
/// for a gap. Returns `None` on an empty window.
pub fn window_atr(window: &[Candle], seed_prev_close: Option<f64>) -> Option<f64> {
    if window.is_empty() {
        return None;
    }

    let mut prev_close = seed_prev_close;
    let mut sum = 0.0;
    for c in window {
        sum += true_range(c, prev_close);
        prev_close = Some(c.close);
    }

    Some(sum / window.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
            quote_volume: 1.0,
            taker_buy_quote_volume: 0.5,
        }
    }

    #[test]
    fn none_on_empty_window() {
        assert_eq!(window_atr(&[], None), None);
    }

    #[test]
    fn uses_high_low_range_without_seed() {
        let window = vec![candle(101.0, 99.0, 100.0)];
        assert_eq!(window_atr(&window, None), Some(2.0));
    }

    #[test]
    fn accounts_for_gap_against_prev_close() {
        let window = vec![candle(101.0, 100.0, 100.5)];
        // gap up: prev close 90 makes |high-prevClose|=11 the dominant term.
        assert_eq!(window_atr(&window, Some(90.0)), Some(11.0));
    }

    #[test]
    fn averages_across_multiple_bars() {
        let window = vec![candle(101.0, 99.0, 100.0), candle(102.0, 100.0, 101.0)];
        // bar1 TR=2 (no seed). bar2 TR = max(2, |102-100|=2, |100-100|=0) = 2.
        assert_eq!(window_atr(&window, None), Some(2.0));
    }
}
