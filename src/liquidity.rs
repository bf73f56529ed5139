// =============================================================================
// Liquidity Probe (C6) -- spread + walk-the-book slippage -> penalty in [0,1]
// =============================================================================
//
// Best-effort: any fetch failure yields penalty 0 and the symbol is kept,
// since liquidity is a scoring adjustment, not a gate on its own.

use tracing::warn;

use crate::exchange::{DepthSnapshot, ExchangeClient};
use crate::types::clamp;

/// Quote notional walked on each side of the book to estimate slippage.
pub const SLIPPAGE_TARGET_QUOTE: f64 = 10_000.0;
/// Depth ladders less than 95% filled to the target are "insufficient".
const MIN_FILL_RATIO: f64 = 0.95;

#[derive(Debug, Clone, Copy)]
pub struct LiquidityReading {
    pub spread_bps: f64,
    pub slippage_bps: f64,
    pub penalty: f64,
}

/// Walk one side of the book consuming up to `target_quote`, returning the
/// volume-weighted average fill price and the fraction of target filled.
fn walk_book(levels: &[crate::exchange::DepthLevel], target_quote: f64) -> (f64, f64) {
    let mut remaining = target_quote;
    let mut notional_filled = 0.0;
    let mut base_filled = 0.0;

    for lvl in levels {
        if remaining <= 0.0 {
            break;
        }
        let level_notional = lvl.price * lvl.quantity;
        let take_notional = level_notional.min(remaining);
        let take_base = take_notional / lvl.price;

        notional_filled += take_notional;
        base_filled += take_base;
        remaining -= take_notional;
    }

    let fill_ratio = if target_quote > 0.0 {
        notional_filled / target_quote
    } else {
        1.0
    };

    let avg_price = if base_filled > 0.0 {
        notional_filled / base_filled
    } else {
        f64::NAN
    };

    (avg_price, fill_ratio)
}

fn compute_reading(best_bid: f64, best_ask: f64, depth: &DepthSnapshot) -> Option<LiquidityReading> {
    if best_ask <= best_bid || best_bid <= 0.0 || best_ask <= 0.0 {
        return None;
    }

    let mid = (best_bid + best_ask) / 2.0;
    let spread_bps = (best_ask - best_bid) / mid * 10_000.0;

    let (ask_avg, ask_fill) = walk_book(&depth.asks, SLIPPAGE_TARGET_QUOTE);
    let (bid_avg, bid_fill) = walk_book(&depth.bids, SLIPPAGE_TARGET_QUOTE);

    let insufficient = ask_fill < MIN_FILL_RATIO || bid_fill < MIN_FILL_RATIO;

    let penalty = if insufficient {
        clamp((spread_bps / 10.0) * 0.6 + 0.4, 0.0, 1.0)
    } else {
        let buy_slip = (ask_avg - mid) / mid * 10_000.0;
        let sell_slip = (mid - bid_avg) / mid * 10_000.0;
        let slippage_bps = buy_slip.max(sell_slip);

        let spread_term = clamp(spread_bps / 10.0, 0.0, 1.0) * 0.6;
        let slip_term = clamp(slippage_bps / 20.0, 0.0, 1.0) * 0.4;
        clamp(spread_term + slip_term, 0.0, 1.0)
    };

    let slippage_bps = if insufficient {
        f64::NAN
    } else {
        let buy_slip = (ask_avg - mid) / mid * 10_000.0;
        let sell_slip = (mid - bid_avg) / mid * 10_000.0;
        buy_slip.max(sell_slip)
    };

    Some(LiquidityReading {
        spread_bps,
        slippage_bps,
        penalty,
    })
}

/// Probe one symbol's book; `None`/any failure degrades to a zero penalty.
pub async fn probe(client: &ExchangeClient, symbol: &str) -> f64 {
    let ticker = match client.get_book_ticker(symbol).await {
        Ok(t) => t,
        Err(e) => {
            warn!(symbol, error = %e, "liquidity probe: book ticker fetch failed");
            return 0.0;
        }
    };

    let depth = match client.get_depth(symbol, 200).await {
        Ok(d) => d,
        Err(e) => {
            warn!(symbol, error = %e, "liquidity probe: depth fetch failed");
            return 0.0;
        }
    };

    match compute_reading(ticker.bid_price, ticker.ask_price, &depth) {
        Some(reading) => reading.penalty,
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::DepthLevel;

    fn depth(levels: &[(f64, f64)]) -> Vec<DepthLevel> {
        levels
            .iter()
            .map(|(p, q)| DepthLevel { price: *p, quantity: *q })
            .collect()
    }

    #[test]
    fn tight_book_yields_low_penalty() {
        let snapshot = DepthSnapshot {
            bids: depth(&[(99.99, 1000.0), (99.98, 1000.0)]),
            asks: depth(&[(100.01, 1000.0), (100.02, 1000.0)]),
        };
        let reading = compute_reading(99.99, 100.01, &snapshot).unwrap();
        assert!(reading.penalty < 0.2, "penalty={}", reading.penalty);
    }

    #[test]
    fn crossed_book_is_rejected() {
        let snapshot = DepthSnapshot { bids: depth(&[]), asks: depth(&[]) };
        assert!(compute_reading(101.0, 100.0, &snapshot).is_none());
    }

    #[test]
    fn insufficient_depth_falls_back_to_spread_only_formula() {
        let snapshot = DepthSnapshot {
            bids: depth(&[(99.99, 1.0)]),
            asks: depth(&[(100.01, 1.0)]),
        };
        let reading = compute_reading(99.99, 100.01, &snapshot).unwrap();
        let spread_bps = (100.01 - 99.99) / 100.0 * 10_000.0;
        let expected = clamp((spread_bps / 10.0) * 0.6 + 0.4, 0.0, 1.0);
        assert!((reading.penalty - expected).abs() < 1e-9);
    }
}
