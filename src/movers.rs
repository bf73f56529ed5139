// =============================================================================
// Movers Pipeline (C7) -- orchestrates C3 -> C2 -> C4 -> C5 -> C6 per cycle
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{info, warn};

use crate::exchange::ExchangeClient;
use crate::fuser;
use crate::liquidity;
use crate::metrics::MetricEngine;
use crate::types::{MoversResult, SymbolTimeframeMetric, Timeframe, Window};
use crate::universe::UniverseSelector;

/// Symbols processed per fan-out chunk; a chunk completes before the next
/// starts, bounding in-flight requests.
pub const CONCURRENCY: usize = 8;
/// Candles requested per symbol: 24h of 1-minute bars.
pub const KLINE_LIMIT: u32 = 1440;

pub struct MoversPipeline {
    universe: UniverseSelector,
    metrics: MetricEngine,
}

impl MoversPipeline {
    pub fn new() -> Self {
        Self {
            universe: UniverseSelector::new(),
            metrics: MetricEngine::new(),
        }
    }

    pub async fn run_cycle(&self, client: &ExchangeClient) -> MoversResult {
        let universe = match self.universe.get(client).await {
            Ok(symbols) => symbols,
            Err(e) => {
                warn!(error = %e, "universe refresh failed, skipping cycle");
                return empty_result();
            }
        };

        self.metrics.retain_symbols(&universe);

        if universe.is_empty() {
            return empty_result();
        }

        let mut all_metrics: HashMap<String, HashMap<Timeframe, SymbolTimeframeMetric>> =
            HashMap::new();
        let mut liquidity_penalty: HashMap<String, f64> = HashMap::new();

        for chunk in universe.chunks(CONCURRENCY) {
            let futures = chunk.iter().map(|symbol| self.process_symbol(client, symbol));
            let results = join_all(futures).await;

            for (symbol, outcome) in chunk.iter().zip(results) {
                match outcome {
                    Some((by_tf, penalty)) => {
                        if !by_tf.is_empty() {
                            all_metrics.insert(symbol.clone(), by_tf);
                        }
                        liquidity_penalty.insert(symbol.clone(), penalty);
                    }
                    None => {
                        warn!(symbol, "dropped: empty candle buffer or non-finite close");
                    }
                }
            }
        }

        let now = Utc::now().timestamp_millis();
        let windows: HashMap<Timeframe, Window> = Timeframe::ALL
            .iter()
            .map(|tf| {
                (
                    *tf,
                    Window {
                        start: now - tf.minutes() * 60_000,
                        end: now,
                    },
                )
            })
            .collect();

        let (snapshots, aggregated_top) = fuser::fuse(&mut all_metrics, &liquidity_penalty, &windows);

        let metrics_out: HashMap<String, HashMap<String, SymbolTimeframeMetric>> = all_metrics
            .into_iter()
            .map(|(sym, by_tf)| {
                let labeled = by_tf.into_iter().map(|(tf, m)| (tf.label().to_string(), m)).collect();
                (sym, labeled)
            })
            .collect();

        info!(
            symbols = metrics_out.len(),
            aggregated = aggregated_top.len(),
            "movers cycle complete"
        );

        MoversResult {
            snapshots,
            aggregated_top,
            metrics: metrics_out,
            liquidity_penalty,
        }
    }

    async fn process_symbol(
        &self,
        client: &ExchangeClient,
        symbol: &str,
    ) -> Option<(HashMap<Timeframe, SymbolTimeframeMetric>, f64)> {
        let candles = match client.get_klines(symbol, "1m", KLINE_LIMIT).await {
            Ok(c) => c,
            Err(e) => {
                warn!(symbol, error = %e, "kline fetch failed");
                return None;
            }
        };

        if candles.is_empty() {
            return None;
        }
        let last_close = candles.last().map(|c| c.close).unwrap_or(f64::NAN);
        if !last_close.is_finite() {
            return None;
        }

        let mut by_tf = HashMap::new();
        for tf in Timeframe::ALL {
            if let Some(m) = self.metrics.compute(symbol, tf, &candles) {
                by_tf.insert(tf, m);
            }
        }

        let penalty = liquidity::probe(client, symbol).await;
        Some((by_tf, penalty))
    }
}

impl Default for MoversPipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_result() -> MoversResult {
    MoversResult {
        snapshots: HashMap::new(),
        aggregated_top: Vec::new(),
        metrics: HashMap::new(),
        liquidity_penalty: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_and_kline_limit_match_spec() {
        assert_eq!(CONCURRENCY, 8);
        assert_eq!(KLINE_LIMIT, 1440);
    }

    #[test]
    fn empty_result_has_no_symbols() {
        let r = empty_result();
        assert!(r.snapshots.is_empty());
        assert!(r.aggregated_top.is_empty());
        assert!(r.metrics.is_empty());
    }
}
