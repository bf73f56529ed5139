//! Metric Engine (C4) -- derives per-symbol, per-timeframe movement-quality
//! metrics from a shared 1-minute candle buffer.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::metrics::{atr_window, chop, efficiency, flow, momentum};
use crate::types::{Candle, SymbolTimeframeMetric, Timeframe};

const MS_PER_MINUTE: i64 = 60_000;

fn empty_metric() -> SymbolTimeframeMetric {
    SymbolTimeframeMetric {
        net_change: 0.0,
        change_percent: 0.0,
        efficiency: 0.0,
        chop: 0.0,
        momentum_atr: 0.0,
        small_move_gate: 0.0,
        atr_value: 0.0,
        total_quote_volume: 0.0,
        flow_ratio: None,
        flow_label: None,
        flow_immediate_base: 0.5,
        flow_persistence: 0.0,
        align: 0.5,
        mtf_consistency: 0.0,
        volume_boost: 0.5,
        active_flow: 0.0,
        core_score: 0.0,
        confirm_score: 0.0,
        final_score: 0.0,
        latest_close: 0.0,
        highest_close: 0.0,
        lowest_close: 0.0,
        close_history: Vec::new(),
        efficiency_history: Vec::new(),
        momentum_history: Vec::new(),
    }
}

/// Holds bounded per-(symbol, timeframe) history arrays across cycles. The
/// rest of `SymbolTimeframeMetric` is recomputed fresh every cycle; only the
/// history arrays (and the running high/low) need to survive between them.
pub struct MetricEngine {
    history: RwLock<HashMap<(String, Timeframe), SymbolTimeframeMetric>>,
}

impl MetricEngine {
    pub fn new() -> Self {
        Self {
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Compute the metric bundle for one `(symbol, timeframe)` pair from an
    /// ordered, deduped candle buffer. Returns `None` when the reference
    /// candle is missing or the window is short -- "data-insufficient",
    /// silently skipped per spec.
    pub fn compute(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[Candle],
    ) -> Option<SymbolTimeframeMetric> {
        let latest = candles.last()?;
        let minutes = timeframe.minutes();
        let reference_time = latest.open_time - minutes * MS_PER_MINUTE;

        let reference_idx = candles.iter().position(|c| c.open_time == reference_time)?;
        let reference = &candles[reference_idx];

        let window: Vec<Candle> = candles[reference_idx + 1..]
            .iter()
            .filter(|c| c.open_time > reference.open_time && c.open_time <= latest.open_time)
            .copied()
            .collect();

        if window.len() as i64 != minutes {
            debug!(symbol, timeframe = %timeframe, expected = minutes, got = window.len(), "window length mismatch, skipping");
            return None;
        }

        let first = window.first()?;
        let last = window.last()?;

        let net_change = if first.open > 0.0 {
            (last.close - first.open) / first.open
        } else {
            0.0
        };

        let eff = efficiency::efficiency(&window);
        let ch = chop::chop(&window, net_change);

        let atr_value = atr_window::window_atr(&window, Some(reference.close)).unwrap_or(0.0);
        let atr_pct = if last.close > 0.0 { atr_value / last.close } else { 0.0 };

        let momentum_atr_v = momentum::momentum_atr(net_change, atr_pct);
        let small_move_gate_v = momentum::small_move_gate(net_change);

        let ratio = flow::flow_ratio(&window);
        let label = ratio.map(flow::flow_label);
        let flow_immediate_base = flow::flow_immediate_base(ratio);
        let flow_persistence = flow::flow_persistence(&window);

        let total_quote_volume: f64 = window.iter().map(|c| c.quote_volume).sum();

        let mut guard = self.history.write();
        let entry = guard
            .entry((symbol.to_string(), timeframe))
            .or_insert_with(empty_metric);

        entry.net_change = net_change;
        entry.change_percent = net_change * 100.0;
        entry.efficiency = eff;
        entry.chop = ch;
        entry.momentum_atr = momentum_atr_v;
        entry.small_move_gate = small_move_gate_v;
        entry.atr_value = atr_value;
        entry.total_quote_volume = total_quote_volume;
        entry.flow_ratio = ratio;
        entry.flow_label = label.map(|l| l.as_str().to_string());
        entry.flow_immediate_base = flow_immediate_base;
        entry.flow_persistence = flow_persistence;

        entry.push_history(last.close, eff, momentum_atr_v);

        Some(entry.clone())
    }

    /// Drop cached history for symbols no longer in the active universe, so
    /// memory doesn't grow unbounded across universe refreshes.
    pub fn retain_symbols(&self, symbols: &[String]) {
        let set: std::collections::HashSet<&str> = symbols.iter().map(|s| s.as_str()).collect();
        self.history.write().retain(|(sym, _), _| set.contains(sym.as_str()));
    }
}

impl Default for MetricEngine {
    fn default() -> Self {
        Self::new()
    }
}
