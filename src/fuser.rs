// =============================================================================
// Score Fuser (C5) -- cross-symbol normalization, alignment, MTF consistency,
// final scoring, top-N boards, aggregated top list.
// =============================================================================

use std::collections::HashMap;

use crate::types::{
    clamp, sigmoid, sign, AggregatedMoversEntry, MoversEntry, MoversScores, MoversSnapshot,
    SymbolTimeframeMetric, Timeframe, Window,
};

const MAX_BOARD_SIZE: usize = 10;
const MAX_AGGREGATED: usize = 20;

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    if n == 0.0 {
        return (0.0, 1.0);
    }
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();
    (mean, if std < 1e-9 { 1.0 } else { std })
}

fn weighted_avg(pairs: &[(f64, f64)]) -> f64 {
    let weight_sum: f64 = pairs.iter().map(|(_, w)| w).sum();
    if weight_sum <= 0.0 {
        return 0.0;
    }
    pairs.iter().map(|(v, w)| v * w).sum::<f64>() / weight_sum
}

fn mtf_weight(tf: Timeframe) -> f64 {
    match tf {
        Timeframe::TenM | Timeframe::ThirtyM => 1.0,
        Timeframe::OneH | Timeframe::TwoH => 1.5,
    }
}

/// `metrics`: symbol -> timeframe -> metric, pre-populated by the metric
/// engine (align/volumeBoost/activeFlow/mtfConsistency/core/confirm/final
/// still at their placeholder defaults). Mutated in place with the fused
/// scores, then used to build the boards and aggregated list.
pub fn fuse(
    metrics: &mut HashMap<String, HashMap<Timeframe, SymbolTimeframeMetric>>,
    liquidity_penalty: &HashMap<String, f64>,
    windows: &HashMap<Timeframe, Window>,
) -> (HashMap<String, MoversSnapshot>, Vec<AggregatedMoversEntry>) {
    // Step 1-2: per-timeframe volume z-scoring.
    for tf in Timeframe::ALL {
        let volumes: Vec<f64> = metrics
            .values()
            .filter_map(|by_tf| by_tf.get(&tf).map(|m| m.total_quote_volume))
            .collect();
        let (mean, std) = mean_std(&volumes);

        for by_tf in metrics.values_mut() {
            if let Some(m) = by_tf.get_mut(&tf) {
                let vol_z = clamp((m.total_quote_volume - mean) / std, -3.0, 3.0);
                m.volume_boost = sigmoid(vol_z);
                let g_vol = clamp(vol_z / 3.0, 0.0, 1.0);
                m.active_flow = clamp(m.flow_immediate_base * g_vol, 0.0, 1.0);
            }
        }
    }

    // Step 3-4: alignment and MTF consistency need each symbol's full set of
    // timeframes at once, so this pass reads a snapshot before mutating.
    let snapshot: HashMap<String, HashMap<Timeframe, (f64, f64)>> = metrics
        .iter()
        .map(|(sym, by_tf)| {
            let inner = by_tf
                .iter()
                .map(|(tf, m)| (*tf, (m.net_change, m.momentum_atr)))
                .collect();
            (sym.clone(), inner)
        })
        .collect();

    for (symbol, by_tf) in metrics.iter_mut() {
        let others_all = &snapshot[symbol];
        for (tf, m) in by_tf.iter_mut() {
            let base_sign = sign(m.net_change);

            let mut align_sum = 0.0;
            let mut align_n = 0.0;
            let mut weighted_sum = 0.0;
            let mut weight_total = 0.0;
            let mut momentum_others = Vec::new();

            for (other_tf, (net_change, momentum)) in others_all.iter() {
                if *other_tf == *tf {
                    continue;
                }
                let other_sign = sign(*net_change);
                if other_sign != 0.0 {
                    align_n += 1.0;
                    if other_sign == base_sign {
                        align_sum += 1.0;
                    } else {
                        align_sum -= 0.5;
                    }

                    let w = mtf_weight(*other_tf);
                    weight_total += w;
                    if other_sign == base_sign {
                        weighted_sum += w;
                    }
                }
                momentum_others.push(*momentum);
            }

            m.align = if align_n > 0.0 {
                clamp((align_sum + 0.5 * align_n) / (1.5 * align_n), 0.0, 1.0)
            } else {
                0.5
            };

            let sign_agreement = if weight_total > 0.0 {
                clamp(weighted_sum / weight_total, 0.0, 1.0)
            } else {
                0.0
            };
            let mean_momentum = if momentum_others.is_empty() {
                0.0
            } else {
                clamp(
                    momentum_others.iter().sum::<f64>() / momentum_others.len() as f64,
                    0.0,
                    1.0,
                )
            };
            m.mtf_consistency = sign_agreement * mean_momentum;
        }
    }

    // Step 5-7: core / confirm / final.
    for (symbol, by_tf) in metrics.iter_mut() {
        let penalty = liquidity_penalty.get(symbol).copied().unwrap_or(0.0);
        for m in by_tf.values_mut() {
            let core = m.small_move_gate
                * weighted_avg(&[
                    (m.efficiency, 1.0),
                    (1.0 - m.chop, 1.0),
                    (m.momentum_atr, 1.0),
                    (m.align, 1.0),
                    (m.mtf_consistency, 0.8),
                ]);
            let confirm = weighted_avg(&[
                (m.volume_boost, 0.5),
                (m.active_flow, 0.3),
                (m.flow_persistence, 0.2),
            ]);
            let final_score = clamp(0.67 * core + 0.33 * confirm - penalty, 0.0, 1.0);

            m.core_score = core;
            m.confirm_score = confirm;
            m.final_score = final_score;
        }
    }

    // Step 8: per-timeframe boards.
    let mut snapshots = HashMap::new();
    for tf in Timeframe::ALL {
        let mut entries: Vec<(String, &SymbolTimeframeMetric)> = metrics
            .iter()
            .filter_map(|(sym, by_tf)| by_tf.get(&tf).map(|m| (sym.clone(), m)))
            .collect();

        let mut changes = HashMap::new();
        for (sym, m) in &entries {
            changes.insert(sym.clone(), m.change_percent);
        }

        entries.sort_by(|a, b| b.1.change_percent.partial_cmp(&a.1.change_percent).unwrap());
        let top_gainers: Vec<MoversEntry> = entries
            .iter()
            .take(MAX_BOARD_SIZE)
            .map(|(sym, m)| to_entry(sym, m))
            .collect();

        entries.sort_by(|a, b| a.1.change_percent.partial_cmp(&b.1.change_percent).unwrap());
        let top_losers: Vec<MoversEntry> = entries
            .iter()
            .take(MAX_BOARD_SIZE)
            .map(|(sym, m)| to_entry(sym, m))
            .collect();

        let window = windows.get(&tf).copied().unwrap_or(Window { start: 0, end: 0 });

        snapshots.insert(
            tf.label().to_string(),
            MoversSnapshot {
                timeframe: tf,
                top_gainers,
                top_losers,
                changes,
                window,
            },
        );
    }

    // Step 9: aggregated top -- highest finalScore per symbol, then top 20.
    let mut best_per_symbol: Vec<(String, Timeframe, SymbolTimeframeMetric)> = Vec::new();
    for (symbol, by_tf) in metrics.iter() {
        if let Some((tf, m)) = by_tf
            .iter()
            .max_by(|a, b| a.1.final_score.partial_cmp(&b.1.final_score).unwrap())
        {
            best_per_symbol.push((symbol.clone(), *tf, m.clone()));
        }
    }
    best_per_symbol.sort_by(|a, b| b.2.final_score.partial_cmp(&a.2.final_score).unwrap());

    let aggregated_top = best_per_symbol
        .into_iter()
        .take(MAX_AGGREGATED)
        .map(|(symbol, tf, m)| {
            let window = windows.get(&tf).copied().unwrap_or(Window { start: 0, end: 0 });
            let mut changes = HashMap::new();
            changes.insert(symbol.clone(), m.change_percent);
            AggregatedMoversEntry {
                entry: to_entry(&symbol, &m),
                timeframe: tf,
                window,
                changes,
                metrics: m,
            }
        })
        .collect();

    (snapshots, aggregated_top)
}

fn to_entry(symbol: &str, m: &SymbolTimeframeMetric) -> MoversEntry {
    MoversEntry {
        symbol: symbol.to_string(),
        last_price: m.latest_close,
        change_percent: m.change_percent,
        flow_percent: m.flow_ratio.map(|r| r * 100.0),
        flow_label: m.flow_label.clone(),
        scores: MoversScores {
            core_score: m.core_score,
            confirm_score: m.confirm_score,
            final_score: m.final_score,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(net_change: f64, total_quote_volume: f64) -> SymbolTimeframeMetric {
        SymbolTimeframeMetric {
            net_change,
            change_percent: net_change * 100.0,
            efficiency: 0.5,
            chop: 0.2,
            momentum_atr: 0.4,
            small_move_gate: 0.8,
            atr_value: 0.001,
            total_quote_volume,
            flow_ratio: Some(0.55),
            flow_label: Some("balanced".to_string()),
            flow_immediate_base: 0.55,
            flow_persistence: 0.3,
            align: 0.0,
            mtf_consistency: 0.0,
            volume_boost: 0.0,
            active_flow: 0.0,
            core_score: 0.0,
            confirm_score: 0.0,
            final_score: 0.0,
            latest_close: 100.0,
            highest_close: 100.0,
            lowest_close: 100.0,
            close_history: vec![100.0],
            efficiency_history: vec![0.5],
            momentum_history: vec![0.4],
        }
    }

    #[test]
    fn align_is_half_with_no_other_timeframe_signal() {
        // S1: one timeframe at +2%, all others 0%.
        let mut metrics = HashMap::new();
        let mut by_tf = HashMap::new();
        by_tf.insert(Timeframe::OneH, metric(0.02, 1000.0));
        by_tf.insert(Timeframe::TenM, metric(0.0, 1000.0));
        by_tf.insert(Timeframe::ThirtyM, metric(0.0, 1000.0));
        by_tf.insert(Timeframe::TwoH, metric(0.0, 1000.0));
        metrics.insert("BTCUSDT".to_string(), by_tf);

        let (_, _) = fuse(&mut metrics, &HashMap::new(), &HashMap::new());
        let m = &metrics["BTCUSDT"][&Timeframe::OneH];
        assert_eq!(m.align, 0.5);
    }

    #[test]
    fn volume_boost_is_half_at_mean_volume() {
        let mut metrics = HashMap::new();
        for (sym, vol) in [("A", 1000.0), ("B", 1000.0), ("C", 1000.0)] {
            let mut by_tf = HashMap::new();
            by_tf.insert(Timeframe::OneH, metric(0.01, vol));
            metrics.insert(sym.to_string(), by_tf);
        }
        fuse(&mut metrics, &HashMap::new(), &HashMap::new());
        for sym in ["A", "B", "C"] {
            let m = &metrics[sym][&Timeframe::OneH];
            assert!((m.volume_boost - 0.5).abs() < 1e-9);
        }
    }

    #[test]
    fn final_score_bounded_in_unit_interval() {
        let mut metrics = HashMap::new();
        let mut by_tf = HashMap::new();
        by_tf.insert(Timeframe::OneH, metric(0.05, 5000.0));
        metrics.insert("BTCUSDT".to_string(), by_tf);

        let mut penalty = HashMap::new();
        penalty.insert("BTCUSDT".to_string(), 0.1);

        fuse(&mut metrics, &penalty, &HashMap::new());
        let m = &metrics["BTCUSDT"][&Timeframe::OneH];
        assert!(m.final_score >= 0.0 && m.final_score <= 1.0);
        assert!(m.core_score >= 0.0 && m.confirm_score >= 0.0);
    }

    #[test]
    fn boards_are_sorted_and_capped() {
        let mut metrics = HashMap::new();
        for i in 0..15 {
            let mut by_tf = HashMap::new();
            by_tf.insert(Timeframe::OneH, metric(0.001 * i as f64, 1000.0));
            metrics.insert(format!("S{i}"), by_tf);
        }
        let (snapshots, _) = fuse(&mut metrics, &HashMap::new(), &HashMap::new());
        let snap = &snapshots["1h"];
        assert!(snap.top_gainers.len() <= 10);
        assert!(snap.top_losers.len() <= 10);
        for pair in snap.top_gainers.windows(2) {
            assert!(pair[0].change_percent >= pair[1].change_percent);
        }
        for pair in snap.top_losers.windows(2) {
            assert!(pair[0].change_percent <= pair[1].change_percent);
        }
    }
}
