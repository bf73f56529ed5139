//! `ManagedPositionState` -- owned exclusively by the Strategy Engine.

use crate::types::{PositionDirection, SymbolTimeframeMetric, Timeframe};

#[derive(Debug, Clone)]
pub struct ManagedPositionState {
    pub symbol: String,
    pub direction: PositionDirection,
    pub parent_timeframe: Timeframe,
    pub child_timeframe: Timeframe,

    pub entry_price: f64,
    pub base_quantity: f64,
    pub total_quantity: f64,

    pub k_sl: f64,
    pub initial_sl_distance: f64,
    pub sl_distance: f64,
    pub stop_price: f64,
    pub trail_atr_multiple: f64,

    pub clean_score: f64,
    pub gate_score: f64,

    pub opened_at_ms: i64,
    pub add_count: u8,
    pub be_moved: bool,

    pub highest_observed: f64,
    pub lowest_observed: f64,
    pub trail_price: Option<f64>,

    pub partial_one_taken: bool,
    pub partial_two_taken: bool,

    pub time_stop_stage: u8,
    pub time_stop_timestamp: Option<i64>,
    pub structure_break_counter: u8,

    pub parent_atr: f64,
    pub child_atr: f64,
    pub risk_amount: f64,
    pub parent_minutes: i64,
    pub child_minutes: i64,

    pub max_r: f64,
    pub last_price: f64,

    /// Last cycle's metric snapshots for parent/child, mutated in place by
    /// live ticks (`latestClose`/`highestClose`/`lowestClose`/`closeHistory`).
    pub parent_snapshot: SymbolTimeframeMetric,
    pub child_snapshot: SymbolTimeframeMetric,

    /// Order-side effects staged by the state machine for the async caller
    /// to execute once the sync lock over this entry is released.
    pub pending_stop: Option<f64>,
    pub pending_reduce: Option<f64>,
    pub pending_add: Option<f64>,
}

impl ManagedPositionState {
    /// `R = dir * (price - entry) / initialSlDistance`.
    pub fn r_multiple(&self, price: f64) -> f64 {
        if self.initial_sl_distance <= 0.0 {
            return 0.0;
        }
        self.direction.sign() * (price - self.entry_price) / self.initial_sl_distance
    }

    pub fn update_extremes(&mut self, price: f64) {
        self.highest_observed = self.highest_observed.max(price);
        self.lowest_observed = if self.lowest_observed == 0.0 {
            price
        } else {
            self.lowest_observed.min(price)
        };
        self.last_price = price;
        let r = self.r_multiple(price);
        self.max_r = self.max_r.max(r);
    }

    /// `cleanP = (|trend| + efficiency + align) / 300` on the parent, where
    /// trend/efficiency/align are already expressed on a 0-100 scale.
    pub fn clean_p(trend_abs: f64, efficiency_pct: f64, align_pct: f64) -> f64 {
        (trend_abs + efficiency_pct + align_pct) / 300.0
    }

    /// Drain the staged order-side effects: `(stop, reduce_qty, add_qty)`.
    pub fn take_pending(&mut self) -> (Option<f64>, Option<f64>, Option<f64>) {
        (self.pending_stop.take(), self.pending_reduce.take(), self.pending_add.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_metric() -> SymbolTimeframeMetric {
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

    fn sample_state() -> ManagedPositionState {
        ManagedPositionState {
            symbol: "BTCUSDT".to_string(),
            direction: PositionDirection::Long,
            parent_timeframe: Timeframe::OneH,
            child_timeframe: Timeframe::ThirtyM,
            entry_price: 100.0,
            base_quantity: 1.0,
            total_quantity: 1.0,
            k_sl: 2.0,
            initial_sl_distance: 1.0,
            sl_distance: 1.0,
            stop_price: 99.0,
            trail_atr_multiple: 2.0,
            clean_score: 0.5,
            gate_score: 0.5,
            opened_at_ms: 0,
            add_count: 0,
            be_moved: false,
            highest_observed: 100.0,
            lowest_observed: 100.0,
            trail_price: None,
            partial_one_taken: false,
            partial_two_taken: false,
            time_stop_stage: 0,
            time_stop_timestamp: None,
            structure_break_counter: 0,
            parent_atr: 0.5,
            child_atr: 0.3,
            risk_amount: 1.0,
            parent_minutes: 60,
            child_minutes: 30,
            max_r: 0.0,
            last_price: 100.0,
            parent_snapshot: base_metric(),
            child_snapshot: base_metric(),
            pending_stop: None,
            pending_reduce: None,
            pending_add: None,
        }
    }

    #[test]
    fn r_multiple_tracks_favorable_long_move() {
        let mut s = sample_state();
        s.update_extremes(102.0);
        assert!((s.r_multiple(102.0) - 2.0).abs() < 1e-9);
        assert!((s.max_r - 2.0).abs() < 1e-9);
    }

    #[test]
    fn r_multiple_is_negative_for_short_adverse_move() {
        let mut s = sample_state();
        s.direction = PositionDirection::Short;
        assert!(s.r_multiple(101.0) < 0.0);
    }

    #[test]
    fn initial_sl_distance_field_is_independent_of_sl_distance_mutation() {
        let mut s = sample_state();
        s.sl_distance = 2.5;
        assert_eq!(s.initial_sl_distance, 1.0);
    }
}
