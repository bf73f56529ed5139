//! Strategy Engine (C9) -- framework selection, entry gating, sizing, and
//! the full position-lifecycle state machine.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::executor::{Executor, PriceTick};
use crate::notifier::Notifier;
use crate::strategy::state::ManagedPositionState;
use crate::types::{
    clamp, sign, FrameworkScores, MoversResult, PositionDirection, QUANTITY_EPSILON,
    SymbolTimeframeMetric, Timeframe,
};

const KSL_MIN: f64 = 1.2;
const KSL_MAX: f64 = 2.8;
const TRAIL_MIN: f64 = 1.6;
const TRAIL_MAX: f64 = 3.2;
const BE_BUFFER_PCT: f64 = 0.0005;

fn signed_trend(m: &SymbolTimeframeMetric) -> f64 {
    (1.0 - m.chop) * 100.0 * sign(m.net_change)
}

fn flow_score(m: &SymbolTimeframeMetric) -> f64 {
    let flow = if m.active_flow > 0.0 { m.active_flow } else { m.flow_immediate_base };
    flow * 100.0
}

pub fn framework_scores(m: &SymbolTimeframeMetric) -> FrameworkScores {
    FrameworkScores {
        trend: signed_trend(m).abs(),
        efficiency: m.efficiency * 100.0,
        align: m.align * 100.0,
        volume: m.volume_boost * 100.0,
        flow: flow_score(m),
    }
}

/// Select (parent, child) timeframes per the cascading rule in spec §4.9.
pub fn select_framework(
    metrics: &HashMap<String, SymbolTimeframeMetric>,
) -> Option<(Timeframe, Timeframe)> {
    let get = |tf: Timeframe| metrics.get(tf.label());

    if let Some(h1) = get(Timeframe::OneH) {
        if signed_trend(h1) >= 70.0 && h1.efficiency * 100.0 >= 55.0 && get(Timeframe::ThirtyM).is_some() {
            return Some((Timeframe::OneH, Timeframe::ThirtyM));
        }
    }
    if get(Timeframe::ThirtyM).is_some() && get(Timeframe::TenM).is_some() {
        return Some((Timeframe::ThirtyM, Timeframe::TenM));
    }
    if get(Timeframe::OneH).is_some() && get(Timeframe::ThirtyM).is_some() {
        return Some((Timeframe::OneH, Timeframe::ThirtyM));
    }
    None
}

pub fn direction_from_parent(parent: &SymbolTimeframeMetric) -> Option<PositionDirection> {
    let trend = signed_trend(parent);
    let align_pct = parent.align * 100.0;
    if trend >= 65.0 && align_pct >= 60.0 && parent.net_change >= 0.0 {
        Some(PositionDirection::Long)
    } else if trend <= -65.0 && align_pct >= 60.0 && parent.net_change <= 0.0 {
        Some(PositionDirection::Short)
    } else {
        None
    }
}

fn trigger_satisfied(child: &SymbolTimeframeMetric, direction: PositionDirection) -> bool {
    let momentum_consistent =
        sign(child.net_change) == direction.sign() || child.net_change == 0.0;
    let small_move_trigger =
        child.small_move_gate >= 0.65 && child.momentum_atr >= 0.5 && momentum_consistent;

    let child_scores = framework_scores(child);
    let efficiency_trigger =
        child.efficiency * 100.0 >= 55.0 && (child_scores.volume >= 55.0 || child_scores.flow >= 55.0);

    small_move_trigger || efficiency_trigger
}

/// All entry gates except "not already managed", which the caller checks
/// against its own managed-symbol map.
pub fn entry_gates_pass(
    parent: &SymbolTimeframeMetric,
    child: &SymbolTimeframeMetric,
    direction: PositionDirection,
    liquidity_penalty: f64,
    executor: &Executor,
    symbol: &str,
) -> bool {
    if !executor.can_open_position(symbol) {
        return false;
    }
    if parent.efficiency * 100.0 < 45.0 {
        return false;
    }
    if parent.align * 100.0 < 50.0 {
        return false;
    }
    if liquidity_penalty * 100.0 >= 40.0 {
        return false;
    }
    trigger_satisfied(child, direction)
}

pub fn clean_p(parent_scores: &FrameworkScores) -> f64 {
    (parent_scores.trend + parent_scores.efficiency + parent_scores.align) / 300.0
}

/// `kSl` and `slDistance`; `None` if child ATR is non-positive. `ksl_buffer`
/// is the `KSL_BUFFER` env knob (default 1, clamped [0.5, 2]) that scales
/// the stop distance up or down without moving the [1.2, 2.8] formula
/// bounds themselves.
pub fn sizing_and_stop(clean_p: f64, gate_c: f64, child_atr: f64, ksl_buffer: f64) -> Option<(f64, f64)> {
    if child_atr <= 0.0 {
        return None;
    }
    let base_k_sl = clamp(KSL_MIN + 0.9 * clean_p + 0.3 * gate_c, KSL_MIN, KSL_MAX);
    let k_sl = base_k_sl * ksl_buffer;
    Some((k_sl, k_sl * child_atr))
}

pub fn size_scale(liquidity_penalty_pct: f64) -> f64 {
    let base = (100.0 - liquidity_penalty_pct) / 100.0;
    clamp(base * base, 0.2, 1.0)
}

fn is_monotonic_non_increasing(values: &[f64]) -> bool {
    if values.len() < 2 {
        return false;
    }
    values.windows(2).all(|w| w[1] <= w[0])
}

pub fn trailing_atr_multiple(clean_p: f64, gate_c: f64, child: &SymbolTimeframeMetric) -> f64 {
    let mut trail = clamp(2.0 + 1.2 * clean_p - 0.6 * (1.0 - gate_c), TRAIL_MIN, TRAIL_MAX);

    let eff_tail: Vec<f64> = child
        .efficiency_history
        .iter()
        .rev()
        .take(10)
        .rev()
        .copied()
        .collect();
    let mom_tail: Vec<f64> = child
        .momentum_history
        .iter()
        .rev()
        .take(3)
        .rev()
        .copied()
        .collect();

    let eff_declining = is_monotonic_non_increasing(&eff_tail);
    let mom_declining = mom_tail.len() == 3 && mom_tail[2] < mom_tail[0];

    if eff_declining || mom_declining {
        trail = (trail - 0.4).max(TRAIL_MIN);
    }
    trail
}

/// Single-slot "replace newest" mailbox plus a managed position per symbol.
struct ManagedEntry {
    state: ManagedPositionState,
    pending_tick: Option<PriceTick>,
    processing: bool,
}

/// The REST-polling producer task and its tick-consuming task for one
/// managed symbol's live price stream, aborted together when the position
/// closes or reconcile drops it.
struct PriceStreamHandles {
    producer: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

impl Drop for PriceStreamHandles {
    fn drop(&mut self) {
        self.producer.abort();
        self.consumer.abort();
    }
}

pub struct StrategyEngine {
    executor: Arc<Executor>,
    notifier: Option<Arc<Notifier>>,
    ksl_buffer: f64,
    managed: RwLock<HashMap<String, Mutex<ManagedEntry>>>,
    price_streams: RwLock<HashMap<String, PriceStreamHandles>>,
}

impl StrategyEngine {
    pub fn new(executor: Arc<Executor>, notifier: Option<Arc<Notifier>>, ksl_buffer: f64) -> Self {
        Self {
            executor,
            notifier,
            ksl_buffer,
            managed: RwLock::new(HashMap::new()),
            price_streams: RwLock::new(HashMap::new()),
        }
    }

    pub fn managed_symbols(&self) -> Vec<String> {
        self.managed.read().keys().cloned().collect()
    }

    /// Start the live-tick pipeline for a freshly opened position: a
    /// REST-polling producer plus a consumer that routes ticks into
    /// `handle_price_tick`.
    fn start_price_stream(self: &Arc<Self>, symbol: String) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let producer = self.executor.clone().subscribe_price_stream(symbol.clone(), tx);

        let engine = Arc::clone(self);
        let consumer_symbol = symbol.clone();
        let consumer = tokio::spawn(async move {
            while let Some(tick) = rx.recv().await {
                engine.handle_price_tick(&consumer_symbol, tick).await;
            }
        });

        self.price_streams.write().insert(symbol, PriceStreamHandles { producer, consumer });
    }

    fn stop_price_stream(&self, symbol: &str) {
        self.price_streams.write().remove(symbol);
    }

    /// Re-sync every managed symbol's quantity from the exchange; drop
    /// entries whose position has exited externally.
    pub async fn reconcile(&self) {
        let symbols = self.managed_symbols();
        for symbol in symbols {
            let position = self.executor.position(&symbol);

            let should_drop = {
                let map = self.managed.read();
                let Some(entry_lock) = map.get(&symbol) else { continue };
                let mut entry = entry_lock.lock();

                let leg_qty = position
                    .as_ref()
                    .and_then(|p| p.leg(entry.state.direction))
                    .map(|leg| leg.quantity)
                    .unwrap_or(0.0);

                if leg_qty <= QUANTITY_EPSILON {
                    true
                } else {
                    entry.state.total_quantity = leg_qty;
                    false
                }
            };

            if should_drop {
                info!(symbol, "reconcile: position exited externally, dropping managed state");
                self.managed.write().remove(&symbol);
                self.stop_price_stream(&symbol);
            }
        }
    }

    /// One full cycle pass: reconcile, manage existing positions, evaluate
    /// new candidates, then manage again so freshly opened positions get at
    /// least one management pass this cycle.
    pub async fn run_cycle(self: &Arc<Self>, movers: &MoversResult) {
        self.reconcile().await;
        self.manage_all().await;
        self.evaluate_candidates(movers).await;
        self.reconcile().await;
        self.manage_all().await;
    }

    async fn evaluate_candidates(self: &Arc<Self>, movers: &MoversResult) {
        for agg in &movers.aggregated_top {
            let symbol = &agg.entry.symbol;
            if self.managed.read().contains_key(symbol) {
                continue;
            }

            let Some(by_label) = movers.metrics.get(symbol) else { continue };
            let Some((parent_tf, child_tf)) = select_framework(by_label) else { continue };
            let parent = &by_label[parent_tf.label()];
            let child = &by_label[child_tf.label()];

            let Some(direction) = direction_from_parent(parent) else { continue };

            let liquidity_penalty = movers.liquidity_penalty.get(symbol).copied().unwrap_or(0.0);

            if !entry_gates_pass(parent, child, direction, liquidity_penalty, &self.executor, symbol) {
                continue;
            }

            let parent_scores = framework_scores(parent);
            let clean = clean_p(&parent_scores);
            let gate_c = child.small_move_gate;

            let Some((k_sl, sl_distance)) = sizing_and_stop(clean, gate_c, child.atr_value, self.ksl_buffer) else {
                continue;
            };

            let scale = size_scale(liquidity_penalty * 100.0);

            let Some(fill) = self.executor.create_market_order(symbol, direction, scale).await else {
                continue;
            };

            let entry_price = fill.avg_price;
            let stop_price = (entry_price - direction.sign() * sl_distance).max(0.0001);

            self.executor
                .place_stop_loss(symbol, direction, fill.executed_qty, stop_price)
                .await;

            let trail_atr_multiple = trailing_atr_multiple(clean, gate_c, child);
            let now_ms = chrono::Utc::now().timestamp_millis();

            let state = ManagedPositionState {
                symbol: symbol.clone(),
                direction,
                parent_timeframe: parent_tf,
                child_timeframe: child_tf,
                entry_price,
                base_quantity: fill.executed_qty,
                total_quantity: fill.executed_qty,
                k_sl,
                initial_sl_distance: sl_distance,
                sl_distance,
                stop_price,
                trail_atr_multiple,
                clean_score: clean,
                gate_score: gate_c,
                opened_at_ms: now_ms,
                add_count: 0,
                be_moved: false,
                highest_observed: entry_price,
                lowest_observed: entry_price,
                trail_price: None,
                partial_one_taken: false,
                partial_two_taken: false,
                time_stop_stage: 0,
                time_stop_timestamp: None,
                structure_break_counter: 0,
                parent_atr: parent.atr_value,
                child_atr: child.atr_value,
                risk_amount: sl_distance * fill.executed_qty,
                parent_minutes: parent_tf.minutes(),
                child_minutes: child_tf.minutes(),
                max_r: 0.0,
                last_price: entry_price,
                parent_snapshot: parent.clone(),
                child_snapshot: child.clone(),
                pending_stop: None,
                pending_reduce: None,
                pending_add: None,
            };

            info!(symbol, %direction, entry_price, k_sl, sl_distance, "opened position");
            if let Some(n) = &self.notifier {
                n.notify(format!("Opened {direction} {symbol} @ {entry_price:.4} (kSl={k_sl:.2})")).await;
            }

            self.managed.write().insert(
                symbol.clone(),
                Mutex::new(ManagedEntry { state, pending_tick: None, processing: false }),
            );
            self.start_price_stream(symbol.clone());
        }
    }

    async fn manage_all(&self) {
        let symbols = self.managed_symbols();
        for symbol in symbols {
            let price = match self.executor.get_mark_price(&symbol).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(symbol, error = %e, "manage_all: mark price fetch failed, skipping");
                    continue;
                }
            };
            self.manage_one(&symbol, price).await;
        }
    }

    /// Apply the position state machine for one symbol at `price`. Used
    /// both by the per-cycle management pass and by live tick delivery.
    async fn manage_one(&self, symbol: &str, price: f64) {
        let should_close;
        let direction;
        let total_qty;
        {
            let map = self.managed.read();
            let Some(entry_lock) = map.get(symbol) else { return };
            let mut entry = entry_lock.lock();
            entry.state.update_extremes(price);
            apply_state_machine(&mut entry.state);
            should_close = should_close_position(&entry.state);
            direction = entry.state.direction;
            total_qty = entry.state.total_quantity;
        }

        if should_close {
            self.executor.reduce_position(symbol, direction, total_qty).await;
            self.executor.flatten_residual_positions(symbol).await;
            self.managed.write().remove(symbol);
            self.stop_price_stream(symbol);
            info!(symbol, "position closed by strategy engine");
            if let Some(n) = &self.notifier {
                n.notify(format!("Closed {symbol}")).await;
            }
            return;
        }

        // Apply any pending order-side effects (stop replace / partial /
        // add) that the pure state machine flagged but couldn't execute
        // itself since order placement is async and the lock is sync.
        self.apply_pending_orders(symbol).await;
    }

    async fn apply_pending_orders(&self, symbol: &str) {
        let (direction, stop_price, reduce_qty, add_qty) = {
            let map = self.managed.read();
            let Some(entry_lock) = map.get(symbol) else { return };
            let mut entry = entry_lock.lock();
            let pending = entry.state.take_pending();
            (entry.state.direction, pending.0, pending.1, pending.2)
        };

        if let Some(stop) = stop_price {
            let qty = total_quantity_of(self, symbol);
            self.executor.replace_stop_loss(symbol, direction, qty, stop).await;
        }
        if let Some(qty) = reduce_qty {
            self.executor.reduce_position(symbol, direction, qty).await;
        }
        if let Some(qty) = add_qty {
            self.executor.increase_position(symbol, direction, qty).await;
        }
    }

    /// Deliver a live price tick for a managed symbol. If a tick is already
    /// in flight for that symbol, the newest one replaces whatever was
    /// buffered and is processed once the in-flight run completes.
    pub async fn handle_price_tick(&self, tick_symbol: &str, tick: PriceTick) {
        let already_processing = {
            let map = self.managed.read();
            let Some(entry_lock) = map.get(tick_symbol) else { return };
            let mut entry = entry_lock.lock();
            if entry.processing {
                entry.pending_tick = Some(tick);
                true
            } else {
                entry.processing = true;
                false
            }
        };
        if already_processing {
            return;
        }

        let mut current = tick;
        loop {
            self.manage_one(tick_symbol, current.mark_price).await;

            let map = self.managed.read();
            let Some(entry_lock) = map.get(tick_symbol) else { break };
            let mut entry = entry_lock.lock();
            match entry.pending_tick.take() {
                Some(next) => current = next,
                None => {
                    entry.processing = false;
                    break;
                }
            }
        }
    }
}

fn total_quantity_of(engine: &StrategyEngine, symbol: &str) -> f64 {
    engine
        .managed
        .read()
        .get(symbol)
        .map(|e| e.lock().state.total_quantity)
        .unwrap_or(0.0)
}

fn should_close_position(state: &ManagedPositionState) -> bool {
    state.structure_break_counter >= 2 || state.time_stop_stage >= 2
}

/// Mutates `state` in place per the position state machine, and stages any
/// order-side effects for `take_pending` to drain.
fn apply_state_machine(state: &mut ManagedPositionState) {
    let dir = state.direction;

    // Break-even move.
    let be_threshold = if state.child_snapshot.volume_boost * 100.0 >= 55.0
        && flow_score(&state.child_snapshot) >= 55.0
    {
        1.0
    } else {
        1.3
    };
    if !state.be_moved && state.max_r >= be_threshold {
        let buffer = state.last_price * BE_BUFFER_PCT;
        let new_stop = state.entry_price - dir.sign() * buffer;
        state.stop_price = new_stop;
        state.be_moved = true;
        state.pending_stop = Some(new_stop);
    }

    // Trailing stop.
    let reference = match dir {
        PositionDirection::Long => state.parent_snapshot.highest_close.max(state.highest_observed),
        PositionDirection::Short => {
            if state.parent_snapshot.lowest_close == 0.0 {
                state.lowest_observed
            } else {
                state.parent_snapshot.lowest_close.min(state.lowest_observed)
            }
        }
    };
    let new_trail = reference - dir.sign() * state.trail_atr_multiple * state.parent_atr;
    let current_best = state.trail_price.unwrap_or(state.stop_price);
    let tightens = match dir {
        PositionDirection::Long => new_trail > current_best && new_trail < state.last_price,
        PositionDirection::Short => new_trail < current_best && new_trail > state.last_price,
    };
    if tightens && state.be_moved {
        state.trail_price = Some(new_trail);
        state.stop_price = new_trail;
        state.sl_distance = (state.entry_price - new_trail).abs();
        state.pending_stop = Some(new_trail);
    }

    // Partials.
    let r = state.r_multiple(state.last_price);
    let partial_qty = (0.3 * state.base_quantity).min(state.total_quantity);
    let strong_volume = state.child_snapshot.volume_boost * 100.0 >= 55.0 && flow_score(&state.child_snapshot) >= 55.0;
    let clean_trend = state.clean_score >= 0.6 && state.gate_score >= 0.7;

    if !state.partial_one_taken {
        let clean_path = clean_trend && r >= 2.0;
        let general_path = !clean_trend && !strong_volume && r >= 1.5;
        if clean_path || general_path {
            state.partial_one_taken = true;
            state.total_quantity = (state.total_quantity - partial_qty).max(0.0);
            state.pending_reduce = Some(partial_qty);
            if general_path && !state.be_moved {
                state.be_moved = true;
                state.stop_price = state.entry_price;
                state.pending_stop = Some(state.entry_price);
            }
        }
    } else if !state.partial_two_taken && !clean_trend && r >= 2.0 {
        state.partial_two_taken = true;
        let qty = (0.3 * state.base_quantity).min(state.total_quantity);
        state.total_quantity = (state.total_quantity - qty).max(0.0);
        state.pending_reduce = Some(qty);
    }

    // Adds.
    let add_eligible = state.be_moved
        && state.add_count < 2
        && state.clean_score >= 0.65
        && state.gate_score >= 0.7
        && state.child_snapshot.efficiency * 100.0 >= 55.0;
    if add_eligible {
        if state.add_count == 0 && r >= 1.0 {
            let qty = 0.5 * state.base_quantity;
            state.add_count = 1;
            state.total_quantity += qty;
            state.pending_add = Some(qty);
            state.pending_stop = Some(state.stop_price);
        } else if state.add_count == 1 && r >= 2.0 {
            let qty = 0.33 * state.base_quantity;
            state.add_count = 2;
            state.total_quantity += qty;
            state.pending_add = Some(qty);
            state.pending_stop = Some(state.stop_price);
        }
    }

    // Time stop.
    let thresh = ((3 * state.parent_minutes) as f64 / state.child_minutes as f64)
        .ceil()
        .max(1.0) as i64;
    let elapsed_ms = chrono::Utc::now().timestamp_millis() - state.opened_at_ms;
    let elapsed_child_candles = elapsed_ms / (state.child_minutes * 60_000).max(1);

    if state.time_stop_stage == 0 && elapsed_child_candles >= thresh && state.max_r < 0.5 {
        state.time_stop_stage = 1;
        state.time_stop_timestamp = Some(chrono::Utc::now().timestamp_millis());
        let tightened = state.entry_price - dir.sign() * 0.5 * state.initial_sl_distance;
        state.stop_price = tightened;
        state.pending_stop = Some(tightened);
    } else if state.time_stop_stage == 1 {
        if let Some(ts) = state.time_stop_timestamp {
            let since = chrono::Utc::now().timestamp_millis() - ts;
            if since >= thresh * state.child_minutes * 60_000 && state.max_r < 0.5 {
                state.time_stop_stage = 2;
            }
        }
    }

    // Structure break.
    let threshold = state.trail_price.or(Some(state.stop_price)).unwrap()
        + dir.sign() * 0.3 * state.child_atr;
    let tail: Vec<f64> = state.child_snapshot.close_history.iter().rev().take(2).copied().collect();
    if tail.len() == 2 {
        let both_wrong_side = tail.iter().all(|close| match dir {
            PositionDirection::Long => *close < threshold,
            PositionDirection::Short => *close > threshold,
        });
        if both_wrong_side {
            state.structure_break_counter += 1;
        } else {
            state.structure_break_counter = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(net_change: f64, chop: f64, efficiency: f64, align: f64) -> SymbolTimeframeMetric {
        SymbolTimeframeMetric {
            net_change,
            change_percent: net_change * 100.0,
            efficiency,
            chop,
            momentum_atr: 0.6,
            small_move_gate: 0.8,
            atr_value: 0.001,
            total_quote_volume: 1000.0,
            flow_ratio: Some(0.6),
            flow_label: Some("balanced".to_string()),
            flow_immediate_base: 0.6,
            flow_persistence: 0.4,
            align,
            mtf_consistency: 0.5,
            volume_boost: 0.6,
            active_flow: 0.6,
            core_score: 0.0,
            confirm_score: 0.0,
            final_score: 0.0,
            latest_close: 100.0,
            highest_close: 100.0,
            lowest_close: 100.0,
            close_history: vec![99.0, 100.0],
            efficiency_history: vec![0.5; 10],
            momentum_history: vec![0.6, 0.5, 0.4],
        }
    }

    /// S4: parent {chop=0.1, efficiency=0.8, align=0.8, netChange=+0.05}.
    #[test]
    fn entry_gate_scenario_computes_expected_ksl() {
        let parent = metric(0.05, 0.1, 0.8, 0.8);
        let scores = framework_scores(&parent);
        let clean = clean_p(&scores);
        let gate_c = 0.8;
        let (k_sl, sl_distance) = sizing_and_stop(clean, gate_c, 0.001, 1.0).unwrap();
        assert!((k_sl - 2.13).abs() < 0.05, "k_sl={k_sl}");
        assert!((sl_distance - 0.00213).abs() < 5e-5, "sl_distance={sl_distance}");
    }

    #[test]
    fn ksl_buffer_scales_stop_distance_without_moving_formula_bounds() {
        let parent = metric(0.05, 0.1, 0.8, 0.8);
        let scores = framework_scores(&parent);
        let clean = clean_p(&scores);
        let gate_c = 0.8;
        let (k_sl_default, sl_default) = sizing_and_stop(clean, gate_c, 0.001, 1.0).unwrap();
        let (k_sl_half, sl_half) = sizing_and_stop(clean, gate_c, 0.001, 0.5).unwrap();
        assert!((k_sl_half - k_sl_default * 0.5).abs() < 1e-9);
        assert!((sl_half - sl_default * 0.5).abs() < 1e-9);
    }

    #[test]
    fn direction_requires_trend_and_align_and_net_change_sign() {
        let long_ok = metric(0.02, 0.1, 0.8, 0.7);
        assert_eq!(direction_from_parent(&long_ok), Some(PositionDirection::Long));

        let weak_align = metric(0.02, 0.1, 0.8, 0.3);
        assert_eq!(direction_from_parent(&weak_align), None);

        let short_ok = metric(-0.02, 0.1, 0.8, 0.7);
        assert_eq!(direction_from_parent(&short_ok), Some(PositionDirection::Short));
    }

    #[test]
    fn framework_selection_prefers_1h_30m_when_strong() {
        let mut by_label = HashMap::new();
        by_label.insert("1h".to_string(), metric(0.03, 0.05, 0.8, 0.7));
        by_label.insert("30m".to_string(), metric(0.02, 0.1, 0.6, 0.6));
        let (parent, child) = select_framework(&by_label).unwrap();
        assert_eq!(parent, Timeframe::OneH);
        assert_eq!(child, Timeframe::ThirtyM);
    }

    #[test]
    fn framework_selection_falls_back_to_30m_10m() {
        let mut by_label = HashMap::new();
        by_label.insert("1h".to_string(), metric(0.01, 0.6, 0.3, 0.3)); // too weak
        by_label.insert("30m".to_string(), metric(0.02, 0.1, 0.6, 0.6));
        by_label.insert("10m".to_string(), metric(0.02, 0.1, 0.6, 0.6));
        let (parent, child) = select_framework(&by_label).unwrap();
        assert_eq!(parent, Timeframe::ThirtyM);
        assert_eq!(child, Timeframe::TenM);
    }

    #[test]
    fn size_scale_saturates_within_bounds() {
        assert_eq!(size_scale(0.0), 1.0);
        assert_eq!(size_scale(100.0), 0.2);
        assert!((size_scale(50.0) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn trailing_multiple_reduced_on_declining_efficiency() {
        let mut declining = metric(0.02, 0.1, 0.6, 0.6);
        declining.efficiency_history = (0..10).map(|i| 1.0 - i as f64 * 0.05).collect();
        declining.momentum_history = vec![0.6, 0.6, 0.6];
        let trail = trailing_atr_multiple(0.6, 0.7, &declining);

        let mut flat = declining.clone();
        flat.efficiency_history = vec![0.5; 10];
        let trail_flat = trailing_atr_multiple(0.6, 0.7, &flat);

        assert!(trail < trail_flat);
        assert!(trail >= TRAIL_MIN);
    }

    #[test]
    fn break_even_never_crosses_entry_adversely() {
        use crate::strategy::state::ManagedPositionState;

        let mut state = sample_managed_state();
        state.max_r = 1.0;
        apply_state_machine(&mut state);
        assert!(state.be_moved);
        // Long position: BE stop must stay at or below entry_price.
        assert!(state.stop_price <= state.entry_price + 1e-9);

        let entry_before = state.entry_price;
        // Run again with a worse price; BE invariant must still hold.
        state.last_price = 99.0;
        apply_state_machine(&mut state);
        assert_eq!(state.entry_price, entry_before);
        assert!(state.stop_price <= state.entry_price + 1e-9);
    }

    fn sample_managed_state() -> ManagedPositionState {
        let child = metric(0.02, 0.1, 0.6, 0.6);
        let parent = metric(0.03, 0.05, 0.8, 0.7);
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
            opened_at_ms: chrono::Utc::now().timestamp_millis(),
            add_count: 0,
            be_moved: false,
            highest_observed: 101.0,
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
            last_price: 101.0,
            parent_snapshot: parent,
            child_snapshot: child,
            pending_stop: None,
            pending_reduce: None,
            pending_add: None,
        }
    }
}
