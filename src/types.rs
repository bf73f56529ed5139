// =============================================================================
// Shared data model for the movers pipeline and strategy engine
// =============================================================================
//
// Every type that crosses a component boundary lives here so the pipeline
// stages (universe -> fetch -> metrics -> fuser -> strategy) share one
// vocabulary instead of ad-hoc tuples or JSON values.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// A single 1-minute OHLCV candle, keyed by `open_time`.
///
/// Invariant: within a series, `open_time` is strictly increasing. Rows with
/// a non-finite field are dropped by the caller before construction, not
/// zero-filled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub taker_buy_quote_volume: f64,
}

impl Candle {
    /// `true` if every numeric field is finite.
    pub fn is_finite(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite()
            && self.quote_volume.is_finite()
            && self.taker_buy_quote_volume.is_finite()
    }
}

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

/// The four metric timeframes the engine evaluates per symbol.
///
/// Kept as a typed enum (rather than bare string keys) so an unknown
/// timeframe is a compile error, not a silent map miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeframe {
    TenM,
    ThirtyM,
    OneH,
    TwoH,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [
        Timeframe::TenM,
        Timeframe::ThirtyM,
        Timeframe::OneH,
        Timeframe::TwoH,
    ];

    pub fn minutes(self) -> i64 {
        match self {
            Timeframe::TenM => 10,
            Timeframe::ThirtyM => 30,
            Timeframe::OneH => 60,
            Timeframe::TwoH => 120,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Timeframe::TenM => "10m",
            Timeframe::ThirtyM => "30m",
            Timeframe::OneH => "1h",
            Timeframe::TwoH => "2h",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "10m" => Some(Timeframe::TenM),
            "30m" => Some(Timeframe::ThirtyM),
            "1h" => Some(Timeframe::OneH),
            "2h" => Some(Timeframe::TwoH),
            _ => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl Serialize for Timeframe {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Timeframe::from_label(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown timeframe: {s}")))
    }
}

// ---------------------------------------------------------------------------
// SymbolTimeframeMetric
// ---------------------------------------------------------------------------

/// Bound applied to the per-symbol rolling history arrays.
pub const HISTORY_CAP: usize = 240;

/// Movement-quality metrics for one (symbol, timeframe) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolTimeframeMetric {
    pub net_change: f64,
    pub change_percent: f64,
    pub efficiency: f64,
    pub chop: f64,
    pub momentum_atr: f64,
    pub small_move_gate: f64,
    pub atr_value: f64,
    pub total_quote_volume: f64,

    pub flow_ratio: Option<f64>,
    pub flow_label: Option<String>,
    pub flow_immediate_base: f64,
    pub flow_persistence: f64,

    pub align: f64,
    pub mtf_consistency: f64,
    pub volume_boost: f64,
    pub active_flow: f64,

    pub core_score: f64,
    pub confirm_score: f64,
    pub final_score: f64,

    pub latest_close: f64,
    pub highest_close: f64,
    pub lowest_close: f64,

    pub close_history: Vec<f64>,
    pub efficiency_history: Vec<f64>,
    pub momentum_history: Vec<f64>,
}

impl SymbolTimeframeMetric {
    /// Append a new observation to each bounded history array, trimming from
    /// the front once [`HISTORY_CAP`] is exceeded.
    pub fn push_history(&mut self, close: f64, efficiency: f64, momentum: f64) {
        push_capped(&mut self.close_history, close);
        push_capped(&mut self.efficiency_history, efficiency);
        push_capped(&mut self.momentum_history, momentum);

        self.latest_close = close;
        self.highest_close = self.highest_close.max(close);
        self.lowest_close = if self.lowest_close == 0.0 {
            close
        } else {
            self.lowest_close.min(close)
        };
    }
}

fn push_capped(history: &mut Vec<f64>, value: f64) {
    history.push(value);
    if history.len() > HISTORY_CAP {
        let excess = history.len() - HISTORY_CAP;
        history.drain(0..excess);
    }
}

/// Scores surfaced to the strategy engine for one metric bundle -- see
/// "Framework selection" in the strategy engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FrameworkScores {
    pub trend: f64,
    pub efficiency: f64,
    pub align: f64,
    pub volume: f64,
    pub flow: f64,
}

// ---------------------------------------------------------------------------
// Movers output types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoversScores {
    pub core_score: f64,
    pub confirm_score: f64,
    pub final_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoversEntry {
    pub symbol: String,
    pub last_price: f64,
    pub change_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_label: Option<String>,
    pub scores: MoversScores,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoversSnapshot {
    pub timeframe: Timeframe,
    pub top_gainers: Vec<MoversEntry>,
    pub top_losers: Vec<MoversEntry>,
    pub changes: HashMap<String, f64>,
    pub window: Window,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedMoversEntry {
    pub entry: MoversEntry,
    pub timeframe: Timeframe,
    pub window: Window,
    pub changes: HashMap<String, f64>,
    pub metrics: SymbolTimeframeMetric,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoversResult {
    pub snapshots: HashMap<String, MoversSnapshot>,
    pub aggregated_top: Vec<AggregatedMoversEntry>,
    pub metrics: HashMap<String, HashMap<String, SymbolTimeframeMetric>>,
    /// Per-symbol liquidity penalty from the probe, already folded into
    /// `finalScore` but also kept keyed by symbol for the strategy engine's
    /// entry-gate check.
    pub liquidity_penalty: HashMap<String, f64>,
}

// ---------------------------------------------------------------------------
// Exchange account/position view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionDirection {
    Long,
    Short,
}

impl PositionDirection {
    pub fn sign(self) -> f64 {
        match self {
            PositionDirection::Long => 1.0,
            PositionDirection::Short => -1.0,
        }
    }

    pub fn opposite(self) -> PositionDirection {
        match self {
            PositionDirection::Long => PositionDirection::Short,
            PositionDirection::Short => PositionDirection::Long,
        }
    }
}

impl std::fmt::Display for PositionDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionDirection::Long => write!(f, "LONG"),
            PositionDirection::Short => write!(f, "SHORT"),
        }
    }
}

/// One side of a position (long or short leg) as reported by the exchange.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PositionLeg {
    pub quantity: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

/// Exchange-reported position state for a symbol. Under dual-side mode a
/// symbol may carry both a long and a short leg simultaneously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSummary {
    pub symbol: String,
    pub net: f64,
    pub long: Option<PositionLeg>,
    pub short: Option<PositionLeg>,
    pub unrealized_pnl: f64,
}

impl PositionSummary {
    pub fn leg(&self, direction: PositionDirection) -> Option<&PositionLeg> {
        match direction {
            PositionDirection::Long => self.long.as_ref(),
            PositionDirection::Short => self.short.as_ref(),
        }
    }
}

/// Quantities below this are treated as "no position".
pub const QUANTITY_EPSILON: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Small math helpers shared across components
// ---------------------------------------------------------------------------

pub fn clamp(value: f64, lo: f64, hi: f64) -> f64 {
    if value.is_nan() {
        return lo;
    }
    value.max(lo).min(hi)
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Sign of `x`, zero-aware unlike `f64::signum` (which returns `1.0` for
/// `0.0`). Used anywhere a zero net-change must be treated as "no signal"
/// rather than "positive".
pub fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_zero_at_zero() {
        assert_eq!(sign(0.0), 0.0);
        assert_eq!(sign(2.5), 1.0);
        assert_eq!(sign(-2.5), -1.0);
    }

    #[test]
    fn candle_is_finite_detects_nan() {
        let mut c = Candle {
            open_time: 0,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            quote_volume: 1.0,
            taker_buy_quote_volume: 1.0,
        };
        assert!(c.is_finite());
        c.close = f64::NAN;
        assert!(!c.is_finite());
    }

    #[test]
    fn timeframe_roundtrips_label() {
        for tf in Timeframe::ALL {
            assert_eq!(Timeframe::from_label(tf.label()), Some(tf));
        }
        assert_eq!(Timeframe::from_label("3h"), None);
    }

    #[test]
    fn history_push_caps_at_240() {
        let mut m = SymbolTimeframeMetric {
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
        };
        for i in 0..300 {
            m.push_history(i as f64, 0.5, 0.5);
        }
        assert_eq!(m.close_history.len(), HISTORY_CAP);
        assert_eq!(m.close_history[0], 60.0);
        assert_eq!(m.highest_close, 299.0);
    }

    #[test]
    fn clamp_rejects_nan_to_low() {
        assert_eq!(clamp(f64::NAN, 0.0, 1.0), 0.0);
        assert_eq!(clamp(5.0, 0.0, 1.0), 1.0);
        assert_eq!(clamp(-5.0, 0.0, 1.0), 0.0);
    }
}
