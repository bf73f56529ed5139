// =============================================================================
// Trading Executor (C8) -- account state cache, leverage/margin setup,
// order placement, quantity/price quantization.
// =============================================================================
//
// Single writer for live exchange state: positions and balances are only
// ever mutated here, from `refresh_state`, and always re-synced after a
// mutating order call before any new sizing decision is made.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::exchange::{ExchangeClient, SymbolFilters};
use crate::types::{BalanceInfo, PositionDirection, PositionSummary, QUANTITY_EPSILON};

pub const MAX_POSITIONS: usize = 5;
const FILTER_CACHE_TTL: Duration = Duration::from_secs(30 * 60);
const RESIDUAL_THRESHOLD: f64 = 0.001;

/// Result of a successful order fill, derived from the exchange response
/// with a fallback to the caller-supplied reference price.
#[derive(Debug, Clone, Copy)]
pub struct OrderFill {
    pub executed_qty: f64,
    pub avg_price: f64,
}

struct CachedFilters {
    filters: SymbolFilters,
    fetched_at: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AccountState {
    pub total_wallet_balance: f64,
    pub available_balance: f64,
    pub unrealized_pnl: f64,
}

pub struct Executor {
    client: ExchangeClient,
    leverage: u32,
    account: RwLock<AccountState>,
    positions: RwLock<HashMap<String, PositionSummary>>,
    filter_cache: RwLock<HashMap<String, CachedFilters>>,
    dual_side_configured: RwLock<bool>,
}

impl Executor {
    pub fn new(client: ExchangeClient, leverage: u32) -> Self {
        Self {
            client,
            leverage: leverage.max(1),
            account: RwLock::new(AccountState::default()),
            positions: RwLock::new(HashMap::new()),
            filter_cache: RwLock::new(HashMap::new()),
            dual_side_configured: RwLock::new(false),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.client.has_credentials()
    }

    /// Enable dual-side position mode (idempotent) and load initial state.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        if !self.has_credentials() {
            return Ok(());
        }
        self.client.set_dual_side(true).await?;
        *self.dual_side_configured.write() = true;
        self.refresh_state().await
    }

    pub async fn refresh_state(&self) -> anyhow::Result<()> {
        if !self.has_credentials() {
            return Ok(());
        }
        let balances = self.client.get_balances().await?;
        let positions = self.client.get_positions().await?;

        let usdt = balances
            .iter()
            .find(|b: &&BalanceInfo| b.asset == "USDT")
            .map(|b| b.free)
            .unwrap_or(0.0);

        *self.account.write() = AccountState {
            total_wallet_balance: usdt,
            available_balance: usdt,
            unrealized_pnl: positions.iter().map(|p| p.unrealized_pnl).sum(),
        };

        let mut map = HashMap::new();
        for p in positions {
            map.insert(p.symbol.clone(), p);
        }
        *self.positions.write() = map;

        Ok(())
    }

    pub fn account_state(&self) -> AccountState {
        *self.account.read()
    }

    pub fn position(&self, symbol: &str) -> Option<PositionSummary> {
        self.positions.read().get(symbol).cloned()
    }

    pub fn open_position_count(&self) -> usize {
        self.positions
            .read()
            .values()
            .filter(|p| p.net.abs() > QUANTITY_EPSILON || p.long.is_some() || p.short.is_some())
            .count()
    }

    pub fn can_open_position(&self, symbol: &str) -> bool {
        if !self.has_credentials() {
            return false;
        }
        if self.positions.read().contains_key(symbol) {
            return false;
        }
        self.open_position_count() < MAX_POSITIONS
    }

    async fn symbol_filters(&self, symbol: &str) -> anyhow::Result<SymbolFilters> {
        {
            let cache = self.filter_cache.read();
            if let Some(entry) = cache.get(symbol) {
                if entry.fetched_at.elapsed() < FILTER_CACHE_TTL {
                    return Ok(entry.filters.clone());
                }
            }
        }

        let all = self.client.list_perpetuals().await?;
        let mut cache = self.filter_cache.write();
        for (sym, filters) in all {
            cache.insert(
                sym,
                CachedFilters {
                    filters: filters.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }

        cache
            .get(symbol)
            .map(|e| e.filters.clone())
            .ok_or_else(|| anyhow::anyhow!("symbol not found in exchangeInfo: {symbol}"))
    }

    async fn ensure_leverage_and_margin(&self, symbol: &str) -> anyhow::Result<()> {
        self.client.set_margin_type(symbol, "CROSSED").await?;
        self.client.set_leverage(symbol, self.leverage).await?;
        Ok(())
    }

    /// Market-enter a new position sized from wallet balance and leverage.
    pub async fn create_market_order(
        &self,
        symbol: &str,
        direction: PositionDirection,
        size_scale: f64,
    ) -> Option<OrderFill> {
        if !self.has_credentials() {
            return None;
        }
        let size_scale = size_scale.clamp(0.1, 1.0);

        let mark_price = match self.client.get_mark_price(symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!(symbol, error = %e, "create_market_order: mark price fetch failed");
                return None;
            }
        };

        if let Err(e) = self.ensure_leverage_and_margin(symbol).await {
            warn!(symbol, error = %e, "create_market_order: leverage/margin setup failed");
            return None;
        }

        let filters = match self.symbol_filters(symbol).await {
            Ok(f) => f,
            Err(e) => {
                warn!(symbol, error = %e, "create_market_order: filter lookup failed");
                return None;
            }
        };

        let wallet = self.account.read().total_wallet_balance;
        let margin = (wallet / 5.0) * size_scale;
        let notional = margin * self.leverage as f64;
        let raw_qty = notional / mark_price;

        let qty = quantize_quantity(raw_qty, &filters, mark_price);
        if qty <= 0.0 {
            warn!(symbol, "create_market_order: quantity rounds to zero, skipping");
            return None;
        }

        let qty_str = format!("{:.*}", filters.quantity_precision as usize, qty);
        let params = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={qty_str}&positionSide={position_side}",
            side = order_side(direction, false),
            position_side = direction,
        );

        let response = match self.client.post_order(&params).await {
            Ok(r) => r,
            Err(e) => {
                warn!(symbol, error = %e, "create_market_order: order rejected");
                return None;
            }
        };

        let fill = extract_fill(&response, qty, mark_price);
        if let Err(e) = self.refresh_state().await {
            warn!(symbol, error = %e, "create_market_order: post-fill refresh failed");
        }
        Some(fill)
    }

    /// Place a reduce-only STOP_MARKET for an existing position leg.
    pub async fn place_stop_loss(
        &self,
        symbol: &str,
        direction: PositionDirection,
        qty: f64,
        stop_price: f64,
    ) -> Option<OrderFill> {
        if !self.has_credentials() {
            return None;
        }
        let filters = match self.symbol_filters(symbol).await {
            Ok(f) => f,
            Err(e) => {
                warn!(symbol, error = %e, "place_stop_loss: filter lookup failed");
                return None;
            }
        };

        let qty_str = format!("{:.*}", filters.quantity_precision as usize, qty);
        let price_str = format!("{:.*}", filters.price_precision as usize, stop_price.max(0.0001));
        let params = format!(
            "symbol={symbol}&side={side}&type=STOP_MARKET&quantity={qty_str}&stopPrice={price_str}\
             &positionSide={position_side}&timeInForce=GTC&workingType=CONTRACT_PRICE",
            side = order_side(direction, true),
            position_side = direction,
        );

        match self.client.post_order(&params).await {
            Ok(r) => Some(extract_fill(&r, qty, stop_price)),
            Err(e) => {
                warn!(symbol, error = %e, "place_stop_loss: order rejected");
                None
            }
        }
    }

    /// Cancel existing stops on the symbol and place a new one.
    pub async fn replace_stop_loss(
        &self,
        symbol: &str,
        direction: PositionDirection,
        qty: f64,
        stop_price: f64,
    ) -> Option<OrderFill> {
        if let Err(e) = self.client.cancel_all_orders(symbol).await {
            warn!(symbol, error = %e, "replace_stop_loss: cancel failed, placing anyway");
        }
        self.place_stop_loss(symbol, direction, qty, stop_price).await
    }

    pub async fn reduce_position(
        &self,
        symbol: &str,
        direction: PositionDirection,
        qty: f64,
    ) -> Option<OrderFill> {
        self.market_adjust(symbol, direction, qty, true).await
    }

    pub async fn increase_position(
        &self,
        symbol: &str,
        direction: PositionDirection,
        qty: f64,
    ) -> Option<OrderFill> {
        self.market_adjust(symbol, direction, qty, false).await
    }

    async fn market_adjust(
        &self,
        symbol: &str,
        direction: PositionDirection,
        qty: f64,
        reducing: bool,
    ) -> Option<OrderFill> {
        if !self.has_credentials() || qty <= 0.0 {
            return None;
        }
        let filters = match self.symbol_filters(symbol).await {
            Ok(f) => f,
            Err(e) => {
                warn!(symbol, error = %e, "market_adjust: filter lookup failed");
                return None;
            }
        };
        let qty_str = format!("{:.*}", filters.quantity_precision as usize, qty);
        let params = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={qty_str}&positionSide={position_side}",
            side = order_side(direction, reducing),
            position_side = direction,
        );

        let price_hint = self.client.get_mark_price(symbol).await.unwrap_or(0.0);
        match self.client.post_order(&params).await {
            Ok(r) => {
                let fill = extract_fill(&r, qty, price_hint);
                if let Err(e) = self.refresh_state().await {
                    warn!(symbol, error = %e, "market_adjust: post-fill refresh failed");
                }
                Some(fill)
            }
            Err(e) => {
                warn!(symbol, error = %e, "market_adjust: order rejected");
                None
            }
        }
    }

    /// Market-reduce any leg below `RESIDUAL_THRESHOLD` to zero.
    pub async fn flatten_residual_positions(&self, symbol: &str) {
        let Some(position) = self.position(symbol) else { return };
        for direction in [PositionDirection::Long, PositionDirection::Short] {
            if let Some(leg) = position.leg(direction) {
                if leg.quantity > 0.0 && leg.quantity < RESIDUAL_THRESHOLD {
                    info!(symbol, %direction, qty = leg.quantity, "flattening residual position");
                    self.reduce_position(symbol, direction, leg.quantity).await;
                }
            }
        }
    }

    pub async fn get_mark_price(&self, symbol: &str) -> anyhow::Result<f64> {
        self.client.get_mark_price(symbol).await
    }
}

/// A single price observation delivered to a `subscribe_price_stream` callback.
#[derive(Debug, Clone, Copy)]
pub struct PriceTick {
    pub mark_price: f64,
    pub time_ms: i64,
}

/// Default REST-polling interval for `subscribe_price_stream`.
const PRICE_POLL_INTERVAL: Duration = Duration::from_secs(5);

impl Executor {
    /// Poll `getMarkPrice` on an interval and deliver ticks to `tx` until the
    /// returned handle is aborted. The strategy engine tolerates either this
    /// REST-polling degradation or a richer push-based stream.
    pub fn subscribe_price_stream(
        self: std::sync::Arc<Self>,
        symbol: String,
        tx: tokio::sync::mpsc::UnboundedSender<PriceTick>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRICE_POLL_INTERVAL);
            loop {
                interval.tick().await;
                match self.client.get_mark_price(&symbol).await {
                    Ok(price) => {
                        let tick = PriceTick {
                            mark_price: price,
                            time_ms: chrono::Utc::now().timestamp_millis(),
                        };
                        if tx.send(tick).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(symbol, error = %e, "price stream poll failed");
                    }
                }
            }
        })
    }
}

fn order_side(direction: PositionDirection, reducing: bool) -> &'static str {
    match (direction, reducing) {
        (PositionDirection::Long, false) => "BUY",
        (PositionDirection::Long, true) => "SELL",
        (PositionDirection::Short, false) => "SELL",
        (PositionDirection::Short, true) => "BUY",
    }
}

fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).floor() * step
}

fn ceil_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).ceil() * step
}

/// Clamp to `minQty`, floor to `stepSize`, then bump up to the minimum
/// notional if the floored quantity would fall under it.
fn quantize_quantity(raw_qty: f64, filters: &SymbolFilters, price: f64) -> f64 {
    let mut qty = raw_qty.max(filters.min_qty);
    qty = floor_to_step(qty, filters.step_size.max(f64::MIN_POSITIVE));

    if price > 0.0 && filters.min_notional > 0.0 && qty * price < filters.min_notional {
        let min_qty_for_notional = filters.min_notional / price;
        qty = ceil_to_step(min_qty_for_notional, filters.step_size.max(f64::MIN_POSITIVE));
    }

    qty
}

fn extract_fill(response: &serde_json::Value, fallback_qty: f64, fallback_price: f64) -> OrderFill {
    let executed_qty = response["executedQty"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .or_else(|| response["executedQty"].as_f64())
        .filter(|q| *q > 0.0)
        .unwrap_or(fallback_qty);

    let avg_price = response["avgPrice"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .or_else(|| response["avgPrice"].as_f64())
        .filter(|p| *p > 0.0)
        .unwrap_or(fallback_price);

    OrderFill { executed_qty, avg_price }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters() -> SymbolFilters {
        SymbolFilters {
            step_size: 0.001,
            min_qty: 0.001,
            min_notional: 5.0,
            price_precision: 2,
            quantity_precision: 3,
        }
    }

    #[test]
    fn quantize_floors_to_step_size() {
        let q = quantize_quantity(0.1234, &filters(), 100.0);
        assert!((q - 0.123).abs() < 1e-9);
    }

    #[test]
    fn quantize_bumps_up_to_min_notional() {
        // raw notional = 0.002 * 100 = 0.2, under the 5.0 floor.
        let q = quantize_quantity(0.002, &filters(), 100.0);
        assert!(q * 100.0 >= 5.0);
    }

    #[test]
    fn order_side_flips_for_reduce() {
        assert_eq!(order_side(PositionDirection::Long, false), "BUY");
        assert_eq!(order_side(PositionDirection::Long, true), "SELL");
        assert_eq!(order_side(PositionDirection::Short, false), "SELL");
        assert_eq!(order_side(PositionDirection::Short, true), "BUY");
    }

    #[test]
    fn extract_fill_falls_back_when_fields_absent() {
        let response = serde_json::json!({});
        let fill = extract_fill(&response, 1.5, 100.0);
        assert_eq!(fill.executed_qty, 1.5);
        assert_eq!(fill.avg_price, 100.0);
    }

    #[test]
    fn extract_fill_prefers_response_fields() {
        let response = serde_json::json!({ "executedQty": "2.5", "avgPrice": "101.3" });
        let fill = extract_fill(&response, 1.5, 100.0);
        assert_eq!(fill.executed_qty, 2.5);
        assert_eq!(fill.avg_price, 101.3);
    }

    #[test]
    fn can_open_position_requires_credentials() {
        let client = ExchangeClient::new("", "", 5000);
        let executor = Executor::new(client, 5);
        assert!(!executor.can_open_position("BTCUSDT"));
    }
}
