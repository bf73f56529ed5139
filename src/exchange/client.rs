// =============================================================================
// Exchange Facade — typed operations over the USDⓈ-M futures REST API
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed
// requests send X-MBX-APIKEY as a header and a `recvWindow` to tolerate
// minor clock drift between this process and the exchange.
//
// Every call -- public or signed -- is routed through the shared
// `RateLimiter` so the process never exceeds the configured request
// spacing, and transient failures are retried with backoff.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::exchange::rate_limit::{classify_status, AttemptError, FailureClass, RateLimiter};
use crate::types::Candle;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds),
/// overridable via the `RECV_WINDOW` environment variable.
pub const DEFAULT_RECV_WINDOW_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct SymbolFilters {
    pub step_size: f64,
    pub min_qty: f64,
    pub min_notional: f64,
    pub price_precision: u32,
    pub quantity_precision: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookTicker {
    #[serde(rename = "symbol")]
    pub symbol: String,
    #[serde(rename = "bidPrice", deserialize_with = "de_f64")]
    pub bid_price: f64,
    #[serde(rename = "askPrice", deserialize_with = "de_f64")]
    pub ask_price: f64,
}

#[derive(Debug, Clone)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse::<f64>().map_err(serde::de::Error::custom)
}

/// USDⓈ-M futures REST client with HMAC-SHA256 request signing, routed
/// through a shared [`RateLimiter`].
pub struct ExchangeClient {
    api_key: String,
    secret: String,
    base_url: String,
    recv_window_ms: u64,
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl ExchangeClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, recv_window_ms: u64) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            recv_window_ms,
            client,
            limiter: RateLimiter::new(),
        }
    }

    /// `true` when both API credentials are present -- trading is
    /// otherwise a no-op throughout the executor.
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret.is_empty()
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    pub fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={}", self.recv_window_ms)
        } else {
            format!("{params}&timestamp={ts}&recvWindow={}", self.recv_window_ms)
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Low-level request runner: rate-limited, retried, status-classified
    // -------------------------------------------------------------------------

    async fn get_json(&self, path: &str, query: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        self.limiter
            .run(|| {
                let client = self.client.clone();
                let url = url.clone();
                async move { Self::fetch_once(client.get(&url)).await }
            })
            .await
            .map_err(|e| e)
    }

    async fn post_json(&self, path: &str, query: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        self.limiter
            .run(|| {
                let client = self.client.clone();
                let url = url.clone();
                async move { Self::fetch_once(client.post(&url)).await }
            })
            .await
    }

    async fn delete_json(&self, path: &str, query: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        self.limiter
            .run(|| {
                let client = self.client.clone();
                let url = url.clone();
                async move { Self::fetch_once(client.delete(&url)).await }
            })
            .await
    }

    async fn fetch_once(
        builder: reqwest::RequestBuilder,
    ) -> Result<serde_json::Value, AttemptError<anyhow::Error>> {
        let resp = match builder.send().await {
            Ok(r) => r,
            Err(e) => return Err(AttemptError::Transient(e.into())),
        };

        let status = resp.status();
        let body: serde_json::Value = match resp.json().await {
            Ok(b) => b,
            Err(e) => return Err(AttemptError::Transient(e.into())),
        };

        if !status.is_success() {
            let err = anyhow::anyhow!("exchange returned {}: {}", status, body);
            return match classify_status(status.as_u16()) {
                FailureClass::Permanent => Err(AttemptError::Permanent(err)),
                FailureClass::Transient => Err(AttemptError::Transient(err)),
            };
        }

        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/exchangeInfo -- tradable perpetual USDT symbols and
    /// their LOT_SIZE/MIN_NOTIONAL/price-precision filters.
    #[instrument(skip(self), name = "exchange::list_perpetuals")]
    pub async fn list_perpetuals(&self) -> Result<Vec<(String, SymbolFilters)>> {
        let body = self
            .get_json("/fapi/v1/exchangeInfo", "")
            .await
            .context("GET /fapi/v1/exchangeInfo failed")?;

        let symbols = body["symbols"]
            .as_array()
            .context("exchangeInfo response missing 'symbols'")?;

        let mut out = Vec::new();
        for s in symbols {
            let contract_type = s["contractType"].as_str().unwrap_or("");
            let quote_asset = s["quoteAsset"].as_str().unwrap_or("");
            let status = s["status"].as_str().unwrap_or("");
            if contract_type != "PERPETUAL" || quote_asset != "USDT" || status != "TRADING" {
                continue;
            }
            let symbol = match s["symbol"].as_str() {
                Some(sym) => sym.to_string(),
                None => continue,
            };

            let mut step_size = 0.0;
            let mut min_qty = 0.0;
            let mut min_notional = 0.0;
            let price_precision = s["pricePrecision"].as_u64().unwrap_or(2) as u32;
            let quantity_precision = s["quantityPrecision"].as_u64().unwrap_or(3) as u32;

            if let Some(filters) = s["filters"].as_array() {
                for f in filters {
                    match f["filterType"].as_str() {
                        Some("LOT_SIZE") => {
                            step_size = parse_f64(&f["stepSize"]).unwrap_or(0.0);
                            min_qty = parse_f64(&f["minQty"]).unwrap_or(0.0);
                        }
                        Some("MIN_NOTIONAL") => {
                            min_notional = parse_f64(&f["notional"]).unwrap_or(0.0);
                        }
                        _ => {}
                    }
                }
            }

            out.push((
                symbol,
                SymbolFilters {
                    step_size,
                    min_qty,
                    min_notional,
                    price_precision,
                    quantity_precision,
                },
            ));
        }

        debug!(count = out.len(), "tradable perpetuals listed");
        Ok(out)
    }

    /// GET /fapi/v1/ticker/24hr -- 24h quote volume per symbol.
    #[instrument(skip(self), name = "exchange::get_24h_quote_volumes")]
    pub async fn get_24h_quote_volumes(&self) -> Result<std::collections::HashMap<String, f64>> {
        let body = self
            .get_json("/fapi/v1/ticker/24hr", "")
            .await
            .context("GET /fapi/v1/ticker/24hr failed")?;

        let arr = body.as_array().context("24hr ticker response not an array")?;
        let mut out = std::collections::HashMap::with_capacity(arr.len());
        for entry in arr {
            if let (Some(symbol), Some(qv)) = (
                entry["symbol"].as_str(),
                parse_f64(&entry["quoteVolume"]),
            ) {
                out.insert(symbol.to_string(), qv);
            }
        }
        Ok(out)
    }

    /// GET /fapi/v1/klines -- 1-minute candles, newest-last.
    ///
    /// Index mapping: 0 openTime, 1 open, 2 high, 3 low, 4 close, 5 volume,
    /// 6 closeTime, 7 quoteVolume, 10 takerBuyQuoteVolume.
    #[instrument(skip(self), name = "exchange::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let query = format!("symbol={symbol}&interval={interval}&limit={limit}");
        let body = self
            .get_json("/fapi/v1/klines", &query)
            .await
            .with_context(|| format!("GET /fapi/v1/klines failed for {symbol}"))?;

        let raw = body.as_array().context("klines response not an array")?;
        let mut candles = Vec::with_capacity(raw.len());

        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 11 => a,
                _ => {
                    warn!(symbol, "skipping malformed kline entry");
                    continue;
                }
            };

            let candle = Candle {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: parse_f64(&arr[1]).unwrap_or(f64::NAN),
                high: parse_f64(&arr[2]).unwrap_or(f64::NAN),
                low: parse_f64(&arr[3]).unwrap_or(f64::NAN),
                close: parse_f64(&arr[4]).unwrap_or(f64::NAN),
                volume: parse_f64(&arr[5]).unwrap_or(f64::NAN),
                quote_volume: parse_f64(&arr[7]).unwrap_or(f64::NAN),
                taker_buy_quote_volume: parse_f64(&arr[10]).unwrap_or(f64::NAN),
            };

            if candle.is_finite() {
                candles.push(candle);
            }
        }

        Ok(candles)
    }

    /// GET /fapi/v1/ticker/bookTicker -- best bid/ask for one symbol.
    #[instrument(skip(self), name = "exchange::get_book_ticker")]
    pub async fn get_book_ticker(&self, symbol: &str) -> Result<BookTicker> {
        let query = format!("symbol={symbol}");
        let body = self
            .get_json("/fapi/v1/ticker/bookTicker", &query)
            .await
            .with_context(|| format!("GET /fapi/v1/ticker/bookTicker failed for {symbol}"))?;
        serde_json::from_value(body).context("failed to parse bookTicker response")
    }

    /// GET /fapi/v1/depth -- order book snapshot.
    #[instrument(skip(self), name = "exchange::get_depth")]
    pub async fn get_depth(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot> {
        let query = format!("symbol={symbol}&limit={limit}");
        let body = self
            .get_json("/fapi/v1/depth", &query)
            .await
            .with_context(|| format!("GET /fapi/v1/depth failed for {symbol}"))?;

        let parse_levels = |key: &str| -> Vec<DepthLevel> {
            body[key]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|lvl| {
                            let lvl = lvl.as_array()?;
                            let price = parse_f64(lvl.first()?)?;
                            let quantity = parse_f64(lvl.get(1)?)?;
                            Some(DepthLevel { price, quantity })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(DepthSnapshot {
            bids: parse_levels("bids"),
            asks: parse_levels("asks"),
        })
    }

    /// GET /fapi/v1/ticker/price -- mark/last price for one symbol.
    #[instrument(skip(self), name = "exchange::get_mark_price")]
    pub async fn get_mark_price(&self, symbol: &str) -> Result<f64> {
        let query = format!("symbol={symbol}");
        let body = self
            .get_json("/fapi/v1/ticker/price", &query)
            .await
            .with_context(|| format!("GET /fapi/v1/ticker/price failed for {symbol}"))?;
        parse_f64(&body["price"]).context("missing/invalid price field")
    }

    // -------------------------------------------------------------------------
    // Signed account endpoints
    // -------------------------------------------------------------------------

    /// GET /fapi/v2/balance (signed).
    #[instrument(skip(self), name = "exchange::get_balances")]
    pub async fn get_balances(&self) -> Result<Vec<crate::types::BalanceInfo>> {
        let qs = self.signed_query("");
        let body = self
            .get_json("/fapi/v2/balance", &qs)
            .await
            .context("GET /fapi/v2/balance failed")?;

        let arr = body.as_array().context("balance response not an array")?;
        Ok(arr
            .iter()
            .filter_map(|b| {
                let asset = b["asset"].as_str()?.to_string();
                let free = parse_f64(&b["availableBalance"]).unwrap_or(0.0);
                Some(crate::types::BalanceInfo {
                    asset,
                    free,
                    locked: 0.0,
                })
            })
            .collect())
    }

    /// GET /fapi/v2/positionRisk (signed).
    #[instrument(skip(self), name = "exchange::get_positions")]
    pub async fn get_positions(&self) -> Result<Vec<crate::types::PositionSummary>> {
        let qs = self.signed_query("");
        let body = self
            .get_json("/fapi/v2/positionRisk", &qs)
            .await
            .context("GET /fapi/v2/positionRisk failed")?;

        let arr = body.as_array().context("positionRisk response not an array")?;
        let mut by_symbol: std::collections::HashMap<String, crate::types::PositionSummary> =
            std::collections::HashMap::new();

        for p in arr {
            let symbol = match p["symbol"].as_str() {
                Some(s) => s.to_string(),
                None => continue,
            };
            let qty = parse_f64(&p["positionAmt"]).unwrap_or(0.0);
            let entry_price = parse_f64(&p["entryPrice"]).unwrap_or(0.0);
            let upnl = parse_f64(&p["unRealizedProfit"]).unwrap_or(0.0);
            let side = p["positionSide"].as_str().unwrap_or("BOTH");

            let entry = by_symbol
                .entry(symbol.clone())
                .or_insert_with(|| crate::types::PositionSummary {
                    symbol: symbol.clone(),
                    net: 0.0,
                    long: None,
                    short: None,
                    unrealized_pnl: 0.0,
                });

            entry.net += qty;
            entry.unrealized_pnl += upnl;

            let leg = crate::types::PositionLeg {
                quantity: qty.abs(),
                entry_price,
                unrealized_pnl: upnl,
            };
            match side {
                "LONG" => entry.long = Some(leg),
                "SHORT" => entry.short = Some(leg),
                _ => {
                    if qty > 0.0 {
                        entry.long = Some(leg);
                    } else if qty < 0.0 {
                        entry.short = Some(leg);
                    }
                }
            }
        }

        Ok(by_symbol.into_values().collect())
    }

    /// POST /fapi/v1/positionSide/dual (signed) -- enable/disable dual-side
    /// position mode. Idempotent: Binance's "no change" error is swallowed.
    #[instrument(skip(self), name = "exchange::set_dual_side")]
    pub async fn set_dual_side(&self, dual_side: bool) -> Result<()> {
        let params = format!("dualSidePosition={}", dual_side);
        let qs = self.signed_query(&params);
        match self.post_json("/fapi/v1/positionSide/dual", &qs).await {
            Ok(_) => Ok(()),
            Err(e) if is_no_change_error(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// POST /fapi/v1/marginType (signed). Error -4046 ("no change") is
    /// treated as success per spec.
    #[instrument(skip(self), name = "exchange::set_margin_type")]
    pub async fn set_margin_type(&self, symbol: &str, margin_type: &str) -> Result<()> {
        let params = format!("symbol={symbol}&marginType={margin_type}");
        let qs = self.signed_query(&params);
        match self.post_json("/fapi/v1/marginType", &qs).await {
            Ok(_) => Ok(()),
            Err(e) if is_no_change_error(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// POST /fapi/v1/leverage (signed).
    #[instrument(skip(self), name = "exchange::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        let qs = self.signed_query(&params);
        self.post_json("/fapi/v1/leverage", &qs).await?;
        Ok(())
    }

    /// POST /fapi/v1/order (signed) -- submit any order type. Returns the
    /// raw exchange response so the executor can extract `avgPrice`/`executedQty`.
    #[instrument(skip(self), name = "exchange::post_order", fields(symbol, side, order_type))]
    pub async fn post_order(&self, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        self.post_json("/fapi/v1/order", &qs).await
    }

    /// DELETE /fapi/v1/allOpenOrders (signed) -- cancel every open order on
    /// a symbol.
    #[instrument(skip(self), name = "exchange::cancel_all_orders")]
    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let params = format!("symbol={symbol}");
        let qs = self.signed_query(&params);
        self.delete_json("/fapi/v1/allOpenOrders", &qs).await?;
        Ok(())
    }

    /// GET /fapi/v1/openOrders (signed).
    #[instrument(skip(self), name = "exchange::get_open_orders")]
    pub async fn get_open_orders(&self, symbol: &str) -> Result<Vec<serde_json::Value>> {
        let params = format!("symbol={symbol}");
        let qs = self.signed_query(&params);
        let body = self.get_json("/fapi/v1/openOrders", &qs).await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }
}

fn is_no_change_error(err: &anyhow::Error) -> bool {
    err.to_string().contains("-4046")
}

fn parse_f64(val: &serde_json::Value) -> Option<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>().ok()
    } else {
        val.as_f64()
    }
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_for_same_key_and_query() {
        let client = ExchangeClient::new("key", "secret", DEFAULT_RECV_WINDOW_MS);
        let a = client.sign("symbol=BTCUSDT&timestamp=1");
        let b = client.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // hex-encoded SHA256
    }

    #[test]
    fn has_credentials_requires_both() {
        assert!(!ExchangeClient::new("", "", 5000).has_credentials());
        assert!(!ExchangeClient::new("k", "", 5000).has_credentials());
        assert!(ExchangeClient::new("k", "s", 5000).has_credentials());
    }

    #[test]
    fn is_no_change_error_matches_4046() {
        let e = anyhow::anyhow!("exchange returned 400 Bad Request: {{\"code\":-4046,\"msg\":\"No need to change margin type.\"}}");
        assert!(is_no_change_error(&e));
        let other = anyhow::anyhow!("exchange returned 400 Bad Request: {{\"code\":-1121}}");
        assert!(!is_no_change_error(&other));
    }
}
