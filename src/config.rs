// =============================================================================
// Environment configuration -- env-only, no hot reload, matching the
// teacher's `dotenv::dotenv()` + `std::env::var` pattern in `main.rs`.
// =============================================================================

use crate::types::clamp;

#[derive(Debug, Clone)]
pub struct Config {
    pub exchange_api_key: String,
    pub exchange_api_secret: String,
    pub recv_window_ms: u64,
    pub leverage: u32,
    pub refresh_interval_minutes: u64,
    pub ksl_buffer: f64,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub http_port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let exchange_api_key = std::env::var("EXCHANGE_API_KEY").unwrap_or_default();
        let exchange_api_secret = std::env::var("EXCHANGE_API_SECRET").unwrap_or_default();

        let recv_window_ms = env_parse("RECV_WINDOW", 5000);
        let leverage = env_parse::<u32>("LEVERAGE", 5).max(1);
        let refresh_interval_minutes = env_parse("REFRESH_INTERVAL_MINUTES", 10);
        let ksl_buffer = clamp(env_parse("KSL_BUFFER", 1.0), 0.5, 2.0);

        let telegram_token = std::env::var("TELEGRAM_BOT_TOKEN").ok().filter(|s| !s.is_empty());
        let telegram_chat_id = std::env::var("TELEGRAM_CHAT_ID").ok().filter(|s| !s.is_empty());

        let http_port = env_parse("HTTP_PORT", 3000);

        Self {
            exchange_api_key,
            exchange_api_secret,
            recv_window_ms,
            leverage,
            refresh_interval_minutes,
            ksl_buffer,
            telegram_token,
            telegram_chat_id,
            http_port,
        }
    }

    pub fn trading_enabled(&self) -> bool {
        !self.exchange_api_key.is_empty() && !self.exchange_api_secret.is_empty()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_to_default_on_missing_or_bad_value() {
        assert_eq!(env_parse::<u32>("PERP_MOVERS_BOT_UNSET_TEST_VAR", 5), 5);
    }

    #[test]
    fn ksl_buffer_clamped_to_bounds() {
        assert_eq!(clamp(0.1, 0.5, 2.0), 0.5);
        assert_eq!(clamp(5.0, 0.5, 2.0), 2.0);
    }
}
