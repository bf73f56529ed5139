//! Exchange Facade -- typed, rate-limited access to the USDⓈ-M futures REST API.

pub mod client;
pub mod rate_limit;

pub use client::{BookTicker, DepthLevel, DepthSnapshot, ExchangeClient, SymbolFilters};
pub use rate_limit::{classify_status, AttemptError, FailureClass, RateLimiter};
