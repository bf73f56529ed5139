// =============================================================================
// Rate-Limited Fetcher — serializes outbound exchange calls
// =============================================================================
//
// A single process-wide gate: every outbound call (public or signed) waits
// for `REQUEST_INTERVAL_MS` to elapse since the previous request started,
// then proceeds. Transient failures (network errors, 5xx, 429) are retried
// with exponential backoff; 4xx (except 429) is surfaced immediately as
// non-retryable.
// =============================================================================

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Minimum spacing between the start of consecutive requests.
pub const REQUEST_INTERVAL_MS: u64 = 150;
/// Maximum number of attempts (1 initial + up to 4 retries).
pub const MAX_RETRY_ATTEMPTS: u32 = 5;
/// Base backoff delay, doubled on each retry.
pub const RETRY_BACKOFF_BASE_MS: u64 = 500;
/// Backoff delay ceiling.
pub const MAX_RETRY_BACKOFF_MS: u64 = 4000;

/// Whether a failure should be retried or surfaced immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network error, 5xx, or 429 -- worth retrying.
    Transient,
    /// 4xx other than 429 -- retrying would just repeat the same rejection.
    Permanent,
}

/// Classify an HTTP status code per spec: [400,500) excluding 429 is
/// permanent, everything else (including network errors, modeled by the
/// caller before it has a status at all) is transient.
pub fn classify_status(status: u16) -> FailureClass {
    if (400..500).contains(&status) && status != 429 {
        FailureClass::Permanent
    } else {
        FailureClass::Transient
    }
}

/// Outcome of an attempted call for retry accounting.
pub enum AttemptError<E> {
    Transient(E),
    Permanent(E),
}

impl<E> AttemptError<E> {
    pub fn into_inner(self) -> E {
        match self {
            AttemptError::Transient(e) => e,
            AttemptError::Permanent(e) => e,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            AttemptError::Transient(_) => FailureClass::Transient,
            AttemptError::Permanent(_) => FailureClass::Permanent,
        }
    }
}

/// Serializes outbound requests to a minimum spacing and retries transient
/// failures with exponential backoff.
///
/// `acquire` is the suspension point that enforces spacing; the caller
/// performs the actual HTTP request between `acquire` and releasing the
/// guard implicitly (the mutex is held only long enough to record the send
/// timestamp, not for the full request -- see `run`).
pub struct RateLimiter {
    last_sent: Mutex<Option<Instant>>,
    interval: Duration,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            last_sent: Mutex::new(None),
            interval: Duration::from_millis(REQUEST_INTERVAL_MS),
        }
    }

    #[cfg(test)]
    pub fn with_interval_ms(ms: u64) -> Self {
        Self {
            last_sent: Mutex::new(None),
            interval: Duration::from_millis(ms),
        }
    }

    /// Wait until at least `interval` has elapsed since the previous
    /// request was dispatched, then record this dispatch.
    async fn acquire(&self) {
        let mut guard = self.last_sent.lock().await;
        if let Some(last) = *guard {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }

    /// Run `attempt` under rate-limit spacing, retrying transient failures
    /// with exponential backoff up to [`MAX_RETRY_ATTEMPTS`].
    ///
    /// `attempt` is called once per try; it classifies its own failures via
    /// the `AttemptError` wrapper so network errors (no status code) and
    /// HTTP status codes share one retry path.
    pub async fn run<T, E, F, Fut>(&self, mut attempt: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, AttemptError<E>>>,
    {
        let mut backoff_ms = RETRY_BACKOFF_BASE_MS;
        let mut last_err = None;

        for try_num in 1..=MAX_RETRY_ATTEMPTS {
            self.acquire().await;

            match attempt().await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Permanent(e)) => {
                    warn!(try_num, "non-retryable failure, surfacing immediately");
                    return Err(e);
                }
                Err(AttemptError::Transient(e)) => {
                    if try_num == MAX_RETRY_ATTEMPTS {
                        last_err = Some(e);
                        break;
                    }
                    debug!(
                        try_num,
                        backoff_ms, "transient failure, retrying after backoff"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(MAX_RETRY_BACKOFF_MS);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.expect("loop always sets last_err before exhausting attempts"))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn classify_status_marks_429_transient() {
        assert_eq!(classify_status(429), FailureClass::Transient);
        assert_eq!(classify_status(500), FailureClass::Transient);
        assert_eq!(classify_status(502), FailureClass::Transient);
        assert_eq!(classify_status(404), FailureClass::Permanent);
        assert_eq!(classify_status(400), FailureClass::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn spacing_enforced_between_requests() {
        let limiter = RateLimiter::with_interval_ms(150);
        let calls = Arc::new(AtomicU32::new(0));

        let mut starts = Vec::new();
        for _ in 0..3 {
            limiter.acquire().await;
            starts.push(Instant::now());
            calls.fetch_add(1, Ordering::SeqCst);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        for pair in starts.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds_in_three_attempts() {
        let limiter = RateLimiter::with_interval_ms(1);
        let attempts = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let a = attempts.clone();
        let result: Result<&str, &str> = limiter
            .run(|| {
                let a = a.clone();
                async move {
                    let n = a.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(AttemptError::Transient("boom"))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // base + 2*base = 1500ms minimum total delay across two retries.
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_surfaces_immediately() {
        let limiter = RateLimiter::with_interval_ms(1);
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();

        let result: Result<&str, &str> = limiter
            .run(|| {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(AttemptError::Permanent("rejected"))
                }
            })
            .await;

        assert_eq!(result, Err("rejected"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_retries_and_surfaces_last_error() {
        let limiter = RateLimiter::with_interval_ms(1);
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();

        let result: Result<&str, u32> = limiter
            .run(|| {
                let a = a.clone();
                async move {
                    let n = a.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(AttemptError::Transient(n))
                }
            })
            .await;

        assert_eq!(result, Err(MAX_RETRY_ATTEMPTS));
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_RETRY_ATTEMPTS);
    }
}
