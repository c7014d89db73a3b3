//! HTTP retry policy with exponential backoff.
//!
//! Policy: up to 2 retries (3 total attempts), 500ms initial delay doubling
//! to an 8s cap, down-jitter up to 25%. Retryable: HTTP 408, 409, 429, 5xx,
//! and connection/timeout errors. A server `x-should-retry` header
//! overrides the status-based decision, and `Retry-After`/`Retry-After-Ms`
//! override the computed delay. Every attempt of one logical request sends
//! the same `Idempotency-Key`.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode, header::HeaderMap};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Down-jitter factor: delay is multiplied by `[1 - jitter, 1.0]`.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.25,
        }
    }
}

/// Structurally distinguishes success from the failure modes so callers
/// cannot mistake an error response for success.
#[derive(Debug)]
pub enum RetryOutcome {
    /// 2xx response.
    Success(Response),
    /// Non-2xx after exhausting retries (or a non-retryable status);
    /// carries the response for error-body inspection.
    HttpError(Response),
    /// Transport failure after exhausting retries.
    ConnectionError {
        attempts: u32,
        source: reqwest::Error,
    },
    /// Transport failure that was never worth retrying.
    NonRetryable(reqwest::Error),
}

impl RetryOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Parse `Retry-After-Ms` (float milliseconds) or `Retry-After` (integer
/// seconds). Values outside `(0, 60s)` are ignored.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let in_range = |d: Duration| d > Duration::ZERO && d < Duration::from_secs(60);

    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
    {
        let delay = Duration::from_secs_f64(ms / 1000.0);
        if in_range(delay) {
            return Some(delay);
        }
    }

    if let Some(secs) = headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
    {
        let delay = Duration::from_secs(secs);
        if in_range(delay) {
            return Some(delay);
        }
    }

    None
}

/// Whether a response status warrants another attempt, respecting the
/// server's `x-should-retry` override.
#[must_use]
pub fn should_retry(status: StatusCode, headers: &HeaderMap) -> bool {
    if let Some(flag) = headers.get("x-should-retry").and_then(|v| v.to_str().ok()) {
        if flag.eq_ignore_ascii_case("true") {
            return true;
        }
        if flag.eq_ignore_ascii_case("false") {
            return false;
        }
    }
    matches!(
        status.as_u16(),
        408 | 409 | 429 | 500 | 502 | 503 | 504 | 520..=599
    )
}

/// Backoff delay before retry number `backoff_step + 1`.
#[must_use]
pub fn retry_delay(backoff_step: u32, config: &RetryConfig, headers: Option<&HeaderMap>) -> Duration {
    if let Some(delay) = headers.and_then(parse_retry_after) {
        return delay;
    }
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(backoff_step as i32);
    let capped = base.min(config.max_delay.as_secs_f64());
    let jitter = 1.0 - rand::random::<f64>() * config.jitter_factor;
    Duration::from_secs_f64(capped * jitter)
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request()
}

/// Send a request, retrying per the policy above.
///
/// `build_request` is called once per attempt; retry bookkeeping headers
/// (`X-Retry-Count`, `Idempotency-Key`) are added on top.
pub async fn send_with_retry<F>(build_request: F, config: &RetryConfig) -> RetryOutcome
where
    F: Fn() -> RequestBuilder,
{
    let idempotency_key = format!("atelier-retry-{}", Uuid::new_v4());

    let mut attempt = 0u32;
    loop {
        let request = build_request()
            .header("X-Retry-Count", attempt.to_string())
            .header("Idempotency-Key", &idempotency_key);
        let attempts_left = attempt < config.max_retries;

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return RetryOutcome::Success(response);
                }
                if attempts_left && should_retry(status, response.headers()) {
                    let delay = retry_delay(attempt, config, Some(response.headers()));
                    tracing::debug!(
                        status = %status,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        "Retrying request after error status"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return RetryOutcome::HttpError(response);
            }
            Err(err) => {
                if attempts_left && is_retryable_error(&err) {
                    let delay = retry_delay(attempt, config, None);
                    tracing::debug!(
                        error = %err,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        "Retrying request after connection error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                if attempt == 0 && !is_retryable_error(&err) {
                    return RetryOutcome::NonRetryable(err);
                }
                return RetryOutcome::ConnectionError {
                    attempts: attempt + 1,
                    source: err,
                };
            }
        }
    }
}
