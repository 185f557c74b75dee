//! Retry and backoff for network operations.
//!
//! Any async operation returning `Result<T, GenError>` can be wrapped in
//! [`execute`]; retryable classifications (see `GenError::is_retryable`)
//! are re-run with exponential backoff plus jitter, everything else
//! propagates immediately without consuming retry budget.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::GenError;

/// Default total attempts per operation (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Maximum delay cap for exponential backoff.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Retry configuration for one wrapped operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Must be at least 1.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }
}

/// Calculate exponential backoff delay with jitter.
///
/// `min(base * 2^attempt + jitter, max)` where jitter is uniform in
/// `[0, base]` to avoid synchronized retry bursts.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponential = base.saturating_mul(2u32.saturating_pow(attempt));
    let jitter_cap = (base.as_millis() as u64).min(1_000);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap));
    exponential.saturating_add(jitter).min(max)
}

/// Delay before the next attempt, honouring Retry-After for rate limits.
fn delay_for(error: &GenError, attempt: u32, policy: &RetryPolicy) -> Duration {
    if let GenError::RateLimited {
        retry_after_secs: Some(secs),
        ..
    } = error
    {
        return Duration::from_secs(*secs).min(policy.backoff_max);
    }
    calculate_backoff(attempt, policy.backoff_base, policy.backoff_max)
}

/// Run `op` up to `policy.max_attempts` times.
///
/// Exhausting the budget yields `GenError::RetriesExhausted` carrying the
/// last underlying error; non-retryable failures propagate as-is on the
/// attempt that produced them.
pub async fn execute<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, GenError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GenError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                if attempt >= max_attempts {
                    log::warn!("giving up after {attempt} attempts: {err}");
                    return Err(GenError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                let delay = delay_for(&err, attempt - 1, policy);
                log::warn!(
                    "attempt {attempt}/{max_attempts} failed: {err}, retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Parse a Retry-After header value as integer seconds.
pub fn parse_retry_after(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}
