//! Bounded exponential backoff for backend calls

use crate::config::schema::RetryConfig;
use crate::error::ByoeResult;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff: base, 2*base, 4*base, ... capped at `max_ms`
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(delay_ms.min(max_ms))
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempts run out. The last error is returned.
pub async fn with_retry<T, F, Fut>(policy: &RetryConfig, what: &str, mut op: F) -> ByoeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ByoeResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = backoff_delay(attempt, policy.base_delay_ms, policy.max_delay_ms);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    what,
                    attempt + 1,
                    policy.max_attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
