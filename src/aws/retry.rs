//! Retry-with-backoff for individual remote calls.

use super::http::as_api_error;
use anyhow::Result;
use std::future::Future;
use std::time::Duration;

/// Escalating delays between attempts; the number of attempts is one more
/// than the number of delays.
pub const BACKOFF_DELAYS_MS: &[u64] = &[300, 600, 1000, 2000, 3000, 5000, 8000];

/// Retries `op` with the default schedule, for errors AWS flags as
/// transient (throttling, service unavailability).
pub async fn with_backoff<T, F, Fut>(op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_backoff_config(BACKOFF_DELAYS_MS, &[], op).await
}

/// Retries `op` on retryable API errors, or on any status listed in
/// `retryable_statuses`. Non-retryable errors propagate immediately;
/// exhausting the schedule propagates the last error.
pub async fn with_backoff_config<T, F, Fut>(
    delays_ms: &[u64],
    retryable_statuses: &[u16],
    op: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let retryable = as_api_error(&error)
                    .is_some_and(|e| e.is_retryable() || retryable_statuses.contains(&e.status));
                if !retryable || attempt >= delays_ms.len() {
                    return Err(error);
                }
                let delay = Duration::from_millis(delays_ms[attempt]);
                attempt += 1;
                tracing::debug!(
                    "Retrying in {}ms after attempt {}: {:#}",
                    delay.as_millis(),
                    attempt,
                    error
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
