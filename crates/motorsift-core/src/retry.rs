//! Bounded retry with exponential backoff.

use std::future::Future;

use crate::config::RetryPolicy;
use crate::error::AppError;

/// Run `operation` until it succeeds, fails with an error `classify` marks
/// as permanent, or `policy.max_attempts` is used up.
///
/// The last error is returned unchanged. Callers bound the total time with
/// their own timeout; this helper only spaces attempts out.
pub async fn retry_with_backoff<T, F, Fut, C>(
    policy: &RetryPolicy,
    classify: C,
    mut operation: F,
) -> Result<T, AppError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
    C: Fn(&AppError) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && classify(&e) => {
                let delay = policy.delay_for_retry(attempt);
                tracing::debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
