//! Retry loop for transient backend failures.

use std::future::Future;

use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::UploadError;

/// Runs `op` until it succeeds, fails permanently or the policy's retries
/// are used up. `op` receives the 1-based attempt number and must rebuild
/// its request body on every call.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, UploadError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, UploadError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt <= policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = %what,
                    attempt,
                    delay_secs = format_args!("{:.1}", delay.as_secs_f64()),
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
