//! Bounded retry of transient remote failures

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RemoteRetryPolicy;
use crate::error::Result;

/// Delay with up to 25% random jitter added, honoring a server hint
pub fn jittered_delay(policy: &RemoteRetryPolicy, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let base = policy.delay_for(attempt);
    let hinted = retry_after_secs
        .map(Duration::from_secs)
        .unwrap_or_default()
        .max(base);
    let spread = (hinted.as_millis() / 4) as u64;
    let jitter = if spread == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=spread)
    };
    hinted + Duration::from_millis(jitter)
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// The last error is returned unchanged, so an exhausted transient failure
/// is still `is_retryable()` and the task layer reschedules it.
pub async fn with_retry<T, F, Fut>(policy: &RemoteRetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                let delay = jittered_delay(policy, attempt, e.retry_after_secs());
                tracing::warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transient remote failure: {}",
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
