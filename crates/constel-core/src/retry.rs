use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

/// Retry a fallible async operation with exponential backoff.
///
/// - `max_attempts`: Total attempts (including the first), at least one.
/// - `base_delay`: Delay after first failure, doubled on each subsequent failure.
/// - `label`: Description for log messages.
/// - `f`: Produces a fresh future per attempt.
pub async fn retry<F, Fut, T>(max_attempts: u32, base_delay: Duration, label: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = base_delay;
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{} failed, retrying",
                    label,
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
        }
    }
}
