use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::Result;

/// Backoff before retry number `attempt` (0-based): exponential from
/// `initial_backoff`, capped at `max_backoff`, with up to 50% random jitter
/// subtracted so concurrent workers spread out.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff.as_millis() as u64;
    let cap = config.max_backoff.as_millis() as u64;
    let exp = base.saturating_mul(1u64 << attempt.min(20)).min(cap);
    if exp == 0 {
        return Duration::ZERO;
    }
    let mut rng = rand::thread_rng();
    let jitter = rng.gen_range(0..=exp / 2);
    Duration::from_millis(exp - jitter)
}

/// Run `op` until it succeeds, fails with a non-transient error, or the retry
/// budget runs out. The last error is returned in the latter two cases.
pub async fn with_backoff<T, F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < config.max_attempts => {
                let delay = backoff_delay(config, attempt);
                tracing::warn!(
                    operation = what,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient store failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::error!(operation = what, attempts = attempt + 1, error = %e, "Store retry budget exhausted");
                }
                return Err(e);
            }
        }
    }
}
