//! Bounded exponential backoff for transient store and service failures.

use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::Result;

/// Delay before retry number `attempt` (1-based), jitter excluded.
pub fn backoff_delay(config: &RetryConfig, attempt: u16) -> Duration {
    let base = config.backoff_base();
    let max = config.backoff_max();
    let exp = u32::from(attempt.saturating_sub(1)).min(16);
    base.saturating_mul(1u32 << exp).min(max)
}

fn jittered(config: &RetryConfig, delay: Duration) -> Duration {
    let ratio = config.jitter_ratio.clamp(0.0, 1.0);
    if ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let spread = delay.as_secs_f64() * f64::from(ratio);
    let offset = rand::rng().random_range(-spread..=spread);
    Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
}

/// Run `op` until it succeeds, fails with a non-transient error, or
/// `max_attempts` is exhausted. The last error is returned on exhaustion.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1u16;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = jittered(config, backoff_delay(config, attempt));
                warn!(
                    target: "scan::retry",
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
