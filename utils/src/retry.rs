//! Bounded exponential backoff with jitter.
//!
//! Disabled by default: with `max_retries == 0` an operation runs exactly
//! once and its error is returned untouched.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay, jitter included.
    pub max_delay_ms: u64,
    /// Maximum random jitter added to each delay.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 100,
            max_delay_ms: 1600,
            jitter_ms: 100,
        }
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0
    }

    fn delay_for(&self, base_ms: u64) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_ms)
        };
        Duration::from_millis(std::cmp::min(base_ms + jitter, self.max_delay_ms))
    }
}

/// Retries `attempt_fn` up to `policy.max_retries` times.
///
/// Total attempts = 1 + `max_retries`. Errors for which `is_retryable`
/// returns false are returned immediately.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    description: &str,
    mut attempt_fn: F,
    mut is_retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: FnMut(&E) -> bool,
{
    let mut attempt = 0;
    let mut delay_ms = policy.initial_delay_ms;

    loop {
        match attempt_fn().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !is_retryable(&e) || attempt >= policy.max_retries {
                    return Err(e);
                }
                attempt += 1;
                let delay = policy.delay_for(delay_ms);
                warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    description,
                    error = %e,
                    "attempt failed, retrying with backoff"
                );
                tokio::time::sleep(delay).await;
                delay_ms = std::cmp::min(delay_ms.saturating_mul(2), policy.max_delay_ms);
            }
        }
    }
}
