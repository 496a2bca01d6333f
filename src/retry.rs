use std::future::Future;
use std::time::Duration;

use tokio_retry2::strategy::{ExponentialBackoff, FixedInterval};
use tokio_retry2::{Retry, RetryError};
use tracing::warn;

use crate::error::Result;

/// Bounded retry with a fixed or growing delay between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub delay: Duration,
    /// Multiplier applied to the delay after every failed attempt. 1 keeps
    /// the delay fixed.
    pub backoff: u32,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
            backoff: 1,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delays slept between attempts; one fewer than `attempts`.
    pub fn delays(&self) -> Vec<Duration> {
        let retries = self.attempts.max(1) as usize - 1;
        let first = self.delay.min(self.max_delay);

        if self.backoff <= 1 {
            return FixedInterval::new(first).take(retries).collect();
        }

        let factor = u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX);
        let growing = ExponentialBackoff::from_millis(u64::from(self.backoff))
            .factor(factor)
            .max_delay(self.max_delay);
        std::iter::once(first).chain(growing).take(retries).collect()
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted. `op` receives the 1-based attempt number.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    Retry::spawn(policy.delays(), || {
        attempt += 1;
        let current = attempt;
        let fut = op(current);
        async move {
            match fut.await {
                Ok(value) => Ok(value),
                Err(e) if !e.is_retryable() => Err(RetryError::Permanent(e)),
                Err(e) => {
                    if current >= attempts {
                        warn!(attempt = current, attempts, error = %e, "{label}: giving up");
                    } else {
                        warn!(attempt = current, attempts, error = %e, "{label}: attempt failed, retrying");
                    }
                    Err(RetryError::Transient {
                        err: e,
                        retry_after: None,
                    })
                }
            }
        }
    })
    .await
}
