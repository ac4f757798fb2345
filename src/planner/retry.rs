//! Exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::ProviderError;
use crate::provider::ProviderResult;

/// Retry policy applied to every provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

/// A call that failed for good.
#[derive(Debug)]
pub struct RetryExhausted {
    /// Last error returned by the provider.
    pub error: ProviderError,
    /// Attempts made.
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// A provider hint replaces the computed delay. Both are capped at
    /// `max_delay`.
    #[must_use]
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_delay);
        }

        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Runs `call` until it succeeds, fails permanently or runs out of
    /// attempts.
    ///
    /// Returns the value together with the number of attempts made.
    ///
    /// # Errors
    ///
    /// Returns the last provider error and the attempt count.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        mut call: F,
    ) -> std::result::Result<(T, u32), RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok((value, attempt)),
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt, error.retry_after());
                    warn!(
                        "{what} failed (attempt {attempt}/{}), retrying in {}ms: {error}",
                        self.max_attempts,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(RetryExhausted {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(12, None), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX, None), Duration::from_secs(30));

        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(600))),
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = policy()
            .run("create", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::transient("timeout"))
                } else {
                    Ok("id-1")
                }
            })
            .await
            .expect("third attempt succeeds");

        assert_eq!(result, ("id-1", 3));
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = policy()
            .run("create", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::throttled("slow down", Duration::from_millis(1)))
            })
            .await
            .expect_err("exhausted");

        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_permanent_errors_fail_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = tokio_test::block_on(policy().run("create", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ProviderError::permanent("denied"))
        }));

        let err = tokio_test::assert_err!(result);
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
