//! Bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use imgbackup_common::AppConfig;

/// Every attempt of an operation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed after {attempts} attempts: {last_reason}")]
pub struct AttemptsExhausted {
    pub attempts: u32,
    pub last_reason: String,
}

/// How often and how patiently a transfer is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub retry_count: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Create a policy with `retry_count` retries.
    pub fn new(retry_count: u32) -> Self {
        Self {
            retry_count,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Policy from the application settings.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.retry_count).with_base_delay(Duration::from_millis(config.retry_delay_ms))
    }

    /// Set the base delay; zero disables waiting.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total number of attempts: the initial one plus the retries.
    pub fn attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let delay = if self.jitter {
            // +/- 25%
            capped * (0.75 + rand::random::<f64>() * 0.5)
        } else {
            capped
        };

        Duration::from_millis(delay as u64)
    }

    /// Run `operation` until it succeeds or all attempts are used.
    ///
    /// The closure receives the 1-based attempt number. There is no wait
    /// after the last attempt.
    ///
    /// # Errors
    /// - [`AttemptsExhausted`] carrying the reason of the last failure
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T, AttemptsExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        let attempts = self.attempts();
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Succeeded on attempt {}", attempt);
                    }
                    return Ok(value);
                }
                Err(reason) if attempt >= attempts => {
                    warn!("Giving up after {} attempts: {}", attempts, reason);
                    return Err(AttemptsExhausted {
                        attempts,
                        last_reason: reason,
                    });
                }
                Err(reason) => {
                    let delay = self.delay_for_retry(attempt - 1);
                    warn!(
                        "Attempt {}/{} failed: {}. Retrying in {:?}...",
                        attempt, attempts, reason, delay
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(retry_count: u32) -> RetryPolicy {
        RetryPolicy::new(retry_count).with_base_delay(Duration::ZERO)
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::new(3)
            .with_base_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(policy.delay_for_retry(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::new(10)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(policy.delay_for_retry(5), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_first_success_stops() {
        let calls = AtomicU32::new(0);
        let result = quick(3)
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(42) }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let result = quick(3)
            .run(|attempt| async move {
                if attempt < 3 {
                    Err(format!("attempt {} failed", attempt))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_exhaustion_uses_every_attempt() {
        for retry_count in [0, 1, 4] {
            let calls = AtomicU32::new(0);
            let result: Result<(), _> = quick(retry_count)
                .run(|attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(format!("boom {}", attempt)) }
                })
                .await;

            let err = result.unwrap_err();
            assert_eq!(calls.load(Ordering::SeqCst), retry_count + 1);
            assert_eq!(err.attempts, retry_count + 1);
            assert_eq!(err.last_reason, format!("boom {}", retry_count + 1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_between_attempts() {
        let policy = RetryPolicy::new(2)
            .with_base_delay(Duration::from_secs(1))
            .with_jitter(false);
        let start = tokio::time::Instant::now();

        let _: Result<(), _> = policy.run(|_| async { Err("no".to_string()) }).await;

        // 1s + 2s, nothing after the last attempt.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }
}
