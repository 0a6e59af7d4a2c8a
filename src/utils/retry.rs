//! Exponential-backoff retry for transient transport failures.

use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::CoreError;

/// Retry policy with exponential backoff.
///
/// Only errors classified transient by [`CoreError::is_transient`] are
/// retried; anything else is returned immediately. When attempts are
/// exhausted, the last failure is returned.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
            backoff_factor,
        }
    }

    /// Two attempts, half-second initial delay.
    pub fn quick() -> Self {
        Self::new(2, Duration::from_millis(500), Duration::from_secs(2), 2.0)
    }

    /// Three attempts, one-second initial delay.
    pub fn standard() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(10), 2.0)
    }

    /// Five attempts, two-second initial delay.
    pub fn persistent() -> Self {
        Self::new(5, Duration::from_secs(2), Duration::from_secs(30), 2.0)
    }

    /// Delay applied after the `attempt`-th failure (1-based):
    /// `min(initial * factor^(attempt - 1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    /// Run `op`, retrying transient failures with backoff.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        for attempt in 1..=self.max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:.2}s: {}",
                        label,
                        attempt,
                        self.max_attempts,
                        delay.as_secs_f64(),
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if attempt == self.max_attempts && err.is_transient() {
                        error!(
                            "{} failed after {} attempts: {}",
                            label, self.max_attempts, err
                        );
                    }
                    return Err(err);
                }
            }
        }
        unreachable!("retry loop always returns")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::ZERO, Duration::ZERO, 2.0)
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = instant_policy(3)
            .run("op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CoreError::Backend("flaky".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = instant_policy(3)
            .run("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CoreError::Backend("still broken".to_string())) }
            })
            .await;
        assert!(matches!(result, Err(CoreError::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = instant_policy(5)
            .run("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CoreError::SessionDead("crew".to_string())) }
            })
            .await;
        assert!(matches!(result, Err(CoreError::SessionDead(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_attempt_never_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = instant_policy(1)
            .run("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CoreError::Backend("once".to_string())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_progression() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(10),
            2.0,
        );
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_presets() {
        assert_eq!(RetryPolicy::quick().max_attempts, 2);
        assert_eq!(RetryPolicy::standard().max_attempts, 3);
        assert_eq!(RetryPolicy::persistent().max_attempts, 5);
    }
}
