//! Retry policy for optimistic-concurrency conflicts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::RetrySettings;
use crate::store::StoreError;

/// Bounded retry with exponential backoff, applied only to selected errors
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of each backoff added as random jitter
    pub jitter: f64,
    pub(crate) retryable: fn(&StoreError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::on_conflict()
    }
}

impl RetryPolicy {
    /// Retry only resource-version conflicts: 5 attempts, 10ms apart
    #[must_use]
    pub fn on_conflict() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            multiplier: 1.0,
            jitter: 0.1,
            retryable: StoreError::is_conflict,
        }
    }

    #[must_use]
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            multiplier: settings.multiplier,
            jitter: settings.jitter,
            retryable: StoreError::is_conflict,
        }
    }

    /// Replace the predicate selecting retryable errors
    #[must_use]
    pub fn retry_when(mut self, retryable: fn(&StoreError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    #[must_use]
    pub fn is_retryable(&self, err: &StoreError) -> bool {
        (self.retryable)(err)
    }

    /// Backoff before retry number `attempt` (1-based), without jitter
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempts are exhausted. The last error is returned.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && self.is_retryable(&err) => {
                    let delay = self.with_jitter(self.backoff(attempt));
                    debug!(attempt, delay_ms = delay.as_millis(), error = %err, "Retrying after conflict");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(0.0..self.jitter);
        delay.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict() -> StoreError {
        StoreError::Conflict {
            resource: "ConfigMap:apps/c".into(),
            message: "stale".into(),
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            jitter: 0.0,
            ..RetryPolicy::on_conflict()
        }
    }

    #[tokio::test]
    async fn test_retries_conflicts_until_success() {
        let calls = &AtomicU32::new(0);
        let result = fast()
            .run(|| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(conflict())
                } else {
                    Ok("applied")
                }
            })
            .await;

        assert_eq!(tokio_test::assert_ok!(result), "applied");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .run(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            })
            .await;

        assert!(tokio_test::assert_err!(result).is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .run(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Transport("connection reset".into()))
            })
            .await;

        assert!(matches!(result, Err(StoreError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let calls = &AtomicU32::new(0);
        let policy = fast().retry_when(|e| matches!(e, StoreError::Transport(_)));
        let _ = policy
            .run(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::Transport("timeout".into()))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
            multiplier: 2.0,
            ..RetryPolicy::on_conflict()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(250));
    }
}
