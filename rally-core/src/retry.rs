use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::repository::StoreError;

/// Bounded retry with linear backoff for transient store contention.
/// Constraint violations and permanent failures are returned immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), backoff }
    }

    /// Single attempt, for callers that must never replay a write.
    pub fn never() -> Self {
        Self::new(1, Duration::ZERO)
    }

    fn delay(&self, attempt: usize) -> Duration {
        self.backoff.saturating_mul(attempt as u32)
    }

    pub async fn run<F, Fut, T>(&self, operation: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(val) => return Ok(val),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        warn!(operation, attempts = attempt, error = %err, "store contention persisted, giving up");
                        return Err(err);
                    }
                    sleep(self.delay(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delay_grows_linearly() {
        let policy = RetryPolicy::new(4, Duration::from_millis(20));
        assert_eq!(policy.delay(1), Duration::from_millis(20));
        assert_eq!(policy.delay(2), Duration::from_millis(40));
        assert_eq!(policy.delay(3), Duration::from_millis(60));
    }

    #[test]
    fn attempts_are_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = policy
            .run("insert", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Transient("deadlock detected".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_transient_error() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy
            .run("insert", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Transient("serialization failure".into()))
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn conflicts_are_never_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy
            .run("insert", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Conflict { constraint: "holds_no_overlap".into() })
            })
            .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
