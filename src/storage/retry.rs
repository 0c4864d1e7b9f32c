//! Bounded retry with linear backoff for storage operations.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::StorageError;

/// Retry policy applied to every remote storage operation.
///
/// An operation is attempted up to `max_attempts` times; the n-th retry
/// sleeps `delay * n` first. The sleep is a tokio sleep, so caller
/// cancellation aborts it immediately. The final failure is surfaced as
/// [`StorageError::RetriesExhausted`] carrying the last cause.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub(crate) async fn run<T, Fut, Op>(
        &self,
        operation: &'static str,
        mut op: Op,
    ) -> Result<T, StorageError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        for attempt in 1..self.max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "storage operation failed, retrying"
                    );
                    tokio::time::sleep(self.delay * attempt).await;
                }
            }
        }

        op().await.map_err(|error| {
            warn!(
                operation,
                attempts = self.max_attempts,
                error = %error,
                "storage operation failed, retries exhausted"
            );
            StorageError::RetriesExhausted {
                attempts: self.max_attempts.max(1),
                source: Box::new(error),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = policy()
            .run("test", || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = policy()
            .run("test", || {
                let calls = calls_clone.clone();
                async move {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(StorageError::Pool("connection refused".to_string()))
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
    async fn test_exhaustion_wraps_last_cause() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), _> = policy()
            .run("test", || {
                let calls = calls_clone.clone();
                async move {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst);
                    Err(StorageError::Pool(format!("attempt {}", attempt)))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            StorageError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(source.to_string().contains("attempt 2"));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_backoff_progression() {
        let started = tokio::time::Instant::now();

        let result: Result<(), _> = policy()
            .run("test", || async {
                Err(StorageError::Pool("down".to_string()))
            })
            .await;

        assert!(result.is_err());
        // Sleeps of 10 ms and 20 ms between the three attempts.
        assert_eq!(started.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_single_attempt_policy() {
        let policy = RetryPolicy {
            max_attempts: 1,
            delay: Duration::from_millis(10),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), _> = policy
            .run("test", || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StorageError::Pool("down".to_string()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result.unwrap_err(),
            StorageError::RetriesExhausted { attempts: 1, .. }
        ));
    }
}
