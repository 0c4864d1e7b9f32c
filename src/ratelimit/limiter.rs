//! Public limiter contract and construction.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::RateLimiterConfig;
use crate::error::{RateLimitError, Result};
use crate::storage::RateLimitStorage;

use super::metrics::MetricsSink;
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::TokenBucketLimiter;

/// Contract shared by both rate-limiting algorithms.
///
/// All operations are safe to invoke from any task, and none blocks the
/// caller beyond a bounded storage round trip plus retries.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Try to acquire a single permit for `key`.
    async fn try_acquire(&self, key: &str) -> Result<bool> {
        self.try_acquire_n(key, 1).await
    }

    /// Try to acquire `permits` permits for `key` as one decision.
    ///
    /// Returns `Ok(false)` when the limit would be exceeded, and
    /// [`RateLimitError::InvalidArgument`] when `permits` is zero.
    async fn try_acquire_n(&self, key: &str, permits: u32) -> Result<bool>;

    /// Remaining permits for `key`, never negative.
    async fn available_permits(&self, key: &str) -> Result<i64>;

    /// Clear all limiter state for `key`. Mainly for tests and admin
    /// overrides; the next decision starts from a cold key.
    async fn reset(&self, key: &str) -> Result<()>;
}

/// Which algorithm a limiter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Two adjacent fixed buckets blended by a linear weight.
    SlidingWindow,
    /// Classical token bucket with constant refill, one atomic script
    /// per decision.
    TokenBucket,
}

/// Build a configured limiter for the chosen algorithm.
///
/// This is the one assembly point: storage, configuration, and metrics
/// are passed in explicitly, and the returned limiter holds them for the
/// process lifetime. Configuration is validated here.
pub fn build(
    algorithm: Algorithm,
    storage: Arc<dyn RateLimitStorage>,
    config: RateLimiterConfig,
    metrics: Arc<dyn MetricsSink>,
) -> Result<Arc<dyn RateLimiter>> {
    match algorithm {
        Algorithm::SlidingWindow => Ok(Arc::new(SlidingWindowLimiter::new(
            storage, config, metrics,
        )?)),
        Algorithm::TokenBucket => Ok(Arc::new(TokenBucketLimiter::new(
            storage, config, metrics,
        )?)),
    }
}

/// Keys are opaque to the limiters but must not be empty.
pub(crate) fn validate_request(key: &str, permits: u32) -> Result<()> {
    if key.is_empty() {
        return Err(RateLimitError::InvalidArgument(
            "key must not be empty".to_string(),
        ));
    }
    if permits == 0 {
        return Err(RateLimitError::InvalidArgument(
            "permits must be positive".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::metrics::InMemoryMetrics;
    use crate::storage::MemoryStorage;
    use std::time::Duration;

    fn deps() -> (Arc<MemoryStorage>, Arc<InMemoryMetrics>) {
        (
            Arc::new(MemoryStorage::new()),
            Arc::new(InMemoryMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_build_sliding_window() {
        let (storage, metrics) = deps();
        let limiter = build(
            Algorithm::SlidingWindow,
            storage,
            RateLimiterConfig::per_minute(10),
            metrics,
        )
        .unwrap();

        assert!(limiter.try_acquire("user").await.unwrap());
    }

    #[tokio::test]
    async fn test_build_token_bucket() {
        let (storage, metrics) = deps();
        let limiter = build(
            Algorithm::TokenBucket,
            storage,
            RateLimiterConfig::per_minute(10).with_refill_rate(5.0),
            metrics,
        )
        .unwrap();

        assert!(limiter.try_acquire("user").await.unwrap());
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let (storage, metrics) = deps();
        let result = build(
            Algorithm::SlidingWindow,
            storage,
            RateLimiterConfig::new(0, Duration::from_secs(1)),
            metrics,
        );

        assert!(matches!(
            result.err(),
            Some(RateLimitError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_try_acquire_delegates_to_single_permit() {
        let (storage, metrics) = deps();
        let limiter = build(
            Algorithm::SlidingWindow,
            storage,
            RateLimiterConfig::per_minute(2).with_local_cache(false),
            metrics,
        )
        .unwrap();

        assert!(limiter.try_acquire("user").await.unwrap());
        assert!(limiter.try_acquire("user").await.unwrap());
        assert!(!limiter.try_acquire("user").await.unwrap());
    }

    #[test]
    fn test_validate_request() {
        assert!(validate_request("user", 1).is_ok());
        assert!(validate_request("", 1).is_err());
        assert!(validate_request("user", 0).is_err());
    }
}
