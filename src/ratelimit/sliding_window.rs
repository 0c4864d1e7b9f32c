//! Sliding-window counter limiter.
//!
//! Approximates a true sliding window by blending two adjacent fixed
//! buckets: the previous bucket's count is weighted by how much of it
//! still overlaps the window ending now.
//!
//! ```text
//! percent_in_curr = (now_ms mod W) / W
//! estimated       = prev_count * (1 - percent_in_curr) + curr_count
//! ```
//!
//! The estimate over-counts by at most the boundary error of the linear
//! weight (≤5% in practice), and much less memory than a sliding log.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::config::RateLimiterConfig;
use crate::error::Result;
use crate::storage::RateLimitStorage;

use super::cache::DecisionCache;
use super::limiter::{validate_request, RateLimiter};
use super::metrics::{self, MetricsSink};

/// Rate limiter over two weighted fixed-window buckets in shared storage.
///
/// Bucket keys are `rl:<user_key>:<window_start_ms>`, aligned on epoch
/// milliseconds so every fleet instance increments the same counters.
pub struct SlidingWindowLimiter {
    storage: Arc<dyn RateLimitStorage>,
    config: RateLimiterConfig,
    cache: Option<DecisionCache>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    /// Create a limiter; fails with `InvalidArgument` on a bad config.
    pub fn new(
        storage: Arc<dyn RateLimitStorage>,
        config: RateLimiterConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let cache = config.local_cache_enabled.then(|| {
            DecisionCache::new(config.local_cache_ttl, config.local_cache_max_entries)
        });

        Ok(Self {
            storage,
            config,
            cache,
            metrics,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the wall clock. Window boundaries are shared across the
    /// fleet, so anything but a wall clock breaks interoperability.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Weighted count over the window ending at `now_ms`, from two reads.
    async fn estimated_count(&self, key: &str, now_ms: u64) -> Result<i64> {
        let window_ms = self.config.window_ms();
        let curr_key = bucket_key(key, now_ms, window_ms);
        let prev_key = bucket_key(key, now_ms.saturating_sub(window_ms), window_ms);

        let started = Instant::now();
        let curr_count = self.storage.get(&curr_key).await?;
        let prev_count = self.storage.get(&prev_key).await?;
        self.metrics.record_latency("storage.get", started.elapsed());

        let percent_in_curr = (now_ms % window_ms) as f64 / window_ms as f64;
        let prev_weight = 1.0 - percent_in_curr;
        let estimated = (prev_count as f64 * prev_weight + curr_count as f64) as i64;

        trace!(
            key,
            curr_count,
            prev_count,
            prev_weight,
            estimated,
            "sliding window estimate"
        );

        Ok(estimated)
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn try_acquire_n(&self, key: &str, permits: u32) -> Result<bool> {
        validate_request(key, permits)?;
        let max_permits = self.config.max_permits as i64;

        // A key recently observed at or over the limit is rejected without
        // a round trip; attack traffic mostly lands here.
        if let Some(cache) = &self.cache {
            if let Some(cached_count) = cache.probe(key) {
                if cached_count >= max_permits {
                    self.metrics.increment(metrics::CACHE_HITS);
                    self.metrics.increment(metrics::REQUESTS_REJECTED);
                    trace!(key, cached_count, "rejected from local cache");
                    return Ok(false);
                }
            }
        }

        let now_ms = self.clock.now_millis();
        let estimated = self.estimated_count(key, now_ms).await?;

        if estimated + i64::from(permits) > max_permits {
            if let Some(cache) = &self.cache {
                cache.update(key, estimated);
            }
            self.metrics.increment(metrics::REQUESTS_REJECTED);
            debug!(key, estimated, permits, "sliding window limit exceeded");
            return Ok(false);
        }

        let current_key = bucket_key(key, now_ms, self.config.window_ms());
        let started = Instant::now();
        // TTL of two windows: the bucket keeps contributing weight for a
        // full window after it stops being current.
        let new_count = self
            .storage
            .incr_and_expire(&current_key, self.config.window * 2)
            .await?;
        self.metrics
            .record_latency("storage.incr_and_expire", started.elapsed());

        if let Some(cache) = &self.cache {
            cache.update(key, new_count);
        }

        // Concurrent acquirers may race past the estimate check together;
        // re-checking the incremented count keeps this caller's answer
        // honest even when the bucket briefly overshoots.
        let allowed = new_count <= max_permits;
        if allowed {
            self.metrics.increment(metrics::REQUESTS_ALLOWED);
        } else {
            self.metrics.increment(metrics::REQUESTS_REJECTED);
        }

        Ok(allowed)
    }

    async fn available_permits(&self, key: &str) -> Result<i64> {
        // No cache probe: callers of this read expect freshness.
        let now_ms = self.clock.now_millis();
        let estimated = self.estimated_count(key, now_ms).await?;
        Ok((self.config.max_permits as i64 - estimated).max(0))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let now_ms = self.clock.now_millis();
        let window_ms = self.config.window_ms();

        self.storage
            .delete(&bucket_key(key, now_ms, window_ms))
            .await?;
        self.storage
            .delete(&bucket_key(key, now_ms.saturating_sub(window_ms), window_ms))
            .await?;

        if let Some(cache) = &self.cache {
            cache.invalidate(key);
        }

        debug!(key, "sliding window reset");
        Ok(())
    }
}

/// Start of the fixed bucket containing `timestamp_ms`.
fn window_start_ms(timestamp_ms: u64, window_ms: u64) -> u64 {
    (timestamp_ms / window_ms) * window_ms
}

/// Storage key for the bucket containing `timestamp_ms`.
fn bucket_key(key: &str, timestamp_ms: u64, window_ms: u64) -> String {
    format!("rl:{}:{}", key, window_start_ms(timestamp_ms, window_ms))
}
