//! Token-bucket limiter.
//!
//! Classical bucket: capacity `max_permits`, constant refill, bursts
//! allowed up to capacity. Each decision is one server-side script
//! execution, so refill and consume happen as a single atomic unit on the
//! shared store and every fleet instance sees a consistent bucket.
//!
//! There is no local cache here: the state is one hash read away,
//! correctness depends on timestamp freshness, and the refill math is
//! stateless at the instance level.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::RateLimiterConfig;
use crate::error::{RateLimitError, Result};
use crate::storage::{RateLimitStorage, StorageError};

use super::limiter::{validate_request, RateLimiter};
use super::metrics::{self, MetricsSink};

/// Atomic refill-and-consume, executed as one unit on the store.
///
/// One key, five arguments: capacity, refill rate per millisecond,
/// requested permits, caller epoch milliseconds, TTL milliseconds.
/// Missing state seeds to a full bucket; elapsed time is clamped at zero
/// so a caller behind the stored timestamp cannot drain the bucket.
/// Returns `{allowed, tokens_after}`; nothing is written on deny.
const ACQUIRE_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])

if tokens == nil then
  tokens = capacity
  last_refill = now
end

local elapsed = now - last_refill
if elapsed < 0 then
  elapsed = 0
end
tokens = math.min(capacity, tokens + elapsed * refill_rate)

if tokens >= requested then
  tokens = tokens - requested
  redis.call('HSET', key, 'tokens', tokens, 'last_refill', now)
  redis.call('PEXPIRE', key, ttl)
  return {1, math.floor(tokens)}
end
return {0, math.floor(tokens)}
"#;

/// Rate limiter over a shared token bucket per key.
///
/// Bucket state lives at `tb:<user_key>` as hash fields `tokens` and
/// `last_refill`, with a TTL of two windows: long enough that an idle
/// bucket is not evicted mid-burst, short enough to reclaim abandoned
/// keys.
pub struct TokenBucketLimiter {
    storage: Arc<dyn RateLimitStorage>,
    config: RateLimiterConfig,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    /// Refill rate converted to permits per millisecond.
    refill_per_ms: f64,
}

impl TokenBucketLimiter {
    /// Create a limiter; fails with `InvalidArgument` on a bad config or
    /// a missing refill rate.
    pub fn new(
        storage: Arc<dyn RateLimitStorage>,
        config: RateLimiterConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        if config.refill_rate <= 0.0 {
            return Err(RateLimitError::InvalidArgument(
                "token bucket requires a positive refill_rate".to_string(),
            ));
        }

        let refill_per_ms = config.refill_rate / 1000.0;

        debug!(
            capacity = config.max_permits,
            refill_rate = config.refill_rate,
            "token bucket initialized"
        );

        Ok(Self {
            storage,
            config,
            metrics,
            clock: Arc::new(SystemClock),
            refill_per_ms,
        })
    }

    /// Replace the wall clock. Refill timestamps are shared across the
    /// fleet, so anything but a wall clock breaks interoperability.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn bucket_key(key: &str) -> String {
        format!("tb:{}", key)
    }

    fn ttl_ms(&self) -> u64 {
        // Two windows: see the type-level docs.
        self.config.window_ms() * 2
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn try_acquire_n(&self, key: &str, permits: u32) -> Result<bool> {
        validate_request(key, permits)?;

        if u64::from(permits) > self.config.max_permits {
            // Infeasible regardless of bucket state; skip the round trip.
            warn!(
                key,
                permits,
                capacity = self.config.max_permits,
                "requested permits exceed bucket capacity"
            );
            self.metrics.increment(metrics::TOKEN_BUCKET_REJECTED);
            return Ok(false);
        }

        let now_ms = self.clock.now_millis();
        let keys = vec![Self::bucket_key(key)];
        let args = vec![
            self.config.max_permits.to_string(),
            self.refill_per_ms.to_string(),
            permits.to_string(),
            now_ms.to_string(),
            self.ttl_ms().to_string(),
        ];

        let started = Instant::now();
        let reply = self
            .storage
            .eval_script(ACQUIRE_SCRIPT, &keys, &args)
            .await?;
        self.metrics
            .record_latency("storage.eval_script", started.elapsed());

        let (allowed, tokens_remaining) = match reply.as_slice() {
            [1, tokens] => (true, *tokens),
            [0, tokens] => (false, *tokens),
            other => {
                return Err(StorageError::Response(format!(
                    "token bucket script returned {:?}",
                    other
                ))
                .into())
            }
        };

        trace!(key, permits, allowed, tokens_remaining, "token bucket decision");

        if allowed {
            self.metrics.increment(metrics::TOKEN_BUCKET_ALLOWED);
        } else {
            self.metrics.increment(metrics::TOKEN_BUCKET_REJECTED);
        }

        Ok(allowed)
    }

    async fn available_permits(&self, key: &str) -> Result<i64> {
        let started = Instant::now();
        let fields = self
            .storage
            .hash_fields(&Self::bucket_key(key), &["tokens", "last_refill"])
            .await?;
        self.metrics
            .record_latency("storage.hash_fields", started.elapsed());

        let stored = match (fields.first(), fields.get(1)) {
            (Some(&Some(tokens)), Some(&Some(last_refill))) => Some((tokens, last_refill as u64)),
            _ => None,
        };

        // Advisory read: mirror the refill locally without mutating state.
        // An absent bucket is a full bucket.
        let available = match stored {
            Some((tokens, last_refill)) => {
                let elapsed = self.clock.now_millis().saturating_sub(last_refill) as f64;
                (tokens + elapsed * self.refill_per_ms).min(self.config.max_permits as f64)
            }
            None => self.config.max_permits as f64,
        };

        Ok(available.floor().max(0.0) as i64)
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.storage.delete(&Self::bucket_key(key)).await?;
        debug!(key, "token bucket reset");
        Ok(())
    }
}
