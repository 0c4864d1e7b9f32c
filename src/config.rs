//! Configuration for limiters and the shared-storage adapter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RateLimitError;

/// Immutable per-limiter configuration.
///
/// Built once at startup and held for the process lifetime. Constructors
/// return a config with conventional defaults; limiter constructors call
/// [`RateLimiterConfig::validate`] before accepting it.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Ceiling of the bucket or window. Must be positive.
    pub max_permits: u64,

    /// The rate-limit horizon. Must be a positive duration.
    pub window: Duration,

    /// Refill rate for the token bucket, in permits per second.
    /// Ignored by the sliding window; must be positive for the token bucket.
    pub refill_rate: f64,

    /// Front storage reads with a per-process decision cache.
    /// Trades a bounded amount of accuracy for fewer round trips.
    pub local_cache_enabled: bool,

    /// How long a cached observation stays fresh, measured from insertion.
    ///
    /// The over-count bound scales with the TTL relative to the window:
    /// 0 ms is exact, 50 ms stays within ~0.5%, 100 ms within ~1%,
    /// 500 ms within ~5% (for a one-minute window).
    pub local_cache_ttl: Duration,

    /// Entry cap for the decision cache.
    pub local_cache_max_entries: u64,
}

impl RateLimiterConfig {
    /// Create a configuration with the given ceiling and window.
    ///
    /// Local caching defaults to on with a 100 ms TTL; `refill_rate`
    /// defaults to zero and must be raised for a token bucket.
    pub fn new(max_permits: u64, window: Duration) -> Self {
        Self {
            max_permits,
            window,
            refill_rate: 0.0,
            local_cache_enabled: true,
            local_cache_ttl: Duration::from_millis(100),
            local_cache_max_entries: 10_000,
        }
    }

    /// Shortcut for `max_permits` per second.
    pub fn per_second(max_permits: u64) -> Self {
        Self::new(max_permits, Duration::from_secs(1))
    }

    /// Shortcut for `max_permits` per minute.
    pub fn per_minute(max_permits: u64) -> Self {
        Self::new(max_permits, Duration::from_secs(60))
    }

    /// Shortcut for `max_permits` per hour.
    pub fn per_hour(max_permits: u64) -> Self {
        Self::new(max_permits, Duration::from_secs(3600))
    }

    /// Set the token-bucket refill rate in permits per second.
    pub fn with_refill_rate(mut self, permits_per_second: f64) -> Self {
        self.refill_rate = permits_per_second;
        self
    }

    /// Enable or disable the local decision cache.
    pub fn with_local_cache(mut self, enabled: bool) -> Self {
        self.local_cache_enabled = enabled;
        self
    }

    /// Set the decision-cache TTL.
    pub fn with_local_cache_ttl(mut self, ttl: Duration) -> Self {
        self.local_cache_ttl = ttl;
        self
    }

    /// Set the decision-cache entry cap.
    pub fn with_local_cache_max_entries(mut self, max_entries: u64) -> Self {
        self.local_cache_max_entries = max_entries;
        self
    }

    /// Check the construction invariants.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.max_permits == 0 {
            return Err(RateLimitError::InvalidArgument(
                "max_permits must be positive".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(RateLimitError::InvalidArgument(
                "window must be a positive duration".to_string(),
            ));
        }
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(RateLimitError::InvalidArgument(
                "refill_rate cannot be negative".to_string(),
            ));
        }
        if self.local_cache_enabled && self.local_cache_ttl.is_zero() {
            return Err(RateLimitError::InvalidArgument(
                "local_cache_ttl must be positive when the cache is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Window width in milliseconds.
    pub(crate) fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

/// Configuration for the Redis storage adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Redis host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Redis port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: usize,

    /// Bounded wait when the pool is exhausted, in milliseconds.
    #[serde(default = "default_borrow_timeout_ms")]
    pub borrow_timeout_ms: u64,

    /// Total attempts per storage operation, including the first.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Base retry delay in milliseconds; the n-th retry waits n times this.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            pool_max_size: default_pool_max_size(),
            borrow_timeout_ms: default_borrow_timeout_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl StorageConfig {
    /// Connection URL for the configured host and port.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }

    /// Bounded pool-borrow wait as a duration.
    pub fn borrow_timeout(&self) -> Duration {
        Duration::from_millis(self.borrow_timeout_ms)
    }

    /// Base retry delay as a duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_pool_max_size() -> usize {
    128
}

fn default_borrow_timeout_ms() -> u64 {
    2000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    10
}
