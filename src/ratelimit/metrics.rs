//! Metrics emitted by the limiters.
//!
//! Counter names are fixed so dashboards line up across fleet instances;
//! tags and export are left to the sink implementation.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;

/// Requests allowed by the sliding-window limiter.
pub const REQUESTS_ALLOWED: &str = "ratelimiter.requests.allowed";
/// Requests rejected by the sliding-window limiter.
pub const REQUESTS_REJECTED: &str = "ratelimiter.requests.rejected";
/// Sliding-window decisions served from the local cache.
pub const CACHE_HITS: &str = "ratelimiter.cache.hits";
/// Requests allowed by the token-bucket limiter.
pub const TOKEN_BUCKET_ALLOWED: &str = "ratelimiter.tokenbucket.allowed";
/// Requests rejected by the token-bucket limiter.
pub const TOKEN_BUCKET_REJECTED: &str = "ratelimiter.tokenbucket.rejected";

/// Sink for limiter counters and storage-operation latency.
///
/// Implementations must be cheap and non-blocking: these are called on
/// every decision. The histogram shape behind `record_latency` is the
/// sink's choice.
pub trait MetricsSink: Send + Sync {
    /// Increment a named counter by one.
    fn increment(&self, counter: &'static str);

    /// Record one timed storage operation.
    fn record_latency(&self, operation: &'static str, elapsed: Duration);
}

/// Call count and cumulative duration for one storage operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationTiming {
    pub calls: u64,
    pub total: Duration,
}

/// Process-local metrics registry.
///
/// Suitable as a default sink and as the assertion point in tests; an
/// exporting deployment wraps or replaces it.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: RwLock<HashMap<&'static str, u64>>,
    timings: RwLock<HashMap<&'static str, OperationTiming>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter; unknown counters read as zero.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    /// Accumulated timing for a storage operation, if any was recorded.
    pub fn timing(&self, operation: &str) -> Option<OperationTiming> {
        self.timings.read().get(operation).copied()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, counter: &'static str) {
        *self.counters.write().entry(counter).or_insert(0) += 1;
    }

    fn record_latency(&self, operation: &'static str, elapsed: Duration) {
        let mut timings = self.timings.write();
        let timing = timings.entry(operation).or_default();
        timing.calls += 1;
        timing.total += elapsed;
    }
}
