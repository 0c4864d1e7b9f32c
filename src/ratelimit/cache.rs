//! Per-process decision cache.

use std::time::Duration;

use moka::sync::Cache;

/// Size- and TTL-bounded map from user key to the last observed count.
///
/// Sits in front of shared storage to short-circuit decisions for keys
/// already known to be saturated, which is what soaks up attack traffic.
/// Entries expire `ttl` after insertion (not last read) and are admitted
/// and evicted by moka's Window-TinyLFU policy.
///
/// The cache is advisory and strictly per process: it is never the source
/// of truth, and staleness is bounded by the TTL. For a one-minute window,
/// a 50 ms TTL keeps the over-count within ~0.5%, 100 ms within ~1%,
/// 500 ms within ~5%.
pub struct DecisionCache {
    entries: Cache<String, i64>,
}

impl DecisionCache {
    /// Create a cache with the given write-TTL and entry cap.
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        Self {
            entries: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(max_entries)
                .build(),
        }
    }

    /// Last count observed for `key`, if still fresh.
    pub fn probe(&self, key: &str) -> Option<i64> {
        self.entries.get(key)
    }

    /// Record a new observation, overwriting any prior entry and
    /// resetting its TTL.
    pub fn update(&self, key: &str, count: i64) {
        self.entries.insert(key.to_string(), count);
    }

    /// Drop the entry for `key`.
    pub fn invalidate(&self, key: &str) {
        self.entries.invalidate(key);
    }
}
