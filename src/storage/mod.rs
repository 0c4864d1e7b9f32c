//! Shared-storage abstraction for distributed rate-limit state.
//!
//! The limiters only ever see this trait: a handful of atomic primitives
//! over a remote key/value store. The adapter does not reason about
//! rate-limit semantics, which keeps the store swappable and lets the
//! limiters be unit-tested against [`MemoryStorage`].

mod memory;
mod redis;
mod retry;

pub use memory::MemoryStorage;
pub use redis::RedisStorage;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from the shared-storage adapter.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Connection-pool creation or borrow failure.
    #[error("storage pool error: {0}")]
    Pool(String),

    /// A remote command failed.
    #[error("storage command failed: {0}")]
    Command(#[from] deadpool_redis::redis::RedisError),

    /// The stored value has the wrong shape for the requested operation.
    #[error("wrong value type at key {0}")]
    WrongType(String),

    /// The store returned a reply the caller cannot interpret.
    #[error("unexpected storage reply: {0}")]
    Response(String),

    /// The retry policy gave up. Carries the last underlying cause.
    #[error("storage operation failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },
}

/// Atomic primitives the limiters require from a shared store.
///
/// Every operation targets a single logical store; partitioning is the
/// store's concern. Implementations must be safe to call concurrently.
#[async_trait]
pub trait RateLimitStorage: Send + Sync {
    /// Increment a counter by one and (re-)apply a TTL, indivisibly with
    /// respect to readers. Returns the value after the increment.
    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<i64, StorageError>;

    /// Read an integer counter. Absent keys read as zero.
    async fn get(&self, key: &str) -> Result<i64, StorageError>;

    /// Write an integer counter with an expiry.
    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), StorageError>;

    /// Atomically replace `expect` with `update`, treating an absent key
    /// as zero. Returns whether the swap happened; a concurrent write
    /// between read and write makes it fail.
    async fn compare_and_set(
        &self,
        key: &str,
        expect: i64,
        update: i64,
    ) -> Result<bool, StorageError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Read numeric hash fields. Each position is `None` when the field
    /// (or the whole hash) is absent.
    async fn hash_fields(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<f64>>, StorageError>;

    /// Execute a script as one atomic unit on the store.
    ///
    /// The reply is a sequence of integers: Redis truncates script numbers
    /// at the reply boundary, and callers are written against exactly that.
    async fn eval_script(
        &self,
        script: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<i64>, StorageError>;

    /// Liveness probe. Never errors; an unreachable store reads as `false`.
    async fn available(&self) -> bool;
}
