//! In-process storage adapter.
//!
//! Backs unit tests and single-node deployments with the same contract as
//! the Redis adapter. All state lives in one map behind a mutex; the lock
//! is never held across an await point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};

use super::{RateLimitStorage, StorageError};

#[derive(Debug, Clone, Copy)]
enum StoredValue {
    Counter(i64),
    Bucket { tokens: f64, last_refill: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: StoredValue,
    expires_at_ms: Option<u64>,
}

/// Shared-storage adapter over an in-process map.
///
/// Expiry is evaluated lazily against the injected [`Clock`] on access,
/// so a `ManualClock` drives TTL behavior deterministically in tests.
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStorage {
    /// Create a storage over the system wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a storage over the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Drop an expired entry and return what remains, if anything.
    fn live_entry<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now_ms: u64,
    ) -> Option<&'a mut Entry> {
        let expired = entries
            .get(key)
            .is_some_and(|entry| entry.expires_at_ms.is_some_and(|at| at <= now_ms));
        if expired {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn parse_number<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T, StorageError> {
        raw.parse()
            .map_err(|_| StorageError::Response(format!("malformed script argument {name}: {raw}")))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStorage for MemoryStorage {
    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<i64, StorageError> {
        let now_ms = self.clock.now_millis();
        let expires_at_ms = Some(now_ms + ttl.as_millis() as u64);
        let mut entries = self.entries.lock();

        match Self::live_entry(&mut entries, key, now_ms) {
            Some(entry) => match &mut entry.value {
                StoredValue::Counter(value) => {
                    *value += 1;
                    entry.expires_at_ms = expires_at_ms;
                    Ok(*value)
                }
                StoredValue::Bucket { .. } => Err(StorageError::WrongType(key.to_string())),
            },
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: StoredValue::Counter(1),
                        expires_at_ms,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<i64, StorageError> {
        let now_ms = self.clock.now_millis();
        let mut entries = self.entries.lock();

        match Self::live_entry(&mut entries, key, now_ms) {
            Some(entry) => match entry.value {
                StoredValue::Counter(value) => Ok(value),
                StoredValue::Bucket { .. } => Err(StorageError::WrongType(key.to_string())),
            },
            None => Ok(0),
        }
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), StorageError> {
        let now_ms = self.clock.now_millis();
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: StoredValue::Counter(value),
                expires_at_ms: Some(now_ms + ttl.as_millis() as u64),
            },
        );
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expect: i64,
        update: i64,
    ) -> Result<bool, StorageError> {
        let now_ms = self.clock.now_millis();
        let mut entries = self.entries.lock();

        let current = match Self::live_entry(&mut entries, key, now_ms) {
            Some(entry) => match entry.value {
                StoredValue::Counter(value) => value,
                StoredValue::Bucket { .. } => {
                    return Err(StorageError::WrongType(key.to_string()))
                }
            },
            None => 0,
        };

        if current != expect {
            return Ok(false);
        }

        // Plain SET semantics: the swapped-in value carries no TTL.
        entries.insert(
            key.to_string(),
            Entry {
                value: StoredValue::Counter(update),
                expires_at_ms: None,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn hash_fields(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<f64>>, StorageError> {
        let now_ms = self.clock.now_millis();
        let mut entries = self.entries.lock();

        match Self::live_entry(&mut entries, key, now_ms) {
            Some(entry) => match entry.value {
                StoredValue::Bucket {
                    tokens,
                    last_refill,
                } => Ok(fields
                    .iter()
                    .map(|field| match *field {
                        "tokens" => Some(tokens),
                        "last_refill" => Some(last_refill as f64),
                        _ => None,
                    })
                    .collect()),
                StoredValue::Counter(_) => Err(StorageError::WrongType(key.to_string())),
            },
            None => Ok(vec![None; fields.len()]),
        }
    }

    /// Executes the token-bucket acquire contract as the atomic unit:
    /// one key, five arguments `(capacity, refill_rate_per_ms, requested,
    /// now_ms, ttl_ms)`, reply `[allowed, tokens_after]`. State is seeded
    /// to a full bucket and left untouched on deny, exactly as the Redis
    /// script behaves.
    async fn eval_script(
        &self,
        _script: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<i64>, StorageError> {
        let [key] = keys else {
            return Err(StorageError::Response(format!(
                "expected exactly one key, got {}",
                keys.len()
            )));
        };
        let [capacity, refill_rate, requested, now, ttl] = args else {
            return Err(StorageError::Response(format!(
                "expected five script arguments, got {}",
                args.len()
            )));
        };

        let capacity: f64 = Self::parse_number(capacity, "capacity")?;
        let refill_rate: f64 = Self::parse_number(refill_rate, "refill_rate")?;
        let requested: f64 = Self::parse_number(requested, "requested")?;
        let now_ms: u64 = Self::parse_number(now, "now_ms")?;
        let ttl_ms: u64 = Self::parse_number(ttl, "ttl_ms")?;

        let mut entries = self.entries.lock();

        let (tokens, last_refill) = match Self::live_entry(&mut entries, key, now_ms) {
            Some(entry) => match entry.value {
                StoredValue::Bucket {
                    tokens,
                    last_refill,
                } => (tokens, last_refill),
                StoredValue::Counter(_) => {
                    return Err(StorageError::WrongType(key.to_string()))
                }
            },
            None => (capacity, now_ms),
        };

        let elapsed = now_ms.saturating_sub(last_refill) as f64;
        let tokens = (tokens + elapsed * refill_rate).min(capacity);

        if tokens >= requested {
            let tokens = tokens - requested;
            entries.insert(
                key.to_string(),
                Entry {
                    value: StoredValue::Bucket {
                        tokens,
                        last_refill: now_ms,
                    },
                    expires_at_ms: Some(now_ms + ttl_ms),
                },
            );
            Ok(vec![1, tokens.floor() as i64])
        } else {
            Ok(vec![0, tokens.floor() as i64])
        }
    }

    async fn available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn storage_at(now_ms: u64) -> (MemoryStorage, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now_ms));
        (MemoryStorage::with_clock(clock.clone()), clock)
    }

    fn bucket_args(capacity: u64, refill_per_ms: f64, requested: u32, now_ms: u64) -> Vec<String> {
        vec![
            capacity.to_string(),
            refill_per_ms.to_string(),
            requested.to_string(),
            now_ms.to_string(),
            "120000".to_string(),
        ]
    }

    #[tokio::test]
    async fn test_incr_starts_at_one_and_counts_up() {
        let (storage, _) = storage_at(1_000);
        let ttl = Duration::from_secs(1);

        assert_eq!(storage.incr_and_expire("k", ttl).await.unwrap(), 1);
        assert_eq!(storage.incr_and_expire("k", ttl).await.unwrap(), 2);
        assert_eq!(storage.get("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_counter_expires_after_ttl() {
        let (storage, clock) = storage_at(1_000);

        storage
            .incr_and_expire("k", Duration::from_millis(500))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(499));
        assert_eq!(storage.get("k").await.unwrap(), 1);

        clock.advance(Duration::from_millis(1));
        assert_eq!(storage.get("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_incr_reapplies_ttl() {
        let (storage, clock) = storage_at(0);
        let ttl = Duration::from_millis(100);

        storage.incr_and_expire("k", ttl).await.unwrap();
        clock.advance(Duration::from_millis(80));
        storage.incr_and_expire("k", ttl).await.unwrap();

        // The first write alone would have expired by now.
        clock.advance(Duration::from_millis(80));
        assert_eq!(storage.get("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_get_absent_is_zero() {
        let (storage, _) = storage_at(0);
        assert_eq!(storage.get("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_set_and_delete() {
        let (storage, _) = storage_at(0);

        storage.set("k", 7, Duration::from_secs(1)).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), 7);

        storage.delete("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), 0);

        // Deleting an absent key is fine.
        storage.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let (storage, _) = storage_at(0);

        // Absent reads as zero.
        assert!(storage.compare_and_set("k", 0, 5).await.unwrap());
        assert_eq!(storage.get("k").await.unwrap(), 5);

        assert!(!storage.compare_and_set("k", 4, 9).await.unwrap());
        assert_eq!(storage.get("k").await.unwrap(), 5);

        assert!(storage.compare_and_set("k", 5, 9).await.unwrap());
        assert_eq!(storage.get("k").await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_hash_fields_absent_key() {
        let (storage, _) = storage_at(0);
        let fields = storage
            .hash_fields("missing", &["tokens", "last_refill"])
            .await
            .unwrap();
        assert_eq!(fields, vec![None, None]);
    }

    #[tokio::test]
    async fn test_script_seeds_full_bucket() {
        let (storage, _) = storage_at(1_000);
        let keys = vec!["tb:k".to_string()];

        let reply = storage
            .eval_script("", &keys, &bucket_args(50, 0.01, 10, 1_000))
            .await
            .unwrap();
        assert_eq!(reply, vec![1, 40]);

        let fields = storage
            .hash_fields("tb:k", &["tokens", "last_refill"])
            .await
            .unwrap();
        assert_eq!(fields[0], Some(40.0));
        assert_eq!(fields[1], Some(1_000.0));
    }

    #[tokio::test]
    async fn test_script_refills_and_caps_at_capacity() {
        let (storage, _) = storage_at(0);
        let keys = vec!["tb:k".to_string()];

        // Drain the bucket completely.
        let reply = storage
            .eval_script("", &keys, &bucket_args(50, 0.01, 50, 0))
            .await
            .unwrap();
        assert_eq!(reply, vec![1, 0]);

        // A very long idle period refills to capacity, not beyond.
        let reply = storage
            .eval_script("", &keys, &bucket_args(50, 0.01, 1, 10_000_000))
            .await
            .unwrap();
        assert_eq!(reply, vec![1, 49]);
    }

    #[tokio::test]
    async fn test_script_deny_leaves_state_untouched() {
        let (storage, _) = storage_at(0);
        let keys = vec!["tb:k".to_string()];

        storage
            .eval_script("", &keys, &bucket_args(10, 0.0, 10, 0))
            .await
            .unwrap();

        let reply = storage
            .eval_script("", &keys, &bucket_args(10, 0.0, 1, 0))
            .await
            .unwrap();
        assert_eq!(reply, vec![0, 0]);

        let fields = storage
            .hash_fields("tb:k", &["last_refill"])
            .await
            .unwrap();
        assert_eq!(fields[0], Some(0.0));
    }

    #[tokio::test]
    async fn test_script_rejects_malformed_invocation() {
        let (storage, _) = storage_at(0);

        let result = storage
            .eval_script("", &["a".to_string(), "b".to_string()], &[])
            .await;
        assert!(matches!(result, Err(StorageError::Response(_))));

        let result = storage
            .eval_script(
                "",
                &["a".to_string()],
                &vec!["not-a-number".to_string(); 5],
            )
            .await;
        assert!(matches!(result, Err(StorageError::Response(_))));
    }

    #[tokio::test]
    async fn test_counter_operations_reject_bucket_values() {
        let (storage, _) = storage_at(0);
        let keys = vec!["tb:k".to_string()];
        storage
            .eval_script("", &keys, &bucket_args(10, 0.0, 1, 0))
            .await
            .unwrap();

        assert!(matches!(
            storage.get("tb:k").await,
            Err(StorageError::WrongType(_))
        ));
        assert!(matches!(
            storage.incr_and_expire("tb:k", Duration::from_secs(1)).await,
            Err(StorageError::WrongType(_))
        ));
    }
}
