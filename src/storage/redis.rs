//! Redis-backed storage adapter.
//!
//! Connections come from a bounded deadpool pool with a bounded borrow
//! wait; every operation runs through the linear-backoff retry policy.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands, Script};
use deadpool_redis::{Connection, Pool, PoolConfig, Runtime};
use tracing::{debug, warn};

use crate::config::StorageConfig;

use super::retry::RetryPolicy;
use super::{RateLimitStorage, StorageError};

/// Read-compare-write as one atomic unit; an absent key compares as zero.
/// The write intentionally clears any TTL, matching plain SET semantics.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
  current = '0'
end
if tonumber(current) == tonumber(ARGV[1]) then
  redis.call('SET', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

/// Shared-storage adapter over a Redis server.
pub struct RedisStorage {
    pool: Pool,
    retry: RetryPolicy,
}

impl RedisStorage {
    /// Create the adapter and its connection pool.
    ///
    /// Pool creation is lazy; the first operation dials the server.
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        let mut settings = deadpool_redis::Config::from_url(config.url());
        let mut pool_config = PoolConfig::new(config.pool_max_size);
        pool_config.timeouts.wait = Some(config.borrow_timeout());
        settings.pool = Some(pool_config);

        let pool = settings
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StorageError::Pool(e.to_string()))?;

        debug!(
            host = %config.host,
            port = config.port,
            pool_max_size = config.pool_max_size,
            "redis storage initialized"
        );

        Ok(Self {
            pool,
            retry: RetryPolicy {
                max_attempts: config.retry_max_attempts,
                delay: config.retry_delay(),
            },
        })
    }

    async fn connection(pool: &Pool) -> Result<Connection, StorageError> {
        pool.get()
            .await
            .map_err(|e| StorageError::Pool(e.to_string()))
    }
}

#[async_trait]
impl RateLimitStorage for RedisStorage {
    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<i64, StorageError> {
        let ttl_ms = ttl.as_millis() as i64;
        self.retry
            .run("incr_and_expire", || {
                let pool = self.pool.clone();
                let key = key.to_string();
                async move {
                    let mut conn = Self::connection(&pool).await?;
                    let (count,): (i64,) = redis::pipe()
                        .atomic()
                        .incr(&key, 1)
                        .pexpire(&key, ttl_ms)
                        .ignore()
                        .query_async(&mut conn)
                        .await?;
                    Ok(count)
                }
            })
            .await
    }

    async fn get(&self, key: &str) -> Result<i64, StorageError> {
        self.retry
            .run("get", || {
                let pool = self.pool.clone();
                let key = key.to_string();
                async move {
                    let mut conn = Self::connection(&pool).await?;
                    let value: Option<i64> = conn.get(&key).await?;
                    Ok(value.unwrap_or(0))
                }
            })
            .await
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), StorageError> {
        let ttl_ms = ttl.as_millis() as i64;
        self.retry
            .run("set", || {
                let pool = self.pool.clone();
                let key = key.to_string();
                async move {
                    let mut conn = Self::connection(&pool).await?;
                    let _: () = redis::cmd("SET")
                        .arg(&key)
                        .arg(value)
                        .arg("PX")
                        .arg(ttl_ms)
                        .query_async(&mut conn)
                        .await?;
                    Ok(())
                }
            })
            .await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expect: i64,
        update: i64,
    ) -> Result<bool, StorageError> {
        self.retry
            .run("compare_and_set", || {
                let pool = self.pool.clone();
                let key = key.to_string();
                async move {
                    let mut conn = Self::connection(&pool).await?;
                    let swapped: i64 = Script::new(CAS_SCRIPT)
                        .key(&key)
                        .arg(expect)
                        .arg(update)
                        .invoke_async(&mut conn)
                        .await?;
                    Ok(swapped == 1)
                }
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.retry
            .run("delete", || {
                let pool = self.pool.clone();
                let key = key.to_string();
                async move {
                    let mut conn = Self::connection(&pool).await?;
                    let _: i64 = conn.del(&key).await?;
                    Ok(())
                }
            })
            .await
    }

    async fn hash_fields(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<f64>>, StorageError> {
        self.retry
            .run("hash_fields", || {
                let pool = self.pool.clone();
                let key = key.to_string();
                let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
                async move {
                    let mut conn = Self::connection(&pool).await?;
                    let values: Vec<Option<f64>> = redis::cmd("HMGET")
                        .arg(&key)
                        .arg(&fields)
                        .query_async(&mut conn)
                        .await?;
                    Ok(values)
                }
            })
            .await
    }

    async fn eval_script(
        &self,
        script: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<i64>, StorageError> {
        self.retry
            .run("eval_script", || {
                let script = Script::new(script);
                let pool = self.pool.clone();
                let keys = keys.to_vec();
                let args = args.to_vec();
                async move {
                    let mut conn = Self::connection(&pool).await?;
                    let mut invocation = script.prepare_invoke();
                    for key in &keys {
                        invocation.key(key.as_str());
                    }
                    for arg in &args {
                        invocation.arg(arg.as_str());
                    }
                    let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
                    Ok(reply)
                }
            })
            .await
    }

    async fn available(&self) -> bool {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(error) => {
                warn!(error = %error, "storage health check failed to borrow a connection");
                return false;
            }
        };

        let reply: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        match reply {
            Ok(pong) => pong == "PONG",
            Err(error) => {
                warn!(error = %error, "storage health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_construction_is_lazy() {
        // No server is listening here; construction must still succeed
        // because connections are only dialed on first use.
        let config = StorageConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..StorageConfig::default()
        };
        assert!(RedisStorage::new(&config).is_ok());
    }
}
