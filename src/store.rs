//! Byte-level cache stores
//!
//! The cache-aside reader only needs four operations from its store. TTL
//! enforcement is left entirely to the store.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::CacheError;

/// Key/value store holding encoded entries.
///
/// Implementations must be safe for concurrent use. Read errors are treated as
/// misses by callers and write errors are logged, so implementations should not
/// retry on their own.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Read an entry, `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Write an entry, replacing any existing one.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Write an entry only if none exists. Returns whether it was written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Redis TTLs are whole milliseconds and must be positive.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Store backed by Redis through a shared connection manager
#[derive(Clone)]
pub struct RedisStore {
    redis: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn new(redis_client: redis::Client) -> Result<Self, redis::RedisError> {
        let redis = redis::aio::ConnectionManager::new(redis_client).await?;
        Ok(Self { redis })
    }

    pub fn from_manager(redis: redis::aio::ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.redis.clone();
        Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.redis.clone();
        conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl)).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.redis.clone();
        // SET NX PX replies the simple string OK when written and nil when the
        // key already exists, so the reply decodes as Some("OK") or None
        let reply = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<Option<String>>(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
