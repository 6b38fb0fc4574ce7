//! In-process store on a Moka cache
//!
//! Useful for single-instance deployments and tests. Every entry expires after
//! the TTL it was last written with.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use moka::{Expiry, future::Cache};

use crate::{CacheError, CacheStore};

#[derive(Clone)]
struct StoredEntry {
    bytes: Arc<[u8]>,
    ttl: Duration,
}

/// Expires each entry after its own TTL, restarting on overwrite.
struct EntryExpiry;

impl Expiry<String, StoredEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded in-memory [`CacheStore`]
#[derive(Clone)]
pub struct MemoryStore {
    entries: Cache<String, StoredEntry>,
}

impl MemoryStore {
    pub fn new(max_capacity: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry)
            .build();
        Self { entries }
    }

    /// TTL the live entry for `key` was written with.
    pub async fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.entries.get(key).await.map(|entry| entry.ttl)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.get(key).await.map(|entry| entry.bytes.to_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let entry = StoredEntry {
            bytes: Arc::from(value),
            ttl,
        };
        self.entries.insert(key.to_owned(), entry).await;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let entry = StoredEntry {
            bytes: Arc::from(value),
            ttl,
        };
        let entry = self.entries.entry(key.to_owned()).or_insert(entry).await;
        Ok(entry.is_fresh())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.invalidate(key).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_returns_bytes_and_ttl() {
        let store = MemoryStore::default();
        store
            .set("chat:1", b"{\"id\":1}".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(
            store.get("chat:1").await.unwrap().as_deref(),
            Some(&b"{\"id\":1}"[..])
        );
        assert_eq!(store.ttl_of("chat:1").await, Some(Duration::from_secs(60)));
        assert_eq!(store.get("chat:2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_keeps_existing_entry() {
        let store = MemoryStore::default();
        let ttl = Duration::from_secs(60);

        assert!(store.set_if_absent("chat:1", b"first".to_vec(), ttl).await.unwrap());
        assert!(!store.set_if_absent("chat:1", b"second".to_vec(), ttl).await.unwrap());
        assert_eq!(
            store.get("chat:1").await.unwrap().as_deref(),
            Some(&b"first"[..])
        );

        store.delete("chat:1").await.unwrap();
        assert!(!store.contains("chat:1"));
        assert!(store.set_if_absent("chat:1", b"third".to_vec(), ttl).await.unwrap());
    }

    #[tokio::test]
    async fn entries_expire_after_their_ttl() {
        let store = MemoryStore::default();
        store
            .set("chat:1", b"1".to_vec(), Duration::from_millis(30))
            .await
            .unwrap();
        assert!(store.contains("chat:1"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.get("chat:1").await.unwrap(), None);
    }
}
