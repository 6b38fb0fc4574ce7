//! Cache-aside reads with request coalescing
//!
//! A [`FetchOrchestrator`] answers reads from its store when it can and
//! otherwise fetches from the backend, making sure that concurrent misses on
//! the same key produce a single backend fetch:
//! - Fast path: read the store, no locking
//! - Slow path: join or start the key's in-flight fetch
//! - Inside the fetch: re-read the store, call the backend, populate the store
//!
//! Store and codec failures never reach the caller. Reads fail open into a
//! miss and writes are best effort.

use std::{fmt::Display, future::Future, hash::Hash, sync::Arc};

use tracing::{debug, error, warn};

use crate::{
    BoxError, CacheConfig, CacheError, CacheStore, Cacheable, Codec, DedupGroup, JsonCodec,
    SharedError,
};

/// Trait for cache key types
pub trait CacheKey: Display + Hash + Eq + Clone + Send + Sync + 'static {}
impl<T> CacheKey for T where T: Display + Hash + Eq + Clone + Send + Sync + 'static {}

/// Trait for generating store keys
pub trait KeyFormatter<K>: Send + Sync + 'static {
    /// Build the store key for `key`
    fn format_key(&self, key: &K) -> String;
}

/// Formats keys as `{prefix}{key}`, e.g. `chat:1`
#[derive(Debug, Clone)]
pub struct PrefixKeyFormatter {
    prefix: String,
}

impl PrefixKeyFormatter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl<K: Display> KeyFormatter<K> for PrefixKeyFormatter {
    fn format_key(&self, key: &K) -> String {
        format!("{}{}", self.prefix, key)
    }
}

/// Cache-aside reader over a [`CacheStore`]
pub struct FetchOrchestrator<K, V, S, KF = PrefixKeyFormatter, C = JsonCodec>
where
    K: CacheKey,
    V: Cacheable,
    S: CacheStore,
    KF: KeyFormatter<K>,
    C: Codec<V>,
{
    inner: Arc<OrchestratorInner<K, V, S, KF, C>>,
}

struct OrchestratorInner<K, V, S, KF, C> {
    store: S,
    key_formatter: KF,
    codec: C,
    config: CacheConfig,
    /// Track in-flight backend fetches for request coalescing
    group: DedupGroup<K, Arc<V>, SharedError>,
}

impl<K, V, S, KF, C> Clone for FetchOrchestrator<K, V, S, KF, C>
where
    K: CacheKey,
    V: Cacheable,
    S: CacheStore,
    KF: KeyFormatter<K>,
    C: Codec<V>,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, S, KF> FetchOrchestrator<K, V, S, KF, JsonCodec>
where
    K: CacheKey,
    V: Cacheable,
    S: CacheStore,
    KF: KeyFormatter<K>,
{
    /// Create a reader that stores values as JSON
    pub fn new(store: S, key_formatter: KF, config: CacheConfig) -> Self {
        Self::with_codec(store, key_formatter, JsonCodec, config)
    }
}

impl<K, V, S, KF, C> FetchOrchestrator<K, V, S, KF, C>
where
    K: CacheKey,
    V: Cacheable,
    S: CacheStore,
    KF: KeyFormatter<K>,
    C: Codec<V>,
{
    pub fn with_codec(store: S, key_formatter: KF, codec: C, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                store,
                key_formatter,
                codec,
                config,
                group: DedupGroup::new(),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Number of keys with a backend fetch currently running
    pub fn in_flight(&self) -> usize {
        self.inner.group.in_flight()
    }

    /// Get the value for `key`, calling `fetcher` on a miss.
    ///
    /// Concurrent misses on the same key share a single call to one caller's
    /// `fetcher`; the others never run theirs. A backend error is returned to
    /// every caller of that fetch and is not cached.
    ///
    /// There is no timeout here. Wrap the call in `tokio::time::timeout` to
    /// bound the wait; giving up only drops this caller.
    pub async fn get<F, Fut>(&self, key: &K, fetcher: F) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<V, BoxError>>,
    {
        let store_key = self.inner.key_formatter.format_key(key);

        if let Some(value) = self.read_cached(key, &store_key, false).await {
            debug!("Cache hit for key: {}", key);
            return Ok(value);
        }

        debug!("Cache miss for key: {}", key);

        let (result, shared) = self
            .inner
            .group
            .run(key.clone(), || self.fetch_and_populate(key, &store_key, fetcher))
            .await;

        if shared {
            debug!("Joined in-flight fetch for key: {}", key);
        }

        result.map_err(CacheError::Backend)
    }

    /// Runs once per miss storm, inside the key's in-flight call.
    async fn fetch_and_populate<F, Fut>(
        &self,
        key: &K,
        store_key: &str,
        fetcher: F,
    ) -> Result<Arc<V>, SharedError>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<V, BoxError>>,
    {
        // Double-check: another caller may have populated the store since our miss
        if let Some(value) = self.read_cached(key, store_key, true).await {
            debug!("Cache populated while waiting for key: {}", key);
            return Ok(value);
        }

        let value = match fetcher(key.clone()).await {
            Ok(value) => Arc::new(value),
            Err(e) => {
                error!("Backend error for key {}: {}", key, e);
                return Err(SharedError::from(e));
            }
        };

        debug!("Fetched from backend for key: {}", key);
        self.populate(key, store_key, &value).await;

        Ok(value)
    }

    /// Read and decode a stored entry. Any failure is reported as a miss.
    ///
    /// Corrupt entries are only deleted when `repair` is set, which callers
    /// limit to the read inside the key's in-flight call. A fast-path reader
    /// deleting what it saw could otherwise remove a fresh entry written by
    /// the executor in the meantime.
    async fn read_cached(&self, key: &K, store_key: &str, repair: bool) -> Option<Arc<V>> {
        let bytes = match self.inner.store.get(store_key).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                warn!(
                    "Store GET error for key {} ({}). Falling back to backend.",
                    key, e
                );
                return None;
            }
        };

        match self.inner.codec.decode(&bytes) {
            Ok(value) => Some(Arc::new(value)),
            Err(e) => {
                warn!("Failed to decode cached value for key {}: {}", key, e);
                if repair && self.inner.config.repair_corrupt_entries {
                    if let Err(del_err) = self.inner.store.delete(store_key).await {
                        warn!(
                            "Failed to delete corrupt entry for key {} (store key: {}): {}",
                            key, store_key, del_err
                        );
                    }
                }
                None
            }
        }
    }

    /// Best-effort write of a freshly fetched value.
    ///
    /// Uses a conditional write so an entry stored concurrently by another
    /// writer is left in place.
    async fn populate(&self, key: &K, store_key: &str, value: &V) {
        let bytes = match self.inner.codec.encode(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode value for key {}: {}. Not caching.", key, e);
                return;
            }
        };

        match self
            .inner
            .store
            .set_if_absent(store_key, bytes, self.inner.config.ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(
                "Entry for key {} was written concurrently; keeping it",
                key
            ),
            Err(e) => warn!(
                "Store SET error for key {} (store key: {}): {}. Continuing.",
                key, store_key, e
            ),
        }
    }

    /// Remove the stored entry for `key`, best effort.
    pub async fn invalidate(&self, key: &K) -> Result<(), CacheError> {
        debug!("Invalidating cache for key: {}", key);

        let store_key = self.inner.key_formatter.format_key(key);
        if let Err(e) = self.inner.store.delete(&store_key).await {
            warn!(
                "Store DEL error for key {} (store key: {}): {}. Continuing.",
                key, store_key, e
            );
        }

        Ok(())
    }
}
