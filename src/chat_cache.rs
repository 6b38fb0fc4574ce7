//! Chat record cache
//!
//! Caches [`Chat`] records by chat ID under `chat:{id}`, so a popular chat
//! expiring from the store costs the database one query no matter how many
//! readers miss at once.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    BoxError, CacheConfig, CacheError, CacheStore, FetchOrchestrator, PrefixKeyFormatter,
    RedisStore,
};

/// Store key prefix for chat records
pub const CHAT_KEY_PREFIX: &str = "chat:";

/// A chat record as stored in the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub member_ids: Vec<i64>,
}

impl Chat {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            title: String::new(),
            member_ids: Vec::new(),
        }
    }
}

/// Trait for fetching chats from the backend (database, HTTP, ...)
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    async fn fetch_chat(&self, chat_id: i64) -> Result<Chat, BoxError>;
}

/// Cache-aside chat reader with request coalescing
pub struct ChatCache<S: CacheStore, B: ChatBackend> {
    inner: FetchOrchestrator<i64, Chat, S>,
    backend: Arc<B>,
}

impl<S: CacheStore, B: ChatBackend> Clone for ChatCache<S, B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: ChatBackend> ChatCache<RedisStore, B> {
    /// Create a chat cache stored in Redis
    pub async fn connect(
        redis_client: redis::Client,
        backend: B,
        config: CacheConfig,
    ) -> Result<Self, redis::RedisError> {
        let store = RedisStore::new(redis_client).await?;
        Ok(Self::new(store, backend, config))
    }
}

impl<S: CacheStore, B: ChatBackend> ChatCache<S, B> {
    pub fn new(store: S, backend: B, config: CacheConfig) -> Self {
        Self {
            inner: FetchOrchestrator::new(
                store,
                PrefixKeyFormatter::new(CHAT_KEY_PREFIX),
                config,
            ),
            backend: Arc::new(backend),
        }
    }

    /// Get a chat, querying the backend at most once per concurrent miss
    pub async fn get(&self, chat_id: i64) -> Result<Arc<Chat>, CacheError> {
        let backend = Arc::clone(&self.backend);
        self.inner
            .get(&chat_id, |id| async move { backend.fetch_chat(id).await })
            .await
    }

    /// Get a chat using a one-off fetcher instead of the configured backend
    pub async fn get_with<F, Fut>(&self, chat_id: i64, fetcher: F) -> Result<Arc<Chat>, CacheError>
    where
        F: FnOnce(i64) -> Fut,
        Fut: Future<Output = Result<Chat, BoxError>>,
    {
        self.inner.get(&chat_id, fetcher).await
    }

    /// Drop the cached record, e.g. after the chat was updated
    pub async fn invalidate(&self, chat_id: i64) -> Result<(), CacheError> {
        self.inner.invalidate(&chat_id).await
    }

    pub fn orchestrator(&self) -> &FetchOrchestrator<i64, Chat, S> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatBackend for CountingBackend {
        async fn fetch_chat(&self, chat_id: i64) -> Result<Chat, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Chat {
                id: chat_id,
                title: format!("chat {}", chat_id),
                member_ids: vec![1, 2],
            })
        }
    }

    fn cache() -> ChatCache<MemoryStore, CountingBackend> {
        ChatCache::new(
            MemoryStore::default(),
            CountingBackend::default(),
            CacheConfig::default().with_ttl(Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn stores_chats_under_prefixed_keys() {
        let cache = cache();

        let chat = cache.get(1).await.unwrap();
        assert_eq!(chat.title, "chat 1");

        let store = cache.orchestrator().store();
        let bytes = store.get("chat:1").await.unwrap().unwrap();
        let stored: Chat = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(stored, *chat);
        assert_eq!(store.ttl_of("chat:1").await, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn second_read_is_served_from_the_store() {
        let cache = cache();

        cache.get(1).await.unwrap();
        cache.get(1).await.unwrap();
        assert_eq!(cache.backend.calls.load(Ordering::SeqCst), 1);

        cache.invalidate(1).await.unwrap();
        cache.get(1).await.unwrap();
        assert_eq!(cache.backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn get_with_uses_the_supplied_fetcher() {
        let cache = cache();

        let chat = cache
            .get_with(7, |id| async move { Ok(Chat::new(id)) })
            .await
            .unwrap();
        assert_eq!(*chat, Chat::new(7));
        assert_eq!(cache.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_fields_default_when_decoding() {
        let chat: Chat = serde_json::from_str(r#"{"id":1}"#).unwrap();
        assert_eq!(chat, Chat::new(1));
    }
}
