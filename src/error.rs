//! Cache error types

use std::sync::Arc;

use redis::RedisError;

/// Boxed error returned by backend fetchers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A backend error shared by every caller that joined the same fetch
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Cache-related errors
///
/// Only [`CacheError::Backend`] is ever returned from a cached read. Store and
/// codec failures are logged and degrade to a cache miss or a skipped write.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(SharedError),
}

impl CacheError {
    /// The shared backend error, if this is one.
    pub fn backend(&self) -> Option<&SharedError> {
        match self {
            CacheError::Backend(e) => Some(e),
            _ => None,
        }
    }
}
