//! Value encoding for stored entries

use serde::{Serialize, de::DeserializeOwned};

use crate::CacheError;

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Converts values to and from the bytes held by a [`CacheStore`](crate::CacheStore).
pub trait Codec<V>: Send + Sync + 'static {
    fn encode(&self, value: &V) -> Result<Vec<u8>, CacheError>;

    /// A decode failure is treated by callers as a cache miss.
    fn decode(&self, bytes: &[u8]) -> Result<V, CacheError>;
}

/// JSON encoding via `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<V: Cacheable> Codec<V> for JsonCodec {
    fn encode(&self, value: &V) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<V, CacheError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
