//! herdcache - Cache-aside reads that survive miss storms
//!
//! When a popular entry expires, every concurrent reader misses at once. This
//! library coalesces those misses so the backend sees one fetch per key:
//! - [`DedupGroup`]: at most one in-flight operation per key, result shared
//!   with every caller that joined it
//! - [`FetchOrchestrator`]: store read, coalesced fetch with a second store
//!   read inside it, best-effort store write
//! - [`CacheStore`] implementations for Redis and in-process Moka
//!
//! Coordination is process-local. Store failures degrade to cache misses;
//! only backend errors reach the caller.

pub mod chat_cache;
mod codec;
mod config;
mod dedup;
mod error;
mod memory_store;
mod orchestrator;
mod store;

pub use chat_cache::{Chat, ChatBackend, ChatCache};
pub use codec::{Cacheable, Codec, JsonCodec};
pub use config::CacheConfig;
pub use dedup::DedupGroup;
pub use error::{BoxError, CacheError, SharedError};
pub use memory_store::MemoryStore;
pub use orchestrator::{CacheKey, FetchOrchestrator, KeyFormatter, PrefixKeyFormatter};
pub use store::{CacheStore, RedisStore};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
