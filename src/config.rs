//! Cache configuration

use std::time::Duration;

/// Configuration for a cache-aside reader
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time-to-live for entries written to the store
    pub ttl: Duration,
    /// Delete stored entries that fail to decode so the next fetch can replace them
    pub repair_corrupt_entries: bool,
}

impl CacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(900), // 15 minutes
            repair_corrupt_entries: true,
        }
    }
}
