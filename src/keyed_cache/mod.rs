//! Byte-blob cache with per-entry TTL.
//!
//! Every cached value in this crate is derived state: losing an entry only
//! forces a recompute or refetch. Callers therefore treat a miss (`Ok(None)`)
//! as ordinary control flow and most cache failures as a miss.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_cache;

pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use redis_cache::{RedisCache, RedisConfig};

use crate::settings::CacheBackendSettings;

/// Errors raised by a cache backend. A miss is never an error.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Cache contract shared by the in-process and networked backends.
///
/// A zero `ttl` stores the value without expiry. Concurrent `set` calls on
/// the same key are last-write-wins.
#[async_trait]
pub trait KeyedCache: Send + Sync {
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Returns `Ok(None)` for absent or expired keys.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn delete_multi(&self, keys: &[String]) -> Result<(), CacheError>;

    /// Drops every entry owned by this cache.
    async fn flush(&self) -> Result<(), CacheError>;
}

pub type SharedCache = Arc<dyn KeyedCache>;

/// Builds the cache backend selected in configuration.
pub async fn connect(settings: &CacheBackendSettings) -> anyhow::Result<SharedCache> {
    match settings {
        CacheBackendSettings::Memory => {
            log::info!("Using in-process keyed cache");
            Ok(Arc::new(MemoryCache::new()))
        }
        #[cfg(feature = "redis")]
        CacheBackendSettings::Redis { url, key_prefix } => {
            let cache = RedisCache::new(RedisConfig {
                url: url.clone(),
                key_prefix: key_prefix.clone(),
            })
            .await?;
            Ok(Arc::new(cache))
        }
        #[cfg(not(feature = "redis"))]
        CacheBackendSettings::Redis { .. } => Err(anyhow::anyhow!(
            "Redis cache backend configured but the 'redis' feature is not enabled"
        )),
    }
}
