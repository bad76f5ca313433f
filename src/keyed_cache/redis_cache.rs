// Redis Cache - shared KeyedCache backend
// All keys live under a namespace prefix so flush never touches foreign data

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;

use super::{CacheError, KeyedCache};

/// Configuration for the Redis connection.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "confsync:".to_string(),
        }
    }
}

/// Networked cache shared by every process pointing at the same Redis.
pub struct RedisCache {
    conn: ConnectionManager,
    config: RedisConfig,
}

impl RedisCache {
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str()).context("Failed to create Redis client")?;

        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        info!("✅ Redis cache connected to {}", config.url);

        Ok(Self { conn, config })
    }

    /// Create with default localhost config
    pub async fn new_default() -> Result<Self> {
        Self::new(RedisConfig::default()).await
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Test Redis connection
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis health check failed")?;

        if pong == "PONG" {
            Ok(())
        } else {
            anyhow::bail!("Unexpected Redis response: {}", pong)
        }
    }
}

#[async_trait]
impl KeyedCache for RedisCache {
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let key = self.namespaced(key);

        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(value);
        if !ttl.is_zero() {
            // PX keeps sub-second TTLs meaningful; round up so 0 < ttl < 1ms still expires.
            let millis = ttl.as_millis().max(1) as u64;
            cmd.arg("PX").arg(millis);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;

        debug!("💾 Cached {} bytes under {}", value.len(), key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = conn.get(self.namespaced(key)).await?;
        Ok(bytes)
    }

    async fn delete_multi(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = keys.iter().map(|k| self.namespaced(k)).collect();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.config.key_prefix);

        // SCAN walks the keyspace incrementally instead of blocking on KEYS.
        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter = conn.scan_match::<_, String>(&pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }

        if !keys.is_empty() {
            let count = keys.len();
            conn.del::<_, ()>(keys).await?;
            info!("🗑️  Flushed {} cached keys under {}", count, self.config.key_prefix);
        }

        Ok(())
    }
}
