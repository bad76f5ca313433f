//! Versioned full snapshots with conditional reads.
//!
//! Every write persists a complete, immutable snapshot under one fixed parent
//! and invalidates all cache shards. Reads are served from a randomly chosen
//! cache shard when possible; the payload is only parsed when the client's
//! version tag does not match.

use chrono::{DateTime, SubsecRound, Utc};
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::keyed_cache::{CacheError, SharedCache};
use crate::metrics;
use crate::store::{query_with_timeout, Query, Record, RecordKey, SharedStore, SortOrder, StoreError};
use crate::types::{content_tag, DataPayload};

const SNAPSHOT_KIND: &str = "snapshot";
const SNAPSHOT_PARENT: &str = "dataset";
const CACHE_KEY_PREFIX: &str = "snapshot:latest:";

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_CACHE_SHARDS: usize = 4;
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub tag: String,
    pub timestamp: DateTime<Utc>,
    pub payload: DataPayload,
}

impl Snapshot {
    /// What readers get when nothing has been written yet.
    pub fn empty() -> Self {
        Self {
            tag: String::new(),
            timestamp: DateTime::<Utc>::default(),
            payload: DataPayload::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tag.is_empty()
    }

    /// Tag quoted for an `ETag` response header.
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.tag)
    }
}

/// Version tag and timestamp of a snapshot, without its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub tag: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a conditional read. Errors are the third outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotRead {
    Fresh(Snapshot),
    NotModified(SnapshotHeader),
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Snapshot payload is malformed: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("Snapshot record is malformed: {0}")]
    Record(#[from] bincode::Error),
}

/// Persisted record body. The record timestamp is the snapshot timestamp.
#[derive(Serialize, Deserialize)]
struct StoredSnapshot {
    tag: String,
    payload: Vec<u8>,
}

/// Cached copy of the latest snapshot. The payload stays serialized so the
/// not-modified path never parses it.
#[derive(Serialize, Deserialize)]
struct CachedSnapshot {
    tag: String,
    timestamp: DateTime<Utc>,
    payload: Vec<u8>,
}

pub struct SnapshotStore {
    store: SharedStore,
    cache: SharedCache,
    cache_ttl: Duration,
    shards: usize,
    query_timeout: Duration,
}

impl SnapshotStore {
    pub fn new(store: SharedStore, cache: SharedCache) -> Self {
        Self {
            store,
            cache,
            cache_ttl: DEFAULT_CACHE_TTL,
            shards: DEFAULT_CACHE_SHARDS,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Every cache key the latest snapshot may live under.
    pub fn shard_keys(&self) -> Vec<String> {
        (0..self.shards)
            .map(|i| format!("{}{}", CACHE_KEY_PREFIX, i))
            .collect()
    }

    fn pick_shard_key(&self) -> String {
        let shard = rand::thread_rng().gen_range(0..self.shards);
        format!("{}{}", CACHE_KEY_PREFIX, shard)
    }

    /// Persists a new snapshot and invalidates every cache shard.
    ///
    /// A failed invalidation is logged and does not fail the write: the stale
    /// shards expire on their own TTL. A reader that missed the cache before
    /// this write can still store the old snapshot after the invalidation;
    /// that shard is likewise stale for at most one cache TTL.
    pub async fn write(&self, payload: &DataPayload) -> Result<SnapshotHeader, SnapshotError> {
        let bytes = payload.to_bytes()?;
        let tag = content_tag(&bytes);
        // Microseconds, the finest precision every backend keeps.
        let timestamp = Utc::now().trunc_subsecs(6);

        let data = bincode::serialize(&StoredSnapshot {
            tag: tag.clone(),
            payload: bytes,
        })?;
        let id = Uuid::new_v4().to_string();
        self.store
            .put(Record {
                key: RecordKey::new(SNAPSHOT_KIND, SNAPSHOT_PARENT, id.clone()),
                timestamp,
                data,
            })
            .await?;
        metrics::increment_snapshot_write();
        info!(
            "📸 Stored snapshot {} (tag {}, {} items)",
            id,
            tag,
            payload.len()
        );

        if let Err(e) = self.cache.delete_multi(&self.shard_keys()).await {
            metrics::increment_cache_error("snapshot_invalidate");
            warn!("Snapshot cache invalidation failed, shards stay stale until TTL: {}", e);
        }

        Ok(SnapshotHeader { tag, timestamp })
    }

    /// Reads the latest snapshot, honoring the client's known version tags.
    ///
    /// With no snapshot stored, returns an empty `Fresh` snapshot.
    pub async fn read_latest(&self, if_none_match: &[&str]) -> Result<SnapshotRead, SnapshotError> {
        let shard_key = self.pick_shard_key();

        let latest = match self.load_cached(&shard_key).await {
            Some(cached) => cached,
            None => match self.load_latest_from_store().await? {
                Some(latest) => {
                    self.store_cached(&shard_key, &latest).await;
                    latest
                }
                None => return Ok(SnapshotRead::Fresh(Snapshot::empty())),
            },
        };

        if etag_matches(&latest.tag, if_none_match) {
            metrics::increment_snapshot_not_modified();
            return Ok(SnapshotRead::NotModified(SnapshotHeader {
                tag: latest.tag,
                timestamp: latest.timestamp,
            }));
        }

        let payload = DataPayload::from_bytes(&latest.payload)?;
        Ok(SnapshotRead::Fresh(Snapshot {
            tag: latest.tag,
            timestamp: latest.timestamp,
            payload,
        }))
    }

    /// Headers of the most recent snapshots, newest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<SnapshotHeader>, SnapshotError> {
        let query = Query::new(SNAPSHOT_KIND, SNAPSHOT_PARENT)
            .order(SortOrder::Descending)
            .limit(limit);
        let records = query_with_timeout(self.store.as_ref(), &query, self.query_timeout, SNAPSHOT_KIND).await?;

        records
            .iter()
            .map(|record| -> Result<SnapshotHeader, SnapshotError> {
                let stored: StoredSnapshot = bincode::deserialize(&record.data)?;
                Ok(SnapshotHeader {
                    tag: stored.tag,
                    timestamp: record.timestamp,
                })
            })
            .collect()
    }

    /// Deletes every snapshot.
    ///
    /// The cache is flushed before and after the delete: a reader that
    /// repopulates a shard while the delete runs is evicted by the second
    /// flush, so no cached copy of deleted data outlives this call.
    pub async fn clear_all(&self) -> Result<u64, SnapshotError> {
        self.cache.flush().await?;
        let deleted = self
            .store
            .delete_by_query(&Query::new(SNAPSHOT_KIND, SNAPSHOT_PARENT))
            .await?;
        self.cache.flush().await?;

        info!("🗑️  Cleared {} snapshots", deleted);
        Ok(deleted)
    }

    async fn load_cached(&self, shard_key: &str) -> Option<CachedSnapshot> {
        match self.cache.get(shard_key).await {
            Ok(Some(bytes)) => match bincode::deserialize::<CachedSnapshot>(&bytes) {
                Ok(cached) => {
                    metrics::increment_cache_hit("snapshot");
                    return Some(cached);
                }
                Err(e) => warn!("Ignoring undecodable snapshot cache entry {}: {}", shard_key, e),
            },
            Ok(None) => debug!("Snapshot cache miss on {}", shard_key),
            Err(e) => {
                metrics::increment_cache_error("snapshot_get");
                warn!("Snapshot cache lookup failed on {}: {}", shard_key, e);
            }
        }
        metrics::increment_cache_miss("snapshot");
        None
    }

    async fn store_cached(&self, shard_key: &str, latest: &CachedSnapshot) {
        let bytes = match bincode::serialize(latest) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode snapshot cache entry: {}", e);
                return;
            }
        };
        if let Err(e) = self.cache.set(shard_key, &bytes, self.cache_ttl).await {
            metrics::increment_cache_error("snapshot_set");
            warn!("Failed to repopulate snapshot cache {}: {}", shard_key, e);
        }
    }

    async fn load_latest_from_store(&self) -> Result<Option<CachedSnapshot>, SnapshotError> {
        let query = Query::new(SNAPSHOT_KIND, SNAPSHOT_PARENT)
            .order(SortOrder::Descending)
            .limit(1);
        let mut records = query_with_timeout(self.store.as_ref(), &query, self.query_timeout, SNAPSHOT_KIND).await?;

        let Some(record) = records.pop() else {
            return Ok(None);
        };
        let stored: StoredSnapshot = bincode::deserialize(&record.data)?;
        Ok(Some(CachedSnapshot {
            tag: stored.tag,
            timestamp: record.timestamp,
            payload: stored.payload,
        }))
    }
}

/// Strips whitespace, a weak-validator prefix and surrounding quotes.
pub fn normalize_etag(tag: &str) -> &str {
    let tag = tag.trim();
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    tag.trim_matches('"')
}

/// Whether `tag` matches any client-supplied tag. Each client value may hold
/// a comma-separated list, as in an `If-None-Match` header.
pub fn etag_matches(tag: &str, if_none_match: &[&str]) -> bool {
    if tag.is_empty() {
        return false;
    }
    if_none_match
        .iter()
        .flat_map(|value| value.split(','))
        .any(|candidate| normalize_etag(candidate) == tag)
}
