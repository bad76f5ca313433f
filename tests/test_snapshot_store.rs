//! Integration tests for the snapshot store
//!
//! Tests cover:
//! - Write/read round trip and content-derived tags
//! - Conditional reads (not-modified)
//! - Cache invalidation across shards
//! - Invalidation failures not failing the write
//! - clear_all racing a cache repopulation
//! - A cache-miss reader racing a writer stays stale for at most one TTL
//! - Listing-query timeout and microsecond timestamps

use async_trait::async_trait;
use chrono::Utc;
use confsync::keyed_cache::{CacheError, KeyedCache, MemoryCache, SharedCache};
use confsync::snapshot_store::{SnapshotError, SnapshotRead, SnapshotStore};
use confsync::store::{
    BackingStore, KeyResult, MemoryStore, Query, Record, RecordKey, SharedStore, StoreError,
};
use confsync::types::DataPayload;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn payload(title: &str) -> DataPayload {
    let mut p = DataPayload::default();
    p.sessions.insert("s1".into(), json!({ "title": title }));
    p.speakers.insert("sp1".into(), json!({ "name": "Ada" }));
    p
}

fn memory_backends() -> (SharedStore, SharedCache) {
    (Arc::new(MemoryStore::new()), Arc::new(MemoryCache::new()))
}

/// Memory store that counts listing queries.
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    queries: AtomicUsize,
}

#[async_trait]
impl BackingStore for CountingStore {
    async fn put(&self, record: Record) -> Result<(), StoreError> {
        self.inner.put(record).await
    }
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        self.inner.get(key).await
    }
    async fn query(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.query(query).await
    }
    async fn get_multi(&self, keys: &[RecordKey]) -> Result<Vec<KeyResult<Option<Record>>>, StoreError> {
        self.inner.get_multi(keys).await
    }
    async fn create_multi(&self, records: Vec<Record>) -> Result<Vec<KeyResult<()>>, StoreError> {
        self.inner.create_multi(records).await
    }
    async fn delete_by_query(&self, query: &Query) -> Result<u64, StoreError> {
        self.inner.delete_by_query(query).await
    }
}

/// Memory store whose delete first writes stale bytes into the given cache
/// keys, like a reader repopulating the cache mid-clear.
struct RepopulatingStore {
    inner: MemoryStore,
    cache: SharedCache,
    keys: Vec<String>,
}

#[async_trait]
impl BackingStore for RepopulatingStore {
    async fn put(&self, record: Record) -> Result<(), StoreError> {
        self.inner.put(record).await
    }
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        self.inner.get(key).await
    }
    async fn query(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        self.inner.query(query).await
    }
    async fn get_multi(&self, keys: &[RecordKey]) -> Result<Vec<KeyResult<Option<Record>>>, StoreError> {
        self.inner.get_multi(keys).await
    }
    async fn create_multi(&self, records: Vec<Record>) -> Result<Vec<KeyResult<()>>, StoreError> {
        self.inner.create_multi(records).await
    }
    async fn delete_by_query(&self, query: &Query) -> Result<u64, StoreError> {
        for key in &self.keys {
            self.cache
                .set(key, b"stale", Duration::from_secs(3600))
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        self.inner.delete_by_query(query).await
    }
}

/// Store whose first listing query loads its result, then lets a writer
/// publish and invalidate before returning the now outdated records.
struct RacingStore {
    inner: Arc<MemoryStore>,
    writer: SnapshotStore,
    next: DataPayload,
    raced: AtomicBool,
}

#[async_trait]
impl BackingStore for RacingStore {
    async fn put(&self, record: Record) -> Result<(), StoreError> {
        self.inner.put(record).await
    }
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        self.inner.get(key).await
    }
    async fn query(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        let records = self.inner.query(query).await?;
        if !self.raced.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.writer
                .write(&self.next)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        Ok(records)
    }
    async fn get_multi(&self, keys: &[RecordKey]) -> Result<Vec<KeyResult<Option<Record>>>, StoreError> {
        self.inner.get_multi(keys).await
    }
    async fn create_multi(&self, records: Vec<Record>) -> Result<Vec<KeyResult<()>>, StoreError> {
        self.inner.create_multi(records).await
    }
    async fn delete_by_query(&self, query: &Query) -> Result<u64, StoreError> {
        self.inner.delete_by_query(query).await
    }
}

/// Memory store whose listing queries take longer than any test timeout.
#[derive(Default)]
struct SlowStore {
    inner: MemoryStore,
}

#[async_trait]
impl BackingStore for SlowStore {
    async fn put(&self, record: Record) -> Result<(), StoreError> {
        self.inner.put(record).await
    }
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        self.inner.get(key).await
    }
    async fn query(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.inner.query(query).await
    }
    async fn get_multi(&self, keys: &[RecordKey]) -> Result<Vec<KeyResult<Option<Record>>>, StoreError> {
        self.inner.get_multi(keys).await
    }
    async fn create_multi(&self, records: Vec<Record>) -> Result<Vec<KeyResult<()>>, StoreError> {
        self.inner.create_multi(records).await
    }
    async fn delete_by_query(&self, query: &Query) -> Result<u64, StoreError> {
        self.inner.delete_by_query(query).await
    }
}

/// Memory cache whose `delete_multi` always fails.
#[derive(Default)]
struct NoInvalidateCache {
    inner: MemoryCache,
}

#[async_trait]
impl KeyedCache for NoInvalidateCache {
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        self.inner.set(key, value, ttl).await
    }
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.inner.get(key).await
    }
    async fn delete_multi(&self, _keys: &[String]) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("cache tier down".to_string()))
    }
    async fn flush(&self) -> Result<(), CacheError> {
        self.inner.flush().await
    }
}

fn expect_fresh(read: SnapshotRead) -> confsync::Snapshot {
    match read {
        SnapshotRead::Fresh(snapshot) => snapshot,
        SnapshotRead::NotModified(header) => panic!("Expected a fresh snapshot, got not-modified {}", header.tag),
    }
}

#[tokio::test]
async fn test_write_then_read_round_trip() {
    let (store, cache) = memory_backends();
    let snapshots = SnapshotStore::new(store, cache);

    let written = payload("Keynote");
    let header = snapshots.write(&written).await.unwrap();

    let snapshot = expect_fresh(snapshots.read_latest(&[]).await.unwrap());
    assert_eq!(snapshot.payload, written);
    assert_eq!(snapshot.tag, header.tag);
    assert_eq!(snapshot.timestamp, header.timestamp);
    assert_eq!(snapshot.etag(), format!("\"{}\"", header.tag));
}

#[tokio::test]
async fn test_identical_content_gets_identical_tag() {
    let (store, cache) = memory_backends();
    let snapshots = SnapshotStore::new(store, cache);

    let first = snapshots.write(&payload("Keynote")).await.unwrap();
    let second = snapshots.write(&payload("Keynote")).await.unwrap();
    let third = snapshots.write(&payload("Closing")).await.unwrap();

    assert_eq!(first.tag, second.tag);
    assert_ne!(first.tag, third.tag);
}

#[tokio::test]
async fn test_conditional_read_returns_not_modified() {
    let (store, cache) = memory_backends();
    let snapshots = SnapshotStore::new(store, cache);
    let header = snapshots.write(&payload("Keynote")).await.unwrap();

    let quoted = format!("\"{}\"", header.tag);
    match snapshots.read_latest(&[quoted.as_str()]).await.unwrap() {
        SnapshotRead::NotModified(h) => assert_eq!(h, header),
        SnapshotRead::Fresh(_) => panic!("Matching tag should be answered with not-modified"),
    }

    // A stale tag gets the full payload.
    let snapshot = expect_fresh(snapshots.read_latest(&["\"outdated\""]).await.unwrap());
    assert_eq!(snapshot.tag, header.tag);
}

#[tokio::test]
async fn test_cache_serves_repeat_reads() {
    let store = Arc::new(CountingStore::default());
    let cache: SharedCache = Arc::new(MemoryCache::new());
    let snapshots = SnapshotStore::new(store.clone(), cache).with_shards(1);

    snapshots.write(&payload("Keynote")).await.unwrap();
    snapshots.read_latest(&[]).await.unwrap();
    snapshots.read_latest(&[]).await.unwrap();
    snapshots.read_latest(&[]).await.unwrap();

    assert_eq!(store.queries.load(Ordering::SeqCst), 1, "Only the first read should reach the store");
}

#[tokio::test]
async fn test_write_invalidates_every_shard() {
    let (store, cache) = memory_backends();
    let snapshots = SnapshotStore::new(store, cache);

    snapshots.write(&payload("Before")).await.unwrap();
    // Enough reads to populate several shards.
    for _ in 0..32 {
        snapshots.read_latest(&[]).await.unwrap();
    }

    let after = payload("After");
    snapshots.write(&after).await.unwrap();

    for _ in 0..32 {
        let snapshot = expect_fresh(snapshots.read_latest(&[]).await.unwrap());
        assert_eq!(snapshot.payload, after, "A read after a write must not see the old payload");
    }
}

#[tokio::test]
async fn test_failed_invalidation_does_not_fail_write() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let cache: SharedCache = Arc::new(NoInvalidateCache::default());
    let snapshots = SnapshotStore::new(store, cache);

    let header = snapshots.write(&payload("Keynote")).await.unwrap();

    let history = snapshots.history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].tag, header.tag);
}

#[tokio::test]
async fn test_empty_dataset_reads_as_empty_snapshot() {
    let (store, cache) = memory_backends();
    let snapshots = SnapshotStore::new(store, cache);

    let snapshot = expect_fresh(snapshots.read_latest(&[]).await.unwrap());
    assert!(snapshot.is_empty());
    assert!(snapshot.payload.is_empty());
    assert_eq!(snapshot.tag, "");

    // An empty client tag never matches the empty snapshot.
    let snapshot = expect_fresh(snapshots.read_latest(&["\"\""]).await.unwrap());
    assert!(snapshot.is_empty());
}

#[tokio::test]
async fn test_corrupt_stored_snapshot_fails_read() {
    let (store, cache) = memory_backends();
    store
        .put(Record {
            key: RecordKey::new("snapshot", "dataset", "broken"),
            timestamp: Utc::now(),
            data: b"not a snapshot".to_vec(),
        })
        .await
        .unwrap();

    let snapshots = SnapshotStore::new(store, cache);
    assert!(snapshots.read_latest(&[]).await.is_err());
}

#[tokio::test]
async fn test_history_is_newest_first() {
    let (store, cache) = memory_backends();
    let snapshots = SnapshotStore::new(store, cache);

    let mut tags = Vec::new();
    for title in ["One", "Two", "Three"] {
        tags.push(snapshots.write(&payload(title)).await.unwrap().tag);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let history = snapshots.history(2).await.unwrap();
    let got: Vec<&str> = history.iter().map(|h| h.tag.as_str()).collect();
    assert_eq!(got, vec![tags[2].as_str(), tags[1].as_str()]);
}

#[tokio::test]
async fn test_clear_all_leaves_no_cached_copy() {
    let cache: SharedCache = Arc::new(MemoryCache::new());
    let shard_keys = SnapshotStore::new(Arc::new(MemoryStore::new()), cache.clone()).shard_keys();
    let store: SharedStore = Arc::new(RepopulatingStore {
        inner: MemoryStore::new(),
        cache: cache.clone(),
        keys: shard_keys.clone(),
    });
    let snapshots = SnapshotStore::new(store, cache.clone());

    snapshots.write(&payload("Keynote")).await.unwrap();
    snapshots.read_latest(&[]).await.unwrap();

    let deleted = snapshots.clear_all().await.unwrap();
    assert_eq!(deleted, 1);

    for key in &shard_keys {
        assert_eq!(cache.get(key).await.unwrap(), None, "Shard {} survived clear_all", key);
    }
    let snapshot = expect_fresh(snapshots.read_latest(&[]).await.unwrap());
    assert!(snapshot.is_empty());
}

#[tokio::test]
async fn test_reader_racing_a_writer_is_stale_for_at_most_one_ttl() {
    let inner = Arc::new(MemoryStore::new());
    let cache: SharedCache = Arc::new(MemoryCache::new());
    let writer = SnapshotStore::new(inner.clone(), cache.clone()).with_shards(1);
    writer.write(&payload("Before")).await.unwrap();

    let after = payload("After");
    let store: SharedStore = Arc::new(RacingStore {
        inner,
        writer,
        next: after.clone(),
        raced: AtomicBool::new(false),
    });
    let reader = SnapshotStore::new(store, cache)
        .with_shards(1)
        .with_cache_ttl(Duration::from_millis(100));

    // The miss loaded "Before"; the write and its invalidation landed before
    // the reader cached it, so the shard now holds the old snapshot.
    let stale = expect_fresh(reader.read_latest(&[]).await.unwrap());
    assert_eq!(stale.payload, payload("Before"));
    let still_stale = expect_fresh(reader.read_latest(&[]).await.unwrap());
    assert_eq!(still_stale.payload, payload("Before"));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let fresh = expect_fresh(reader.read_latest(&[]).await.unwrap());
    assert_eq!(fresh.payload, after);
}

#[tokio::test]
async fn test_slow_query_times_out() {
    let cache: SharedCache = Arc::new(MemoryCache::new());
    let snapshots =
        SnapshotStore::new(Arc::new(SlowStore::default()), cache).with_query_timeout(Duration::from_millis(10));

    let result = snapshots.read_latest(&[]).await;
    assert!(
        matches!(result, Err(SnapshotError::Store(StoreError::Timeout(_)))),
        "Expected a timeout, got {:?}",
        result.map(|_| ())
    );
    assert!(matches!(
        snapshots.history(1).await,
        Err(SnapshotError::Store(StoreError::Timeout(_)))
    ));
}

#[tokio::test]
async fn test_write_timestamp_matches_stored_timestamp() {
    let (store, cache) = memory_backends();
    let snapshots = SnapshotStore::new(store, cache);

    let header = snapshots.write(&payload("Keynote")).await.unwrap();
    assert_eq!(header.timestamp.timestamp_subsec_nanos() % 1_000, 0);

    let history = snapshots.history(1).await.unwrap();
    assert_eq!(history[0].timestamp, header.timestamp);
    let latest = expect_fresh(snapshots.read_latest(&[]).await.unwrap());
    assert_eq!(latest.timestamp, header.timestamp);
}
