//! Process-wide handle owning every component.
//!
//! Built once at startup and passed explicitly to whatever needs it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use std::sync::Arc;
use std::time::Duration;

use crate::cert_cache::CertCache;
use crate::change_log::ChangeLog;
use crate::dedup_set::DedupSet;
use crate::keyed_cache::{self, MemoryCache, SharedCache};
use crate::notification_pipeline::{LogDispatcher, NotificationDispatcher, NotificationPipeline};
use crate::settings::{NotificationSettings, Settings};
use crate::snapshot_store::{SnapshotHeader, SnapshotStore};
use crate::store::{self, MemoryStore, SharedStore};
use crate::types::DataPayload;

/// Result of publishing a snapshot together with its diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub snapshot: SnapshotHeader,
    /// Timestamp of the change-log entry, if a non-empty delta was given.
    pub change: Option<DateTime<Utc>>,
}

/// Rows removed by [`SyncContext::clear_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cleared {
    pub snapshots: u64,
    pub changes: u64,
}

pub struct SyncContext {
    pub cache: SharedCache,
    pub store: SharedStore,
    pub snapshots: Arc<SnapshotStore>,
    pub change_log: Arc<ChangeLog>,
    pub dedup: Arc<DedupSet>,
    pub certs: Arc<CertCache>,
    pub pipeline: Option<NotificationPipeline>,
}

impl SyncContext {
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let cache = keyed_cache::connect(&settings.cache.backend)
            .await
            .context("Failed to connect keyed cache")?;
        let store = store::connect(&settings.store.backend)
            .await
            .context("Failed to connect backing store")?;

        let query_timeout = settings.store.query_timeout();
        let snapshots = SnapshotStore::new(store.clone(), cache.clone())
            .with_cache_ttl(settings.snapshot.cache_ttl())
            .with_shards(settings.snapshot.cache_shards)
            .with_query_timeout(query_timeout);
        let change_log = ChangeLog::new(store.clone())
            .with_max_fold_entries(settings.change_log.max_fold_entries)
            .with_page_buffer(settings.change_log.page_buffer)
            .with_query_timeout(query_timeout);
        let certs = CertCache::with_timeout(
            cache.clone(),
            Duration::from_secs(settings.certs.request_timeout_seconds),
        )
        .context("Failed to build HTTP client for signing keys")?;

        let mut ctx = Self::assemble(cache, store, snapshots, change_log, certs);
        if let NotificationSettings::Log { batch_size } = settings.notifications {
            ctx = ctx.with_dispatcher(Arc::new(LogDispatcher::new(batch_size)));
        }

        info!("🚀 Sync context ready");
        Ok(ctx)
    }

    /// Memory cache and memory store with default tuning. No dispatcher.
    pub fn in_memory() -> Self {
        let cache: SharedCache = Arc::new(MemoryCache::new());
        let store: SharedStore = Arc::new(MemoryStore::new());
        Self::from_parts(cache, store)
    }

    /// Wires components with default tuning over existing backends.
    pub fn from_parts(cache: SharedCache, store: SharedStore) -> Self {
        let snapshots = SnapshotStore::new(store.clone(), cache.clone());
        let change_log = ChangeLog::new(store.clone());
        let certs = CertCache::new(cache.clone(), reqwest::Client::new());
        Self::assemble(cache, store, snapshots, change_log, certs)
    }

    fn assemble(
        cache: SharedCache,
        store: SharedStore,
        snapshots: SnapshotStore,
        change_log: ChangeLog,
        certs: CertCache,
    ) -> Self {
        Self {
            dedup: Arc::new(DedupSet::new(store.clone())),
            cache,
            store,
            snapshots: Arc::new(snapshots),
            change_log: Arc::new(change_log),
            certs: Arc::new(certs),
            pipeline: None,
        }
    }

    /// Enables the notification pipeline with the given dispatcher.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.pipeline = Some(NotificationPipeline::new(
            self.change_log.clone(),
            self.dedup.clone(),
            dispatcher,
        ));
        self
    }

    /// Writes a full snapshot, then appends its diff stamped with the
    /// snapshot's timestamp. An empty delta is not appended.
    ///
    /// The two writes are not atomic: if the append fails the snapshot is
    /// already the latest.
    pub async fn publish(&self, snapshot: &DataPayload, delta: &DataPayload) -> Result<Published> {
        let header = self
            .snapshots
            .write(snapshot)
            .await
            .context("Failed to write snapshot")?;

        let change = if delta.is_empty() {
            None
        } else {
            let ts = self
                .change_log
                .append_at(header.timestamp, delta)
                .await
                .context("Snapshot written but change-log append failed")?;
            Some(ts)
        };

        Ok(Published {
            snapshot: header,
            change,
        })
    }

    /// Deletes every snapshot and change entry and flushes the cache.
    /// Dedup markers are kept so cleared data is not re-notified.
    pub async fn clear_all(&self) -> Result<Cleared> {
        let snapshots = self
            .snapshots
            .clear_all()
            .await
            .context("Failed to clear snapshots")?;
        let changes = self
            .change_log
            .clear_all()
            .await
            .context("Failed to clear change log")?;

        info!("🗑️  Cleared {} snapshots and {} change entries", snapshots, changes);
        Ok(Cleared { snapshots, changes })
    }
}
