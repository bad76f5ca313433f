//! Append-only log of incremental diffs.
//!
//! `since` folds the entries after a timestamp into one consolidated delta,
//! newest value per id winning. One fold is capped; `catch_up` pages through
//! longer histories with a bounded producer/consumer pair.

use chrono::{DateTime, SubsecRound, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::store::{query_with_timeout, Query, Record, RecordKey, SharedStore, StoreError};
use crate::types::DataPayload;

const CHANGE_KIND: &str = "change";
const CHANGE_PARENT: &str = "changelog";

pub const DEFAULT_MAX_FOLD_ENTRIES: usize = 1000;
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_PAGE_BUFFER: usize = 4;

/// Changes folded from one or more change-log entries.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidatedDelta {
    /// Timestamp of the newest entry visited, or the query timestamp when
    /// nothing matched. Pass it back as the next `since` cursor.
    pub timestamp: DateTime<Utc>,
    /// Id of the newest entry visited. Entries can share a timestamp, so a
    /// truncated page resumes after `(timestamp, cursor_id)`.
    pub cursor_id: Option<String>,
    pub changes: DataPayload,
    /// Entries folded into `changes`.
    pub entries: usize,
    /// Malformed entries that were skipped.
    pub skipped: usize,
    /// The fold hit its entry cap; more entries may follow `timestamp`.
    pub truncated: bool,
}

impl ConsolidatedDelta {
    pub fn empty_at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            cursor_id: None,
            changes: DataPayload::default(),
            entries: 0,
            skipped: 0,
            truncated: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Folds a later page into this delta.
    fn absorb(&mut self, later: ConsolidatedDelta) {
        self.changes.merge_from(later.changes);
        if later.entries + later.skipped > 0 {
            self.timestamp = later.timestamp;
            self.cursor_id = later.cursor_id;
        }
        self.entries += later.entries;
        self.skipped += later.skipped;
        self.truncated = later.truncated;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChangeLogError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to encode change entry: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type PageSender = mpsc::Sender<Result<ConsolidatedDelta, ChangeLogError>>;

pub struct ChangeLog {
    store: SharedStore,
    max_fold_entries: usize,
    query_timeout: Duration,
    page_buffer: usize,
}

impl ChangeLog {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            max_fold_entries: DEFAULT_MAX_FOLD_ENTRIES,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            page_buffer: DEFAULT_PAGE_BUFFER,
        }
    }

    pub fn with_max_fold_entries(mut self, max: usize) -> Self {
        self.max_fold_entries = max.max(1);
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_page_buffer(mut self, pages: usize) -> Self {
        self.page_buffer = pages.max(1);
        self
    }

    /// Appends a delta stamped with the current time.
    pub async fn append(&self, delta: &DataPayload) -> Result<DateTime<Utc>, ChangeLogError> {
        self.append_at(Utc::now(), delta).await
    }

    /// Appends a delta at `timestamp`, truncated to microseconds so the
    /// returned stamp matches what every backend stores.
    pub async fn append_at(
        &self,
        timestamp: DateTime<Utc>,
        delta: &DataPayload,
    ) -> Result<DateTime<Utc>, ChangeLogError> {
        let timestamp = timestamp.trunc_subsecs(6);
        let data = delta.to_bytes()?;
        self.store
            .put(Record {
                key: RecordKey::new(CHANGE_KIND, CHANGE_PARENT, Uuid::new_v4().to_string()),
                timestamp,
                data,
            })
            .await?;
        debug!(items = delta.len(), %timestamp, "Appended change entry");
        Ok(timestamp)
    }

    /// Folds entries with a timestamp strictly after `since`, oldest first,
    /// up to the entry cap.
    ///
    /// Malformed entries are skipped and counted rather than failing the
    /// fold. The result timestamp still advances past them so a paging
    /// caller does not revisit them.
    pub async fn since(&self, since: DateTime<Utc>) -> Result<ConsolidatedDelta, ChangeLogError> {
        self.page(since, None).await
    }

    /// One capped fold after `(since, after_id)`, ordered by timestamp then id.
    async fn page(&self, since: DateTime<Utc>, after_id: Option<String>) -> Result<ConsolidatedDelta, ChangeLogError> {
        let query = Query::new(CHANGE_KIND, CHANGE_PARENT);
        let query = match &after_id {
            Some(id) => query.after_key(since, id.clone()),
            None => query.after(since),
        }
        .limit(self.max_fold_entries);
        let records = query_with_timeout(self.store.as_ref(), &query, self.query_timeout, CHANGE_KIND).await?;

        let mut delta = ConsolidatedDelta::empty_at(since);
        delta.cursor_id = after_id;
        delta.truncated = records.len() >= self.max_fold_entries;

        for record in records {
            match DataPayload::from_bytes(&record.data) {
                Ok(changes) => {
                    delta.changes.merge_from(changes);
                    delta.entries += 1;
                }
                Err(e) => {
                    warn!(entry = %record.key.id, error = %e, "Skipping malformed change-log entry");
                    delta.skipped += 1;
                }
            }
            delta.timestamp = record.timestamp;
            delta.cursor_id = Some(record.key.id);
        }

        if delta.skipped > 0 {
            metrics::increment_changelog_skipped(delta.skipped as u64);
        }
        Ok(delta)
    }

    /// Produces successive capped pages into `pages` until a page comes back
    /// under the cap. Each page resumes after the last entry of the previous
    /// one, so entries sharing a timestamp across a page boundary are kept.
    ///
    /// A store error is sent as the final item. The sender is dropped on
    /// every exit path, so the receiver always sees the end of the stream.
    pub async fn stream_since(&self, since: DateTime<Utc>, pages: PageSender) {
        let mut cursor = since;
        let mut cursor_id: Option<String> = None;
        loop {
            match self.page(cursor, cursor_id.take()).await {
                Ok(page) => {
                    let more = page.truncated;
                    cursor = page.timestamp;
                    cursor_id = page.cursor_id.clone();
                    if pages.send(Ok(page)).await.is_err() {
                        debug!("Change-log page consumer went away");
                        return;
                    }
                    if !more {
                        return;
                    }
                }
                Err(e) => {
                    let _ = pages.send(Err(e)).await;
                    return;
                }
            }
        }
    }

    /// Every change after `since`, however many pages that takes.
    pub async fn catch_up(&self, since: DateTime<Utc>) -> Result<ConsolidatedDelta, ChangeLogError> {
        let (tx, mut rx) = mpsc::channel(self.page_buffer);

        let producer = self.stream_since(since, tx);
        let consumer = async move {
            let mut merged = ConsolidatedDelta::empty_at(since);
            while let Some(page) = rx.recv().await {
                merged.absorb(page?);
            }
            Ok::<_, ChangeLogError>(merged)
        };

        let ((), merged) = tokio::join!(producer, consumer);
        merged
    }

    /// Deletes every entry. Administrative only.
    pub async fn clear_all(&self) -> Result<u64, ChangeLogError> {
        let deleted = self
            .store
            .delete_by_query(&Query::new(CHANGE_KIND, CHANGE_PARENT))
            .await?;
        info!(deleted, "Cleared change log");
        Ok(deleted)
    }
}
