//! Backing store boundary.
//!
//! The snapshot store, change log and dedup set only rely on the primitives
//! of [`BackingStore`]: single-key get/put, parent-scoped range queries with a
//! sort order and limit, multi-key lookups and creates with per-key results,
//! and administrative delete-by-query.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::metrics;
use crate::settings::StoreBackendSettings;

/// Identity of a stored record. Records sharing `kind` and `parent` form one
/// group that can be listed consistently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub kind: String,
    pub parent: String,
    pub id: String,
}

impl RecordKey {
    pub fn new(kind: &str, parent: &str, id: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            parent: parent.to_string(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: RecordKey,
    /// Indexed sort field.
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Parent-scoped listing over one record kind, ordered by timestamp.
#[derive(Debug, Clone)]
pub struct Query {
    pub kind: String,
    pub parent: String,
    /// Only records with a timestamp strictly greater than this.
    pub after: Option<DateTime<Utc>>,
    /// Tiebreak for `after`: also admit records at exactly `after` whose id
    /// sorts after this one. Pages resume on `(timestamp, id)`.
    pub after_id: Option<String>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(kind: &str, parent: &str) -> Self {
        Self {
            kind: kind.to_string(),
            parent: parent.to_string(),
            after: None,
            after_id: None,
            order: SortOrder::Ascending,
            limit: None,
        }
    }

    pub fn after(mut self, timestamp: DateTime<Utc>) -> Self {
        self.after = Some(timestamp);
        self
    }

    /// Records strictly after `(timestamp, id)` in `(timestamp, id)` order.
    pub fn after_key(mut self, timestamp: DateTime<Utc>, id: impl Into<String>) -> Self {
        self.after = Some(timestamp);
        self.after_id = Some(id.into());
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a record falls inside this query's scope (ignores order and limit).
    pub fn matches(&self, record: &Record) -> bool {
        record.key.kind == self.kind
            && record.key.parent == self.parent
            && self.after.map_or(true, |after| match &self.after_id {
                Some(after_id) => {
                    record.timestamp > after || (record.timestamp == after && record.key.id > *after_id)
                }
                None => record.timestamp > after,
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record already exists: {0}")]
    AlreadyExists(String),
    #[error("Store query timed out after {0:?}")]
    Timeout(Duration),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Per-key outcome of a multi-key operation.
pub type KeyResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Writes a record, replacing any record with the same key.
    async fn put(&self, record: Record) -> Result<(), StoreError>;

    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError>;

    async fn query(&self, query: &Query) -> Result<Vec<Record>, StoreError>;

    /// Looks up many keys at once. The outer error fails the whole call; the
    /// inner results line up with `keys`.
    async fn get_multi(&self, keys: &[RecordKey]) -> Result<Vec<KeyResult<Option<Record>>>, StoreError>;

    /// Inserts records that do not exist yet. A key that already exists
    /// yields `Err(StoreError::AlreadyExists)` at its position.
    async fn create_multi(&self, records: Vec<Record>) -> Result<Vec<KeyResult<()>>, StoreError>;

    /// Deletes every record in the query's scope. `order` and `limit` are
    /// ignored. Returns the number of deleted records.
    async fn delete_by_query(&self, query: &Query) -> Result<u64, StoreError>;
}

pub type SharedStore = Arc<dyn BackingStore>;

/// Runs a listing query bounded by `timeout`.
pub async fn query_with_timeout(
    store: &dyn BackingStore,
    query: &Query,
    timeout: Duration,
    label: &'static str,
) -> Result<Vec<Record>, StoreError> {
    let start = Instant::now();
    let result = tokio::time::timeout(timeout, store.query(query))
        .await
        .map_err(|_| StoreError::Timeout(timeout))?;
    metrics::record_store_query_duration(label, start.elapsed());
    result
}

/// Builds the store backend selected in configuration.
pub async fn connect(settings: &StoreBackendSettings) -> anyhow::Result<SharedStore> {
    match settings {
        StoreBackendSettings::Memory => {
            log::info!("Using in-memory backing store (data is not durable)");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackendSettings::Postgres {
            url,
            max_connections,
            connect_attempts,
        } => {
            let store = PostgresStore::connect(url, *max_connections, *connect_attempts).await?;
            Ok(Arc::new(store))
        }
    }
}
