//! # Notification Pipeline
//!
//! Turns change-log activity into push notifications for changed sessions,
//! sending each `(session, version)` at most once under normal operation.
//!
//! ## Flow
//!
//! 1. `ChangeLog::catch_up` folds every change after the cursor.
//! 2. Each changed session becomes a [`NotifyCandidate`].
//! 3. `DedupSet::filter_unseen` drops candidates that were already sent.
//! 4. Survivors are marked seen, then handed to the [`NotificationDispatcher`].
//!
//! Marking happens before dispatch. A dispatcher failure therefore loses
//! that batch instead of resending it on the next run; an overlapping run
//! sees the markers as early as possible.
//!
//! ## Example
//!
//! ```rust,no_run
//! use confsync::notification_pipeline::NotificationDispatcher;
//! use confsync::types::NotifyCandidate;
//! use async_trait::async_trait;
//!
//! struct PushGateway;
//!
//! #[async_trait]
//! impl NotificationDispatcher for PushGateway {
//!     fn name(&self) -> &'static str {
//!         "push-gateway"
//!     }
//!
//!     async fn dispatch(&self, candidates: Vec<NotifyCandidate>) -> anyhow::Result<()> {
//!         // Fan out to subscribers
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::change_log::{ChangeLog, ChangeLogError};
use crate::dedup_set::{DedupError, DedupSet};
use crate::types::{session_candidates, NotifyCandidate};

/// Receives deduplicated candidates.
///
/// # Thread Safety
///
/// Dispatchers must be `Send + Sync`; one instance is shared by every run.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Delivers one batch of candidates.
    ///
    /// # Errors
    ///
    /// An error is reported to the caller of the pipeline run. The batch has
    /// already been marked seen and is not retried.
    async fn dispatch(&self, candidates: Vec<NotifyCandidate>) -> anyhow::Result<()>;
}

/// Dispatcher that only logs what it would send.
pub struct LogDispatcher {
    batch_size: usize,
}

impl LogDispatcher {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn dispatch(&self, candidates: Vec<NotifyCandidate>) -> anyhow::Result<()> {
        for batch in candidates.chunks(self.batch_size) {
            let keys: Vec<String> = batch.iter().map(NotifyCandidate::dedup_key).collect();
            info!(count = batch.len(), candidates = ?keys, "🔔 Would notify");
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Change log error: {0}")]
    ChangeLog(#[from] ChangeLogError),
    #[error("Dedup error: {0}")]
    Dedup(#[from] DedupError),
    #[error("Dispatcher '{name}' failed: {source}")]
    Dispatch {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    /// Cursor for the next run.
    pub cursor: DateTime<Utc>,
    /// Sessions changed since the previous cursor.
    pub candidates: usize,
    /// Candidates handed to the dispatcher.
    pub dispatched: usize,
}

pub struct NotificationPipeline {
    change_log: Arc<ChangeLog>,
    dedup: Arc<DedupSet>,
    dispatcher: Arc<dyn NotificationDispatcher>,
}

impl NotificationPipeline {
    pub fn new(change_log: Arc<ChangeLog>, dedup: Arc<DedupSet>, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        Self {
            change_log,
            dedup,
            dispatcher,
        }
    }

    /// Notifies every session changed after `since` that has not been
    /// notified at its current version yet.
    ///
    /// Safe to run repeatedly with the same cursor: already-marked
    /// candidates are filtered out.
    pub async fn run_since(&self, since: DateTime<Utc>) -> Result<PipelineReport, PipelineError> {
        let delta = self.change_log.catch_up(since).await?;
        let candidates = session_candidates(&delta.changes);
        let total = candidates.len();

        let unseen = self.dedup.filter_unseen(candidates).await?;
        if unseen.is_empty() {
            info!(candidates = total, cursor = %delta.timestamp, "No new notifications");
            return Ok(PipelineReport {
                cursor: delta.timestamp,
                candidates: total,
                dispatched: 0,
            });
        }

        self.dedup.mark_seen_if_new(&unseen).await?;

        let dispatched = unseen.len();
        let name = self.dispatcher.name();
        if let Err(source) = self.dispatcher.dispatch(unseen).await {
            warn!(dispatcher = name, error = %source, "Dispatch failed after marking candidates seen");
            return Err(PipelineError::Dispatch { name, source });
        }

        info!(
            candidates = total,
            dispatched,
            dispatcher = name,
            cursor = %delta.timestamp,
            "✅ Notification run complete"
        );
        Ok(PipelineReport {
            cursor: delta.timestamp,
            candidates: total,
            dispatched,
        })
    }
}
