//! Durable "already notified" markers keyed by `(item id, version)`.
//!
//! `filter_unseen` followed by `mark_seen_if_new` is not atomic: two runs that
//! overlap may both see an item as unseen. Markers are idempotent, so the
//! only cost is a duplicate notification.

use chrono::Utc;
use log::debug;

use crate::metrics;
use crate::store::{Query, Record, RecordKey, SharedStore, StoreError};
use crate::types::NotifyCandidate;

const DEDUP_KIND: &str = "notified";
const DEDUP_PARENT: &str = "dedup";

#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Dedup marker {key} failed: {source}")]
    Marker {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("Store returned {got} results for {expected} keys")]
    ResultCount { expected: usize, got: usize },
}

pub struct DedupSet {
    store: SharedStore,
}

impl DedupSet {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn marker_key(candidate: &NotifyCandidate) -> RecordKey {
        RecordKey::new(DEDUP_KIND, DEDUP_PARENT, candidate.dedup_key())
    }

    /// Records every candidate as seen. Markers that already exist are left
    /// alone; any other per-key failure fails the call.
    pub async fn mark_seen_if_new(&self, candidates: &[NotifyCandidate]) -> Result<(), DedupError> {
        if candidates.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let records: Vec<Record> = candidates
            .iter()
            .map(|c| Record {
                key: Self::marker_key(c),
                timestamp: now,
                data: Vec::new(),
            })
            .collect();

        let results = self.store.create_multi(records).await?;
        check_count(candidates.len(), results.len())?;

        let mut existing = 0usize;
        for (candidate, result) in candidates.iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(StoreError::AlreadyExists(_)) => existing += 1,
                Err(source) => {
                    return Err(DedupError::Marker {
                        key: candidate.dedup_key(),
                        source,
                    })
                }
            }
        }

        debug!(
            "Marked {} candidates as seen ({} already marked)",
            candidates.len() - existing,
            existing
        );
        Ok(())
    }

    /// Candidates with no marker yet, in input order.
    ///
    /// Any per-key lookup failure fails the whole call, so callers never
    /// notify on a partial answer.
    pub async fn filter_unseen(&self, candidates: Vec<NotifyCandidate>) -> Result<Vec<NotifyCandidate>, DedupError> {
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let keys: Vec<RecordKey> = candidates.iter().map(Self::marker_key).collect();
        let results = self.store.get_multi(&keys).await?;
        check_count(candidates.len(), results.len())?;

        let mut unseen = Vec::with_capacity(candidates.len());
        for (candidate, result) in candidates.into_iter().zip(results) {
            match result {
                Ok(Some(_)) => {}
                Ok(None) => unseen.push(candidate),
                Err(source) => {
                    return Err(DedupError::Marker {
                        key: candidate.dedup_key(),
                        source,
                    })
                }
            }
        }

        let seen = keys.len() - unseen.len();
        metrics::record_dedup_outcome(seen as u64, unseen.len() as u64);
        debug!("Dedup filter: {} seen, {} unseen", seen, unseen.len());
        Ok(unseen)
    }

    /// Deletes every marker. Administrative only.
    pub async fn clear_all(&self) -> Result<u64, DedupError> {
        Ok(self
            .store
            .delete_by_query(&Query::new(DEDUP_KIND, DEDUP_PARENT))
            .await?)
    }
}

fn check_count(expected: usize, got: usize) -> Result<(), DedupError> {
    if expected == got {
        Ok(())
    } else {
        Err(DedupError::ResultCount { expected, got })
    }
}
