use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{BackingStore, KeyResult, Query, Record, RecordKey, SortOrder, StoreError};

/// Process-local store with the same semantics as the durable backend.
/// Used in tests and for single-process deployments.
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<RecordKey, Record>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn put(&self, record: Record) -> Result<(), StoreError> {
        self.records.insert(record.key.clone(), record);
        Ok(())
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    async fn query(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        let mut matched: Vec<Record> = self
            .records
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        matched.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.key.id.cmp(&b.key.id))
        });
        if query.order == SortOrder::Descending {
            matched.reverse();
        }
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn get_multi(&self, keys: &[RecordKey]) -> Result<Vec<KeyResult<Option<Record>>>, StoreError> {
        Ok(keys
            .iter()
            .map(|key| Ok(self.records.get(key).map(|entry| entry.value().clone())))
            .collect())
    }

    async fn create_multi(&self, records: Vec<Record>) -> Result<Vec<KeyResult<()>>, StoreError> {
        Ok(records
            .into_iter()
            .map(|record| match self.records.entry(record.key.clone()) {
                Entry::Occupied(_) => Err(StoreError::AlreadyExists(record.key.id)),
                Entry::Vacant(slot) => {
                    slot.insert(record);
                    Ok(())
                }
            })
            .collect())
    }

    async fn delete_by_query(&self, query: &Query) -> Result<u64, StoreError> {
        let before = self.records.len();
        self.records.retain(|_, record| !query.matches(record));
        Ok(before.saturating_sub(self.records.len()) as u64)
    }
}
