//! In-process record store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ferry_engine::{apply_remote_mutation, MutationRequest, PageCursor, RemoteRecord, Timestamp};
use tokio::sync::Mutex;

use super::{Applied, RecordStore};
use crate::error::Result;

/// Record store held in memory, keyed by `(model, record_id)`.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<(String, String), RemoteRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, model: &str, record_id: &str) -> Result<Option<RemoteRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .get(&(model.to_string(), record_id.to_string()))
            .cloned())
    }

    async fn page(
        &self,
        model: &str,
        since: Option<Timestamp>,
        after: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<RemoteRecord>> {
        let records = self.records.lock().await;
        let mut matching: Vec<_> = records
            .values()
            .filter(|r| r.record.model == model)
            .filter(|r| since.map_or(true, |since| r.last_changed_at >= since))
            .filter(|r| after.map_or(true, |cursor| cursor.admits(r)))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            (a.last_changed_at, &a.record.id).cmp(&(b.last_changed_at, &b.record.id))
        });

        matching.truncate(limit);
        Ok(matching)
    }

    async fn mutate(&self, request: &MutationRequest, now: Timestamp) -> Result<Applied> {
        let mut records = self.records.lock().await;
        let key = (request.model.clone(), request.record.id.clone());

        let current = records.get(&key);
        let record = apply_remote_mutation(current, request, now)?;
        let changed = current != Some(&record);
        if changed {
            records.insert(key, record.clone());
        }

        Ok(Applied { record, changed })
    }
}
