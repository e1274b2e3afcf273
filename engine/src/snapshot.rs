//! Snapshot of the local store: user records, sync metadata, outbox and checkpoints.
//!
//! The snapshot is both the in-memory state of [`MemoryStore`](crate::MemoryStore)
//! and its on-disk format. BTreeMaps keep serialization deterministic.

use crate::mutation::Sequence;
use crate::{
    error::Result, Error, ModelName, ModelRegistry, MutationEvent, Record, RecordId,
    SchemaVersion, SyncMetadata, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time image of everything the local store holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    /// User records by model, then id
    pub records: BTreeMap<ModelName, BTreeMap<RecordId, Record>>,
    /// Sync metadata by model, then id
    pub metadata: BTreeMap<ModelName, BTreeMap<RecordId, SyncMetadata>>,
    /// Outbox keyed by append sequence
    pub outbox: BTreeMap<Sequence, MutationEvent>,
    /// Last successful sync checkpoint per model
    pub checkpoints: BTreeMap<ModelName, Timestamp>,
    /// Sequence the next appended mutation receives
    pub next_sequence: Sequence,
}

impl StoreSnapshot {
    /// Create an empty snapshot.
    pub fn new(schema_version: SchemaVersion) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            records: BTreeMap::new(),
            metadata: BTreeMap::new(),
            outbox: BTreeMap::new(),
            checkpoints: BTreeMap::new(),
            next_sequence: 1,
        }
    }

    pub fn get_record(&self, model: &str, id: &str) -> Option<&Record> {
        self.records.get(model)?.get(id)
    }

    pub fn get_metadata(&self, model: &str, id: &str) -> Option<&SyncMetadata> {
        self.metadata.get(model)?.get(id)
    }

    /// Outbox entries for one record in sequence order.
    pub fn mutations_for<'a>(
        &'a self,
        model: &'a str,
        id: &'a str,
    ) -> impl Iterator<Item = &'a MutationEvent> + 'a {
        self.outbox
            .values()
            .filter(move |e| e.model == model && e.record_id == id)
    }

    /// Count user records across all models.
    pub fn record_count(&self) -> usize {
        self.records.values().map(|m| m.len()).sum()
    }

    /// Empty every table. The sequence counter keeps counting so sequences never repeat.
    pub fn clear(&mut self) {
        self.records.clear();
        self.metadata.clear();
        self.outbox.clear();
        self.checkpoints.clear();
    }

    /// Validate the snapshot against a registry.
    pub fn validate(&self, registry: &ModelRegistry) -> Result<()> {
        if self.schema_version != registry.version {
            return Err(Error::SchemaVersionMismatch {
                expected: registry.version,
                actual: self.schema_version,
            });
        }

        for (model, records) in &self.records {
            let schema = registry.model(model)?;
            for record in records.values() {
                schema.validate_payload(&record.payload)?;
            }
        }

        for (sequence, event) in &self.outbox {
            if *sequence >= self.next_sequence {
                return Err(Error::InvalidSnapshot(format!(
                    "outbox sequence {sequence} is not below next sequence {}",
                    self.next_sequence
                )));
            }
            registry.model(&event.model)?;
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}
