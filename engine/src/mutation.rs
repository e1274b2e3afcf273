//! Mutation events: the durable outbox entries describing local changes.

use crate::{ModelName, MutationCondition, Record, RecordId, Timestamp};
use serde::{Deserialize, Serialize};

/// Position of an event in the outbox. Assigned by the store on append.
pub type Sequence = u64;

/// The kind of change a mutation event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationType {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for MutationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationType::Create => f.write_str("create"),
            MutationType::Update => f.write_str("update"),
            MutationType::Delete => f.write_str("delete"),
        }
    }
}

/// One pending local change awaiting remote acknowledgement.
///
/// Events are processed in `sequence` order. At most one event per record is
/// `in_process` at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    pub id: String,
    pub record_id: RecordId,
    pub model: ModelName,
    /// Snapshot of the record as it was submitted
    pub payload: serde_json::Value,
    pub mutation_type: MutationType,
    pub created_at: Timestamp,
    #[serde(default)]
    pub sequence: Sequence,
    #[serde(default)]
    pub in_process: bool,
    /// Checked by the backend against its copy before the write is applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<MutationCondition>,
}

impl MutationEvent {
    /// Build a not-yet-persisted event for a record. The store assigns `sequence`.
    pub fn new(record: &Record, mutation_type: MutationType, created_at: Timestamp) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            record_id: record.id.clone(),
            model: record.model.clone(),
            payload: record.payload.clone(),
            mutation_type,
            created_at,
            sequence: 0,
            in_process: false,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: Option<MutationCondition>) -> Self {
        self.condition = condition;
        self
    }

    /// Rebuild the record snapshot this event carries.
    pub fn record(&self) -> Record {
        Record::new(self.record_id.clone(), self.model.clone(), self.payload.clone())
    }

    /// True if `other` targets the same record.
    pub fn same_record(&self, other: &MutationEvent) -> bool {
        self.model == other.model && self.record_id == other.record_id
    }
}
