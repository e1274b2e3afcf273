//! Record and sync metadata types.

use crate::{ModelName, RecordId, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// An application record: a typed entity identified by `(model, id)`.
///
/// The payload is the record's serialized form. It is validated against the
/// model's schema before it enters the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unique identifier within the model
    pub id: RecordId,
    /// Name of the record type
    pub model: ModelName,
    /// The serialized record (JSON object)
    pub payload: serde_json::Value,
}

impl Record {
    /// Create a new record.
    pub fn new(
        id: impl Into<RecordId>,
        model: impl Into<ModelName>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            payload,
        }
    }
}

/// Last known reconciled remote state of a record.
///
/// The version is the optimistic-concurrency token sent with every outgoing
/// mutation for the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub id: RecordId,
    pub model: ModelName,
    pub version: Version,
    pub last_changed_at: Timestamp,
    pub deleted: bool,
}

impl SyncMetadata {
    /// Orders two metadata snapshots by `(version, last_changed_at)`.
    pub fn freshness(&self) -> (Version, Timestamp) {
        (self.version, self.last_changed_at)
    }
}

/// A record as the remote reports it, together with its sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub record: Record,
    pub version: Version,
    pub last_changed_at: Timestamp,
    pub deleted: bool,
}

impl RemoteRecord {
    /// Create a live (non-deleted) remote record.
    pub fn new(record: Record, version: Version, last_changed_at: Timestamp) -> Self {
        Self {
            record,
            version,
            last_changed_at,
            deleted: false,
        }
    }

    /// Create a tombstone for a record deleted on the remote.
    pub fn tombstone(record: Record, version: Version, last_changed_at: Timestamp) -> Self {
        Self {
            record,
            version,
            last_changed_at,
            deleted: true,
        }
    }

    /// The sync metadata this remote copy implies.
    pub fn metadata(&self) -> SyncMetadata {
        SyncMetadata {
            id: self.record.id.clone(),
            model: self.record.model.clone(),
            version: self.version,
            last_changed_at: self.last_changed_at,
            deleted: self.deleted,
        }
    }

    /// Compare this remote copy against stored metadata.
    ///
    /// `Greater` means the remote copy is newer and should be applied.
    pub fn compare_to(&self, local: &SyncMetadata) -> Ordering {
        (self.version, self.last_changed_at).cmp(&local.freshness())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post(id: &str) -> Record {
        Record::new(id, "Post", json!({"id": id, "title": "Hello"}))
    }

    #[test]
    fn remote_metadata() {
        let remote = RemoteRecord::new(post("p-1"), 3, 1000);
        let meta = remote.metadata();

        assert_eq!(meta.id, "p-1");
        assert_eq!(meta.model, "Post");
        assert_eq!(meta.version, 3);
        assert!(!meta.deleted);

        let tomb = RemoteRecord::tombstone(post("p-1"), 4, 2000);
        assert!(tomb.metadata().deleted);
    }

    #[test]
    fn freshness_ordering() {
        let local = RemoteRecord::new(post("p-1"), 6, 5000).metadata();

        assert_eq!(
            RemoteRecord::new(post("p-1"), 5, 9000).compare_to(&local),
            Ordering::Less
        );
        assert_eq!(
            RemoteRecord::new(post("p-1"), 6, 5000).compare_to(&local),
            Ordering::Equal
        );
        assert_eq!(
            RemoteRecord::new(post("p-1"), 6, 5001).compare_to(&local),
            Ordering::Greater
        );
        assert_eq!(
            RemoteRecord::new(post("p-1"), 7, 1).compare_to(&local),
            Ordering::Greater
        );
    }

    #[test]
    fn wire_format_is_camel_case() {
        let remote = RemoteRecord::new(post("p-1"), 1, 1000);
        let json = serde_json::to_value(&remote).unwrap();

        assert_eq!(json["lastChangedAt"], 1000);
        assert_eq!(json["record"]["model"], "Post");
    }
}
