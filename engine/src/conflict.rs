//! Conflict policies for outgoing mutations rejected on a version mismatch.

use crate::{Error, MutationEvent, MutationType, Record, RemoteRecord, Version};
use std::fmt;
use std::sync::Arc;

/// What a custom handler wants done with a conflicted mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
    /// Drop the local change and adopt the server copy
    ApplyRemote,
    /// Resend the local change against the server's version
    RetryLocal,
    /// Resend this record (e.g. a merge) against the server's version
    Retry(Record),
}

/// The two sides of a conflict, handed to a custom handler.
#[derive(Debug, Clone)]
pub struct ConflictData<'a> {
    pub local: &'a MutationEvent,
    pub remote: &'a RemoteRecord,
}

pub type ConflictHandler = Arc<dyn Fn(&ConflictData<'_>) -> ConflictResolution + Send + Sync>;

/// How update/delete conflicts are settled.
#[derive(Clone, Default)]
pub enum ConflictPolicy {
    /// Resend the local change with the server's latest version attached
    #[default]
    LocalWins,
    /// Discard the local change and keep the server copy
    DiscardLocal,
    Custom(ConflictHandler),
}

impl ConflictPolicy {
    pub fn custom(
        handler: impl Fn(&ConflictData<'_>) -> ConflictResolution + Send + Sync + 'static,
    ) -> Self {
        ConflictPolicy::Custom(Arc::new(handler))
    }
}

impl fmt::Debug for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::LocalWins => f.write_str("LocalWins"),
            ConflictPolicy::DiscardLocal => f.write_str("DiscardLocal"),
            ConflictPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// What the outgoing queue does after a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictOutcome {
    Resend {
        record: Record,
        expected_version: Version,
    },
    /// Drop the local change, store the server copy
    AdoptRemote(RemoteRecord),
    /// The server already deleted the record; delete the local copy
    DeleteLocal(RemoteRecord),
    Fail(Error),
}

fn conflict_error(event: &MutationEvent, message: impl Into<String>) -> Error {
    Error::Conflict {
        model: event.model.clone(),
        record_id: event.record_id.clone(),
        message: message.into(),
    }
}

/// Settle a conflict between a local mutation and the server copy.
pub fn resolve_conflict(
    policy: &ConflictPolicy,
    event: &MutationEvent,
    remote: &RemoteRecord,
) -> ConflictOutcome {
    match event.mutation_type {
        MutationType::Create if remote.deleted => ConflictOutcome::Resend {
            record: event.record(),
            expected_version: remote.version,
        },
        MutationType::Create => ConflictOutcome::Fail(conflict_error(
            event,
            format!("create collided with server version {}", remote.version),
        )),
        MutationType::Delete if remote.deleted => ConflictOutcome::AdoptRemote(remote.clone()),
        MutationType::Update if remote.deleted => ConflictOutcome::DeleteLocal(remote.clone()),
        MutationType::Update | MutationType::Delete => apply_policy(policy, event, remote),
    }
}

fn apply_policy(
    policy: &ConflictPolicy,
    event: &MutationEvent,
    remote: &RemoteRecord,
) -> ConflictOutcome {
    let resend = |record: Record| ConflictOutcome::Resend {
        record,
        expected_version: remote.version,
    };

    match policy {
        ConflictPolicy::LocalWins => resend(event.record()),
        ConflictPolicy::DiscardLocal => ConflictOutcome::AdoptRemote(remote.clone()),
        ConflictPolicy::Custom(handler) => {
            match handler(&ConflictData {
                local: event,
                remote,
            }) {
                ConflictResolution::ApplyRemote => ConflictOutcome::AdoptRemote(remote.clone()),
                ConflictResolution::RetryLocal => resend(event.record()),
                ConflictResolution::Retry(record)
                    if record.model == event.model && record.id == event.record_id =>
                {
                    resend(record)
                }
                ConflictResolution::Retry(record) => ConflictOutcome::Fail(conflict_error(
                    event,
                    format!("handler returned a different record ({} {})", record.model, record.id),
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(mutation_type: MutationType, title: &str) -> MutationEvent {
        let record = Record::new("p-1", "Post", json!({"id": "p-1", "title": title}));
        MutationEvent::new(&record, mutation_type, 1)
    }

    fn server(version: Version, deleted: bool) -> RemoteRecord {
        let record = Record::new("p-1", "Post", json!({"id": "p-1", "title": "server"}));
        RemoteRecord {
            record,
            version,
            last_changed_at: 100,
            deleted,
        }
    }

    #[test]
    fn local_wins_resends_with_server_version() {
        let local = event(MutationType::Update, "mine");
        let outcome = resolve_conflict(&ConflictPolicy::LocalWins, &local, &server(7, false));

        assert_eq!(
            outcome,
            ConflictOutcome::Resend {
                record: local.record(),
                expected_version: 7
            }
        );
    }

    #[test]
    fn discard_local_adopts_remote() {
        let outcome = resolve_conflict(
            &ConflictPolicy::DiscardLocal,
            &event(MutationType::Update, "mine"),
            &server(7, false),
        );
        assert_eq!(outcome, ConflictOutcome::AdoptRemote(server(7, false)));
    }

    #[test]
    fn per_type_rules_take_precedence() {
        let policy = ConflictPolicy::LocalWins;

        assert!(matches!(
            resolve_conflict(&policy, &event(MutationType::Create, "a"), &server(2, false)),
            ConflictOutcome::Fail(Error::Conflict { .. })
        ));
        assert_eq!(
            resolve_conflict(&policy, &event(MutationType::Delete, "a"), &server(3, true)),
            ConflictOutcome::AdoptRemote(server(3, true))
        );
        assert_eq!(
            resolve_conflict(&policy, &event(MutationType::Update, "a"), &server(3, true)),
            ConflictOutcome::DeleteLocal(server(3, true))
        );
    }

    #[test]
    fn custom_handler_can_merge() {
        let policy = ConflictPolicy::custom(|data| {
            let mut merged = data.remote.record.clone();
            merged.payload["title"] = data.local.payload["title"].clone();
            ConflictResolution::Retry(merged)
        });

        let outcome = resolve_conflict(&policy, &event(MutationType::Update, "mine"), &server(4, false));
        match outcome {
            ConflictOutcome::Resend {
                record,
                expected_version,
            } => {
                assert_eq!(expected_version, 4);
                assert_eq!(record.payload["title"], "mine");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn custom_handler_cannot_switch_records() {
        let policy = ConflictPolicy::custom(|_| {
            ConflictResolution::Retry(Record::new("other", "Post", json!({"id": "other"})))
        });
        let outcome = resolve_conflict(&policy, &event(MutationType::Update, "x"), &server(1, false));
        assert!(matches!(outcome, ConflictOutcome::Fail(_)));
    }
}
