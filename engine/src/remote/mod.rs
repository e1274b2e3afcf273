//! Remote collaborator: query, mutate and subscribe against the backend.
//!
//! The transport is consumed through [`RemoteApi`]. Implementations report
//! failures as [`RemoteError`]; the engine translates them into
//! [`Error`](crate::Error) before anything reaches the host application.

mod memory;

pub use memory::MemoryRemote;

use crate::{
    ModelName, MutationCondition, MutationType, Record, RecordId, RemoteRecord, Timestamp, Version,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Failures reported by a remote transport.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    #[error("network failure: {message}")]
    Network { message: String, retryable: bool },

    /// Version precondition failed. Carries the copy the server holds.
    #[error("conflict: server holds version {}", .0.version)]
    ConflictUnhandled(Box<RemoteRecord>),

    #[error("conditional check failed: {0}")]
    ConditionalCheckFailed(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl RemoteError {
    /// A network failure worth retrying (timeouts, 5xx, throttling).
    pub fn transient(message: impl Into<String>) -> Self {
        RemoteError::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// A network-level failure that will not succeed on retry.
    pub fn permanent(message: impl Into<String>) -> Self {
        RemoteError::Network {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Network { retryable: true, .. })
    }
}

/// A "list records of one model changed since" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQuery {
    pub model: ModelName,
    /// Only records changed at or after this time. `None` requests everything.
    pub last_sync: Option<Timestamp>,
    pub next_token: Option<String>,
    pub limit: usize,
}

/// One page of a sync query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPage {
    pub items: Vec<RemoteRecord>,
    pub next_token: Option<String>,
    /// Backend time at which the query began. Becomes the next checkpoint.
    pub started_at: Timestamp,
}

/// Keyset position within a sync result: the last `(lastChangedAt, id)` returned.
///
/// Pages are ordered by that pair, so the next page starts strictly after the
/// cursor. A record rewritten between pages moves past the cursor and is
/// picked up later instead of shifting the rows behind it. Travels as
/// `nextToken` in the form `"{last_changed_at}:{record_id}"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageCursor {
    pub last_changed_at: Timestamp,
    pub record_id: RecordId,
}

impl PageCursor {
    /// Cursor positioned on `remote`.
    pub fn after(remote: &RemoteRecord) -> Self {
        Self {
            last_changed_at: remote.last_changed_at,
            record_id: remote.record.id.clone(),
        }
    }

    /// True if `remote` sorts after the cursor.
    pub fn admits(&self, remote: &RemoteRecord) -> bool {
        (remote.last_changed_at, remote.record.id.as_str())
            > (self.last_changed_at, self.record_id.as_str())
    }
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.last_changed_at, self.record_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid page token '{0}'")]
pub struct InvalidPageToken(pub String);

impl FromStr for PageCursor {
    type Err = InvalidPageToken;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidPageToken(token.to_string());
        let (at, id) = token.split_once(':').ok_or_else(invalid)?;
        if id.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            last_changed_at: at.parse().map_err(|_| invalid())?,
            record_id: id.to_string(),
        })
    }
}

/// A version-conditioned write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    pub model: ModelName,
    pub mutation_type: MutationType,
    pub record: Record,
    /// The version the client last reconciled. `None` for a first create.
    pub expected_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<MutationCondition>,
}

/// Messages a live subscription delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// The backend confirmed the subscription is live.
    Established,
    Data(RemoteRecord),
    /// The subscription ended. No further events follow.
    Failed(RemoteError),
}

/// Receiving end of a per-model subscription. Dropping it cancels the subscription.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
    cancel: CancellationToken,
}

/// Sending end held by the transport.
#[derive(Debug, Clone)]
pub struct SubscriptionSink {
    events: mpsc::UnboundedSender<SubscriptionEvent>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Create a connected subscription pair.
    pub fn channel() -> (SubscriptionSink, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        (
            SubscriptionSink {
                events: tx,
                cancel: cancel.clone(),
            },
            Subscription { events: rx, cancel },
        )
    }

    /// Wait for the next event. `None` once the subscription is closed or cancelled.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl SubscriptionSink {
    /// Deliver an event. Returns false once the subscriber is gone.
    pub fn send(&self, event: SubscriptionEvent) -> bool {
        !self.cancel.is_cancelled() && self.events.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.events.is_closed()
    }

    /// Resolves when the subscriber cancels or drops its end.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.events.closed() => {}
        }
    }
}

/// Query, mutate and subscribe operations against the backend.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Fetch one page of records changed since `query.last_sync`.
    async fn query(&self, query: SyncQuery) -> Result<SyncPage, RemoteError>;

    /// Apply a version-conditioned mutation, returning the authoritative copy.
    async fn mutate(&self, request: MutationRequest) -> Result<RemoteRecord, RemoteError>;

    /// Open a live change stream for one model.
    async fn subscribe(&self, model: &str) -> Result<Subscription, RemoteError>;
}

/// Backend-side mutation rule.
///
/// Checks the version precondition against the stored copy and produces the
/// new authoritative copy. Re-sending a mutation whose effect already landed
/// returns the stored copy unchanged.
///
/// A request condition is evaluated after the version check, against the
/// stored payload. Absent and deleted records evaluate as an empty object.
pub fn apply_remote_mutation(
    current: Option<&RemoteRecord>,
    request: &MutationRequest,
    now: Timestamp,
) -> Result<RemoteRecord, RemoteError> {
    let conflict = |current: &RemoteRecord| RemoteError::ConflictUnhandled(Box::new(current.clone()));
    let check = |subject: Option<&RemoteRecord>| -> Result<(), RemoteError> {
        let Some(condition) = &request.condition else {
            return Ok(());
        };
        let empty = serde_json::Value::Object(Default::default());
        let payload = subject
            .filter(|r| !r.deleted)
            .map_or(&empty, |r| &r.record.payload);
        if condition.matches(payload) {
            Ok(())
        } else {
            Err(RemoteError::ConditionalCheckFailed(format!(
                "{} {} does not satisfy {condition}",
                request.model, request.record.id
            )))
        }
    };

    match (request.mutation_type, current) {
        (MutationType::Create, None) => {
            check(None)?;
            Ok(RemoteRecord::new(request.record.clone(), 1, now))
        }

        // Resend of a create that already landed.
        (MutationType::Create, Some(current))
            if !current.deleted
                && request.expected_version.is_none()
                && current.record.payload == request.record.payload =>
        {
            Ok(current.clone())
        }

        // Re-create over a tombstone the client has seen.
        (MutationType::Create, Some(current))
            if current.deleted && request.expected_version == Some(current.version) =>
        {
            check(Some(current))?;
            Ok(RemoteRecord::new(
                request.record.clone(),
                current.version + 1,
                now.max(current.last_changed_at),
            ))
        }

        (MutationType::Create, Some(current)) => Err(conflict(current)),

        (MutationType::Update | MutationType::Delete, None) => Err(RemoteError::Rejected(
            format!("{} {} does not exist", request.model, request.record.id),
        )),

        (MutationType::Update, Some(current)) => {
            let landed = current.version > 0
                && request.expected_version == Some(current.version - 1)
                && current.record.payload == request.record.payload;
            if landed && !current.deleted {
                return Ok(current.clone());
            }
            if current.deleted {
                return Err(conflict(current));
            }
            if let Some(expected) = request.expected_version {
                if expected != current.version {
                    return Err(conflict(current));
                }
            }
            check(Some(current))?;
            Ok(RemoteRecord::new(
                request.record.clone(),
                current.version + 1,
                now.max(current.last_changed_at),
            ))
        }

        // Deleting something already deleted is a no-op.
        (MutationType::Delete, Some(current)) if current.deleted => Ok(current.clone()),

        (MutationType::Delete, Some(current)) => {
            if let Some(expected) = request.expected_version {
                if expected != current.version {
                    return Err(conflict(current));
                }
            }
            check(Some(current))?;
            Ok(RemoteRecord::tombstone(
                current.record.clone(),
                current.version + 1,
                now.max(current.last_changed_at),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post(title: &str) -> Record {
        Record::new("p-1", "Post", json!({"id": "p-1", "title": title}))
    }

    fn request(mutation_type: MutationType, title: &str, expected: Option<Version>) -> MutationRequest {
        MutationRequest {
            model: "Post".into(),
            mutation_type,
            record: post(title),
            expected_version: expected,
            condition: None,
        }
    }

    fn conditioned(mut request: MutationRequest, condition: MutationCondition) -> MutationRequest {
        request.condition = Some(condition);
        request
    }

    #[test]
    fn create_then_update_then_delete() {
        let created = apply_remote_mutation(None, &request(MutationType::Create, "a", None), 10).unwrap();
        assert_eq!(created.version, 1);

        let updated =
            apply_remote_mutation(Some(&created), &request(MutationType::Update, "b", Some(1)), 20)
                .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.record.payload["title"], "b");

        let deleted =
            apply_remote_mutation(Some(&updated), &request(MutationType::Delete, "b", Some(2)), 30)
                .unwrap();
        assert!(deleted.deleted);
        assert_eq!(deleted.version, 3);
    }

    #[test]
    fn stale_version_conflicts() {
        let current = RemoteRecord::new(post("server"), 6, 100);
        let err = apply_remote_mutation(Some(&current), &request(MutationType::Update, "mine", Some(4)), 200)
            .unwrap_err();

        match err {
            RemoteError::ConflictUnhandled(remote) => assert_eq!(remote.version, 6),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn resent_mutations_are_idempotent() {
        let created = apply_remote_mutation(None, &request(MutationType::Create, "a", None), 10).unwrap();
        let again = apply_remote_mutation(Some(&created), &request(MutationType::Create, "a", None), 11).unwrap();
        assert_eq!(again, created);

        let updated =
            apply_remote_mutation(Some(&created), &request(MutationType::Update, "b", Some(1)), 20)
                .unwrap();
        let again =
            apply_remote_mutation(Some(&updated), &request(MutationType::Update, "b", Some(1)), 21)
                .unwrap();
        assert_eq!(again, updated);

        let deleted = RemoteRecord::tombstone(post("b"), 3, 30);
        let again =
            apply_remote_mutation(Some(&deleted), &request(MutationType::Delete, "b", Some(2)), 31)
                .unwrap();
        assert_eq!(again, deleted);
    }

    #[test]
    fn create_over_live_record_with_other_payload_conflicts() {
        let current = RemoteRecord::new(post("theirs"), 2, 10);
        let err = apply_remote_mutation(Some(&current), &request(MutationType::Create, "mine", None), 20)
            .unwrap_err();
        assert!(matches!(err, RemoteError::ConflictUnhandled(_)));
    }

    #[test]
    fn update_of_missing_record_is_rejected() {
        let err = apply_remote_mutation(None, &request(MutationType::Update, "x", Some(1)), 10).unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let current = RemoteRecord::new(post("a"), 1, 500);
        let updated =
            apply_remote_mutation(Some(&current), &request(MutationType::Update, "b", Some(1)), 100)
                .unwrap();
        assert_eq!(updated.last_changed_at, 500);
    }

    #[test]
    fn failed_condition_leaves_record_alone() {
        let current = RemoteRecord::new(post("published"), 2, 100);
        let update = conditioned(
            request(MutationType::Update, "edited", Some(2)),
            MutationCondition::eq("title", "draft"),
        );
        let err = apply_remote_mutation(Some(&current), &update, 200).unwrap_err();
        assert!(matches!(err, RemoteError::ConditionalCheckFailed(_)));
        assert!(!err.is_retryable());

        let delete = conditioned(
            request(MutationType::Delete, "published", Some(2)),
            MutationCondition::eq("title", "draft"),
        );
        assert!(matches!(
            apply_remote_mutation(Some(&current), &delete, 200),
            Err(RemoteError::ConditionalCheckFailed(_))
        ));
    }

    #[test]
    fn passing_condition_applies() {
        let current = RemoteRecord::new(post("draft"), 2, 100);
        let update = conditioned(
            request(MutationType::Update, "edited", Some(2)),
            MutationCondition::eq("title", "draft"),
        );
        let updated = apply_remote_mutation(Some(&current), &update, 200).unwrap();
        assert_eq!(updated.version, 3);
        assert_eq!(updated.record.payload["title"], "edited");
    }

    #[test]
    fn version_conflict_is_reported_before_condition() {
        let current = RemoteRecord::new(post("published"), 5, 100);
        let update = conditioned(
            request(MutationType::Update, "edited", Some(2)),
            MutationCondition::eq("title", "draft"),
        );
        assert!(matches!(
            apply_remote_mutation(Some(&current), &update, 200),
            Err(RemoteError::ConflictUnhandled(_))
        ));
    }

    #[test]
    fn create_condition_sees_empty_record() {
        let create = conditioned(
            request(MutationType::Create, "a", None),
            MutationCondition::exists("title"),
        );
        assert!(matches!(
            apply_remote_mutation(None, &create, 10),
            Err(RemoteError::ConditionalCheckFailed(_))
        ));

        let create = conditioned(
            request(MutationType::Create, "a", None),
            MutationCondition::exists("title").negate(),
        );
        assert_eq!(apply_remote_mutation(None, &create, 10).unwrap().version, 1);
    }

    #[test]
    fn landed_replay_skips_condition() {
        let updated = RemoteRecord::new(post("b"), 2, 100);
        let replay = conditioned(
            request(MutationType::Update, "b", Some(1)),
            MutationCondition::eq("title", "a"),
        );
        assert_eq!(apply_remote_mutation(Some(&updated), &replay, 200).unwrap(), updated);
    }

    #[test]
    fn cursor_tokens() {
        let cursor: PageCursor = "1099:p-099".parse().unwrap();
        assert_eq!(cursor.last_changed_at, 1099);
        assert_eq!(cursor.record_id, "p-099");
        assert_eq!(cursor.to_string(), "1099:p-099");

        let colon: PageCursor = "5:a:b".parse().unwrap();
        assert_eq!(colon.record_id, "a:b");

        for bad in ["", "12", "x:p-1", "12:"] {
            assert!(bad.parse::<PageCursor>().is_err(), "{bad}");
        }

        assert!(cursor.admits(&RemoteRecord::new(Record::new("p-100", "Post", json!({})), 1, 1099)));
        assert!(cursor.admits(&RemoteRecord::new(Record::new("a", "Post", json!({})), 1, 1100)));
        assert!(!cursor.admits(&RemoteRecord::new(Record::new("p-099", "Post", json!({})), 1, 1099)));
    }

    #[tokio::test]
    async fn dropping_subscription_closes_sink() {
        let (sink, mut subscription) = Subscription::channel();
        assert!(sink.send(SubscriptionEvent::Established));
        assert_eq!(subscription.next().await, Some(SubscriptionEvent::Established));

        drop(subscription);
        sink.closed().await;
        assert!(sink.is_closed());
        assert!(!sink.send(SubscriptionEvent::Established));
    }

    #[test]
    fn wire_shape() {
        let json = serde_json::to_value(request(MutationType::Update, "a", Some(3))).unwrap();
        assert_eq!(json["mutationType"], "update");
        assert_eq!(json["expectedVersion"], 3);
        assert_eq!(json["record"]["id"], "p-1");
        assert!(json.get("condition").is_none());
    }
}
