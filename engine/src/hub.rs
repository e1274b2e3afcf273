//! Lifecycle event stream exposed to the host application.

use crate::engine::EngineState;
use crate::{Error, ModelName, MutationEvent, RecordId, RemoteRecord, Version};
use serde::Serialize;
use tokio::sync::broadcast;

/// Per-disposition counts reported when a model finishes syncing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub dropped: usize,
}

impl SyncCounts {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted + self.dropped
    }
}

/// Why an incoming remote change was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DropReason {
    /// Version/lastChangedAt not newer than what is stored
    Stale,
    /// A local mutation for the record is still in the outbox
    PendingMutation,
    /// Payload failed validation against the registry
    Invalid(String),
}

/// Events published on the lifecycle stream.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged(EngineState),
    NetworkStatus {
        active: bool,
    },
    SubscriptionsEstablished,
    SyncQueriesStarted {
        models: Vec<ModelName>,
    },
    ModelSynced {
        model: ModelName,
        is_full_sync: bool,
        counts: SyncCounts,
    },
    SyncQueriesReady,
    Ready,
    OutboxStatus {
        is_empty: bool,
    },
    MutationEnqueued(MutationEvent),
    MutationProcessed {
        event: MutationEvent,
        remote: RemoteRecord,
    },
    MutationFailed {
        model: ModelName,
        record_id: RecordId,
        error: Error,
    },
    ConditionalSaveFailed {
        model: ModelName,
        record_id: RecordId,
        message: String,
    },
    SyncReceived {
        model: ModelName,
        record_id: RecordId,
        version: Version,
    },
    SyncDropped {
        model: ModelName,
        record_id: RecordId,
        reason: DropReason,
    },
    Paused,
    Stopped {
        error: Option<Error>,
    },
}

/// Fire-and-forget fan-out of [`EngineEvent`]s.
///
/// Publishing never blocks; slow receivers observe `Lagged` and skip ahead.
#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(?event, "lifecycle event");
        // No receivers is fine.
        let _ = self.sender.send(event);
    }
}
