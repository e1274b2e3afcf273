//! Mutation event ingester: the only write path for application records.

use crate::hub::{EngineEvent, EventHub};
use crate::store::LocalStore;
use crate::{
    current_timestamp, error::Result, Error, ModelRegistry, MutationCondition, MutationEvent,
    MutationType, Record,
};
use std::sync::Arc;
use tokio::sync::Notify;

/// Validates local intents and persists them to the outbox.
///
/// The optimistic local write and the outbox append happen in one
/// transaction, so readers see the change as soon as `submit` returns and a
/// failed submit leaves nothing behind.
#[derive(Clone)]
pub struct MutationIngester {
    store: Arc<dyn LocalStore>,
    registry: Arc<ModelRegistry>,
    hub: EventHub,
    wake: Arc<Notify>,
}

impl MutationIngester {
    pub(crate) fn new(
        store: Arc<dyn LocalStore>,
        registry: Arc<ModelRegistry>,
        hub: EventHub,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            registry,
            hub,
            wake,
        }
    }

    /// Apply a local change and append it to the outbox.
    pub fn submit(&self, record: Record, mutation_type: MutationType) -> Result<MutationEvent> {
        self.submit_with_condition(record, mutation_type, None)
    }

    /// Like [`submit`](Self::submit), with a condition the backend must find
    /// true of its copy before applying the change.
    ///
    /// The optimistic local write happens regardless. If the backend refuses,
    /// a `ConditionalSaveFailed` event is published and the mutation dropped.
    #[tracing::instrument(
        skip(self, record, condition),
        fields(model = %record.model, record_id = %record.id, conditional = condition.is_some())
    )]
    pub fn submit_with_condition(
        &self,
        record: Record,
        mutation_type: MutationType,
        condition: Option<MutationCondition>,
    ) -> Result<MutationEvent> {
        if mutation_type != MutationType::Delete {
            self.registry.validate(&record)?;
        } else {
            self.registry.model(&record.model)?;
        }

        let created_at = current_timestamp();
        let event = self.store.transact(|tx| {
            let existing = tx.record(&record.model, &record.id);

            let snapshot = match (mutation_type, existing) {
                (MutationType::Create, Some(_)) => {
                    return Err(Error::RecordAlreadyExists(record.id.clone()));
                }
                (MutationType::Update | MutationType::Delete, None) => {
                    return Err(Error::RecordNotFound(record.id.clone()));
                }
                (MutationType::Create | MutationType::Update, _) => {
                    tx.save(record.clone());
                    record.clone()
                }
                // Deletes carry the last local copy so the remote sees a full record.
                (MutationType::Delete, Some(existing)) => {
                    tx.delete(&record.model, &record.id);
                    existing
                }
            };

            let mut event = MutationEvent::new(&snapshot, mutation_type, created_at)
                .with_condition(condition.clone());
            event.sequence = tx.append_mutation(event.clone());
            Ok(event)
        })?;

        tracing::debug!(sequence = event.sequence, %mutation_type, "mutation enqueued");
        self.hub.publish(EngineEvent::MutationEnqueued(event.clone()));
        self.hub
            .publish(EngineEvent::OutboxStatus { is_empty: false });
        self.wake.notify_one();

        Ok(event)
    }
}

impl std::fmt::Debug for MutationIngester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationIngester")
            .field("models", &self.registry.len())
            .finish_non_exhaustive()
    }
}
