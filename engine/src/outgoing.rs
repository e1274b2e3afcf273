//! Outgoing mutation queue: drains the outbox to the remote in sequence order.
//!
//! One event is in flight at a time. An event is marked `in_process` before
//! it is sent and removed only after its outcome is committed locally, so a
//! crash mid-flight replays exactly that event on the next drain.

use crate::config::RetryPolicy;
use crate::conflict::{resolve_conflict, ConflictOutcome, ConflictPolicy};
use crate::hub::{EngineEvent, EventHub};
use crate::incoming::{reconcile_or_defer, DeferredEvents};
use crate::reconcile::{publish_disposition, Disposition};
use crate::remote::{MutationRequest, RemoteApi, RemoteError};
use crate::store::{LocalStore, Transaction};
use crate::{error::Result, Error, ModelRegistry, MutationEvent, RemoteRecord};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

/// Lifecycle of the outgoing queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    Idle,
    Draining,
    WaitingForEvent,
    RequestingEvent,
    SyncingEvent,
    FinishingEvent,
    CleaningUp,
    /// Retries exhausted; the event stays in the outbox
    InError,
}

/// How a single send ended.
#[derive(Debug, Clone, PartialEq)]
enum SendOutcome {
    Acknowledged(RemoteRecord),
    AdoptRemote(RemoteRecord),
    DeleteLocal(RemoteRecord),
    ConditionalCheckFailed(String),
    Failed(Error),
}

#[derive(Clone)]
pub(crate) struct OutgoingMutationQueue {
    store: Arc<dyn LocalStore>,
    registry: Arc<ModelRegistry>,
    hub: EventHub,
    deferred: DeferredEvents,
    retry: Arc<dyn RetryPolicy>,
    conflict_policy: ConflictPolicy,
    wake: Arc<Notify>,
    state: Arc<watch::Sender<OutgoingState>>,
}

impl OutgoingMutationQueue {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn LocalStore>,
        registry: Arc<ModelRegistry>,
        hub: EventHub,
        deferred: DeferredEvents,
        retry: Arc<dyn RetryPolicy>,
        conflict_policy: ConflictPolicy,
        wake: Arc<Notify>,
    ) -> Self {
        let (state, _) = watch::channel(OutgoingState::Idle);
        Self {
            store,
            registry,
            hub,
            deferred,
            retry,
            conflict_policy,
            wake,
            state: Arc::new(state),
        }
    }

    pub(crate) fn state(&self) -> OutgoingState {
        *self.state.borrow()
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<OutgoingState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: OutgoingState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::trace!(?previous, ?state, "outgoing queue state");
        }
    }

    /// Drain the outbox until cancelled.
    ///
    /// Returns `Err` only when a transient failure outlives the retry policy
    /// or the store fails; the failed event stays in the outbox.
    #[tracing::instrument(skip_all)]
    pub(crate) async fn run(
        self,
        remote: Arc<dyn RemoteApi>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.set_state(OutgoingState::Draining);
        let reset = self.store.reset_in_process()?;
        if reset > 0 {
            tracing::info!(count = reset, "replaying interrupted outbox entries");
        }

        let result = self.drain(remote.as_ref(), &cancel).await;
        match &result {
            Ok(()) => self.set_state(OutgoingState::Idle),
            Err(err) => {
                tracing::error!(error = %err, "outgoing queue stopped");
                self.set_state(OutgoingState::InError);
            }
        }
        result
    }

    async fn drain(&self, remote: &dyn RemoteApi, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                self.set_state(OutgoingState::CleaningUp);
                return Ok(());
            }

            self.set_state(OutgoingState::RequestingEvent);
            let Some(event) = self.store.transact(next_event)? else {
                self.set_state(OutgoingState::WaitingForEvent);
                self.hub.publish(EngineEvent::OutboxStatus { is_empty: true });
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.set_state(OutgoingState::CleaningUp);
                        return Ok(());
                    }
                    _ = self.wake.notified() => continue,
                }
            };

            self.set_state(OutgoingState::SyncingEvent);
            let outcome = match self.send(remote, &event, cancel).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.release(&event)?;
                    if matches!(err, Error::Cancelled) {
                        self.set_state(OutgoingState::CleaningUp);
                        return Ok(());
                    }
                    return Err(err);
                }
            };

            self.set_state(OutgoingState::FinishingEvent);
            self.finish(&event, outcome)?;
        }
    }

    /// Send one event, retrying transient failures and settling at most one conflict.
    async fn send(
        &self,
        remote: &dyn RemoteApi,
        event: &MutationEvent,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome> {
        let metadata = self.store.sync_metadata(&event.model, &event.record_id)?;
        let mut request = MutationRequest {
            model: event.model.clone(),
            mutation_type: event.mutation_type,
            record: event.record(),
            expected_version: metadata.map(|m| m.version),
            condition: event.condition.clone(),
        };
        let mut resubmitted = false;
        let mut attempt = 0;

        loop {
            tracing::debug!(
                model = %event.model,
                record_id = %event.record_id,
                sequence = event.sequence,
                expected_version = ?request.expected_version,
                "sending mutation"
            );

            // Not raced against cancellation: the call completes or fails on its own.
            let error = match remote.mutate(request.clone()).await {
                Ok(acknowledged) => return Ok(SendOutcome::Acknowledged(acknowledged)),
                Err(error) => error,
            };

            match error {
                RemoteError::ConflictUnhandled(server) if !resubmitted => {
                    match resolve_conflict(&self.conflict_policy, event, &server) {
                        ConflictOutcome::Resend {
                            record,
                            expected_version,
                        } => {
                            tracing::debug!(
                                model = %event.model,
                                record_id = %event.record_id,
                                server_version = server.version,
                                "resubmitting after conflict"
                            );
                            request.record = record;
                            request.expected_version = Some(expected_version);
                            resubmitted = true;
                        }
                        ConflictOutcome::AdoptRemote(server_copy) => {
                            return Ok(SendOutcome::AdoptRemote(server_copy))
                        }
                        ConflictOutcome::DeleteLocal(server_copy) => {
                            return Ok(SendOutcome::DeleteLocal(server_copy))
                        }
                        ConflictOutcome::Fail(err) => return Ok(SendOutcome::Failed(err)),
                    }
                }
                RemoteError::ConditionalCheckFailed(message) => {
                    return Ok(SendOutcome::ConditionalCheckFailed(message))
                }
                error if error.is_retryable() => {
                    attempt += 1;
                    let Some(delay) = self.retry.next_delay(attempt) else {
                        tracing::warn!(
                            model = %event.model,
                            record_id = %event.record_id,
                            attempts = attempt,
                            error = %error,
                            "retries exhausted"
                        );
                        return Err(error.into());
                    };
                    tracing::debug!(attempt, ?delay, error = %error, "retrying mutation");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                error => return Ok(SendOutcome::Failed(error.into())),
            }
        }
    }

    /// Clear in-process flags left behind by a drain that was aborted mid-send.
    ///
    /// Only called once no drain is running.
    pub(crate) fn release_interrupted(&self) -> Result<usize> {
        let released = self.store.reset_in_process()?;
        if released > 0 {
            tracing::info!(count = released, "released interrupted outbox entries");
        }
        Ok(released)
    }

    /// Clear the in-process flag of an event that was not completed.
    fn release(&self, event: &MutationEvent) -> Result<()> {
        let mut released = event.clone();
        released.in_process = false;
        self.store.transact(|tx| {
            if tx.mutations().iter().any(|e| e.sequence == released.sequence) {
                tx.update_mutation(released)?;
            }
            Ok(())
        })
    }

    /// Commit the outcome of an event, then replay remote changes parked behind it.
    fn finish(&self, event: &MutationEvent, outcome: SendOutcome) -> Result<()> {
        let registry = &self.registry;
        let deferred = &self.deferred;

        let replayed = self.store.transact(|tx| {
            tx.remove_mutation(event.sequence);
            let superseded = !tx.mutations_for(&event.model, &event.record_id).is_empty();

            match &outcome {
                SendOutcome::Acknowledged(remote) | SendOutcome::AdoptRemote(remote) => {
                    adopt(tx, remote, superseded);
                }
                SendOutcome::DeleteLocal(remote) => {
                    tx.delete(&event.model, &event.record_id);
                    tx.save_metadata(remote.metadata());
                }
                SendOutcome::ConditionalCheckFailed(_) | SendOutcome::Failed(_) => {}
            }

            let mut replayed = Vec::new();
            for remote in deferred.take(&event.model, &event.record_id) {
                let disposition = reconcile_or_defer(tx, registry, deferred, &remote);
                replayed.push((remote, disposition));
            }
            Ok(replayed)
        })?;

        match outcome {
            SendOutcome::Acknowledged(remote)
            | SendOutcome::AdoptRemote(remote)
            | SendOutcome::DeleteLocal(remote) => {
                tracing::debug!(
                    model = %event.model,
                    record_id = %event.record_id,
                    version = remote.version,
                    "mutation processed"
                );
                self.hub.publish(EngineEvent::MutationProcessed {
                    event: event.clone(),
                    remote,
                });
            }
            SendOutcome::ConditionalCheckFailed(message) => {
                tracing::warn!(
                    model = %event.model,
                    record_id = %event.record_id,
                    %message,
                    "conditional save failed, discarding mutation"
                );
                self.hub.publish(EngineEvent::ConditionalSaveFailed {
                    model: event.model.clone(),
                    record_id: event.record_id.clone(),
                    message: message.clone(),
                });
                self.hub.publish(EngineEvent::MutationFailed {
                    model: event.model.clone(),
                    record_id: event.record_id.clone(),
                    error: Error::Rejected(format!("conditional check failed: {message}")),
                });
            }
            SendOutcome::Failed(error) => {
                tracing::warn!(
                    model = %event.model,
                    record_id = %event.record_id,
                    error = %error,
                    "discarding rejected mutation"
                );
                self.hub.publish(EngineEvent::MutationFailed {
                    model: event.model.clone(),
                    record_id: event.record_id.clone(),
                    error,
                });
            }
        }

        for (remote, disposition) in &replayed {
            if *disposition != Disposition::Deferred {
                publish_disposition(&self.hub, remote, disposition);
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for OutgoingMutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingMutationQueue")
            .field("state", &self.state())
            .field("conflict_policy", &self.conflict_policy)
            .finish_non_exhaustive()
    }
}

/// Pick the oldest event and mark it in process.
fn next_event(tx: &mut dyn Transaction) -> Result<Option<MutationEvent>> {
    let Some(mut event) = tx.mutations().into_iter().find(|e| !e.in_process) else {
        return Ok(None);
    };
    event.in_process = true;
    tx.update_mutation(event.clone())?;
    Ok(Some(event))
}

/// Store the server copy of a record. Metadata never regresses; the record
/// itself is left alone if a newer local edit is still pending.
fn adopt(tx: &mut dyn Transaction, remote: &RemoteRecord, superseded: bool) {
    let model = &remote.record.model;
    let id = &remote.record.id;

    let newer = tx
        .metadata(model, id)
        .map_or(true, |local| remote.compare_to(&local) != Ordering::Less);
    if newer {
        tx.save_metadata(remote.metadata());
    }

    if superseded {
        tracing::debug!(model = %model, record_id = %id, "keeping newer local edit over acknowledged copy");
        return;
    }
    if !newer {
        return;
    }
    if remote.deleted {
        tx.delete(model, id);
    } else {
        tx.save(remote.record.clone());
    }
}
