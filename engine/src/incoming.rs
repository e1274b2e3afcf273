//! Incoming event reconciliation: one subscription listener per model.
//!
//! Listeners buffer live events until the engine activates them (after the
//! initial sync), then apply them in arrival order through the merge rule.
//! Events for a record whose local mutation is in flight are parked in
//! [`DeferredEvents`] and replayed by the outgoing queue once that mutation
//! completes.

use crate::engine::{EngineAction, Envelope};
use crate::hub::EventHub;
use crate::reconcile::{publish_disposition, reconcile_remote, Disposition};
use crate::remote::{RemoteApi, Subscription, SubscriptionEvent};
use crate::store::{LocalStore, Transaction};
use crate::{error::Result, Error, ModelName, ModelRegistry, RecordId, RemoteRecord, Timestamp};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle of one model's reconciliation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationState {
    NotStarted,
    Subscribing,
    Subscribed,
    Paused,
    Cancelled,
}

/// Remote events waiting for an in-process local mutation to finish.
#[derive(Debug, Clone, Default)]
pub(crate) struct DeferredEvents {
    events: Arc<DashMap<(ModelName, RecordId), Vec<RemoteRecord>>>,
}

impl DeferredEvents {
    pub(crate) fn defer(&self, remote: RemoteRecord) {
        let key = (remote.record.model.clone(), remote.record.id.clone());
        self.events.entry(key).or_default().push(remote);
    }

    /// Take every event parked for a record, in arrival order.
    pub(crate) fn take(&self, model: &str, id: &str) -> Vec<RemoteRecord> {
        self.events
            .remove(&(model.to_string(), id.to_string()))
            .map(|(_, events)| events)
            .unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.iter().map(|e| e.value().len()).sum()
    }

    pub(crate) fn clear(&self) {
        self.events.clear();
    }
}

/// Reconcile one incoming record inside a transaction, parking it if deferred.
pub(crate) fn reconcile_or_defer(
    tx: &mut dyn Transaction,
    registry: &ModelRegistry,
    deferred: &DeferredEvents,
    remote: &RemoteRecord,
) -> Disposition {
    let disposition = reconcile_remote(tx, registry, remote);
    if disposition == Disposition::Deferred {
        deferred.defer(remote.clone());
    }
    disposition
}

/// Per-model subscription listeners and their shared bookkeeping.
#[derive(Clone)]
pub(crate) struct IncomingReconciliationQueue {
    store: Arc<dyn LocalStore>,
    registry: Arc<ModelRegistry>,
    hub: EventHub,
    deferred: DeferredEvents,
    states: Arc<DashMap<ModelName, ReconciliationState>>,
    last_received: Arc<DashMap<ModelName, Timestamp>>,
}

/// Listener tasks of one engine run.
pub(crate) struct IncomingRun {
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl IncomingReconciliationQueue {
    pub(crate) fn new(
        store: Arc<dyn LocalStore>,
        registry: Arc<ModelRegistry>,
        hub: EventHub,
        deferred: DeferredEvents,
    ) -> Self {
        let states = DashMap::new();
        for model in registry.model_names() {
            states.insert(model.clone(), ReconciliationState::NotStarted);
        }
        Self {
            store,
            registry,
            hub,
            deferred,
            states: Arc::new(states),
            last_received: Arc::new(DashMap::new()),
        }
    }

    pub(crate) fn state(&self, model: &str) -> Option<ReconciliationState> {
        self.states.get(model).map(|s| *s)
    }

    pub(crate) fn states(&self) -> HashMap<ModelName, ReconciliationState> {
        self.states
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    fn set_state(&self, model: &str, state: ReconciliationState) {
        tracing::debug!(model = %model, ?state, "reconciliation queue state");
        self.states.insert(model.to_string(), state);
    }

    pub(crate) fn set_all(&self, state: ReconciliationState) {
        for mut entry in self.states.iter_mut() {
            *entry.value_mut() = state;
        }
    }

    /// True if every model's listener is live.
    pub(crate) fn all_subscribed(&self) -> bool {
        self.states
            .iter()
            .all(|e| *e.value() == ReconciliationState::Subscribed)
    }

    /// Latest `lastChangedAt` received per model, used to scope a resync.
    pub(crate) fn resync_hints(&self) -> HashMap<ModelName, Timestamp> {
        self.last_received
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    pub(crate) fn reset(&self) {
        self.last_received.clear();
        self.deferred.clear();
        self.set_all(ReconciliationState::NotStarted);
    }

    /// Open every model's subscription and wait until all are confirmed.
    ///
    /// Listeners are spawned only once every subscription is established;
    /// if any fails, the ones already opened are dropped (and so cancelled).
    #[tracing::instrument(skip_all)]
    pub(crate) async fn subscribe_all(
        &self,
        remote: Arc<dyn RemoteApi>,
        timeout: Duration,
        activated: watch::Receiver<bool>,
        cancel: CancellationToken,
        actions: mpsc::UnboundedSender<Envelope>,
        generation: u64,
    ) -> Result<IncomingRun> {
        let models: Vec<ModelName> = self.registry.model_names().cloned().collect();

        let opened = futures::future::try_join_all(models.iter().map(|model| {
            let remote = remote.clone();
            let cancel = cancel.clone();
            async move {
                self.set_state(model, ReconciliationState::Subscribing);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    result = tokio::time::timeout(timeout, establish(remote.as_ref(), model)) => {
                        match result {
                            Ok(result) => result.map(|sub| (model.clone(), sub)),
                            Err(_) => Err(Error::Network(format!(
                                "subscription for {model} not established within {timeout:?}"
                            ))),
                        }
                    }
                }
            }
        }))
        .await;

        let opened = match opened {
            Ok(opened) => opened,
            Err(err) => {
                self.set_all(ReconciliationState::Paused);
                return Err(err);
            }
        };

        let tasks = opened
            .into_iter()
            .map(|(model, subscription)| {
                self.set_state(&model, ReconciliationState::Subscribed);
                let listener = Listener {
                    queue: self.clone(),
                    model,
                    subscription,
                    activated: activated.clone(),
                    buffer: Vec::new(),
                };
                tokio::spawn(listener.run(cancel.clone(), actions.clone(), generation))
            })
            .collect();

        Ok(IncomingRun { tasks })
    }

    fn record_received(&self, remote: &RemoteRecord) {
        let model = remote.record.model.clone();
        let mut entry = self.last_received.entry(model).or_insert(0);
        if remote.last_changed_at > *entry {
            *entry = remote.last_changed_at;
        }
    }

    /// Apply one live event to the store and publish what happened.
    ///
    /// Only events that reached the store advance the resync hint. Buffered
    /// or deferred events have not been applied and must be fetched again.
    pub(crate) fn apply(&self, remote: &RemoteRecord) {
        let registry = &self.registry;
        let deferred = &self.deferred;
        let result = self
            .store
            .transact(|tx| Ok(reconcile_or_defer(tx, registry, deferred, remote)));

        match result {
            Ok(Disposition::Deferred) => {
                tracing::debug!(
                    model = %remote.record.model,
                    record_id = %remote.record.id,
                    "deferred remote change behind in-process mutation"
                );
            }
            Ok(disposition) => {
                self.record_received(remote);
                publish_disposition(&self.hub, remote, &disposition);
            }
            Err(err) => tracing::error!(
                model = %remote.record.model,
                record_id = %remote.record.id,
                error = %err,
                "failed to apply remote change"
            ),
        }
    }
}

impl std::fmt::Debug for IncomingReconciliationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingReconciliationQueue")
            .field("states", &self.states())
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}

async fn establish(remote: &dyn RemoteApi, model: &str) -> Result<Subscription> {
    let mut subscription = remote.subscribe(model).await?;
    match subscription.next().await {
        Some(SubscriptionEvent::Established) => Ok(subscription),
        Some(SubscriptionEvent::Failed(err)) => Err(err.into()),
        Some(SubscriptionEvent::Data(_)) => Err(Error::Network(format!(
            "subscription for {model} delivered data before it was established"
        ))),
        None => Err(Error::Network(format!("subscription for {model} closed"))),
    }
}

struct Listener {
    queue: IncomingReconciliationQueue,
    model: ModelName,
    subscription: Subscription,
    activated: watch::Receiver<bool>,
    buffer: Vec<RemoteRecord>,
}

impl Listener {
    async fn run(
        mut self,
        cancel: CancellationToken,
        actions: mpsc::UnboundedSender<Envelope>,
        generation: u64,
    ) {
        let mut active = *self.activated.borrow();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                changed = self.activated.changed(), if !active => {
                    if changed.is_err() {
                        return;
                    }
                    if *self.activated.borrow() {
                        active = true;
                        self.flush();
                    }
                }
                event = self.subscription.next() => match event {
                    Some(SubscriptionEvent::Data(remote)) => {
                        if active {
                            self.queue.apply(&remote);
                        } else {
                            self.buffer.push(remote);
                        }
                    }
                    Some(SubscriptionEvent::Established) => {}
                    Some(SubscriptionEvent::Failed(err)) => {
                        self.lost(err.into(), &actions, generation);
                        return;
                    }
                    None => {
                        if !cancel.is_cancelled() {
                            let err = Error::Network(format!("subscription for {} closed", self.model));
                            self.lost(err, &actions, generation);
                        }
                        return;
                    }
                }
            }
        }
    }

    fn flush(&mut self) {
        let buffered = std::mem::take(&mut self.buffer);
        if !buffered.is_empty() {
            tracing::debug!(model = %self.model, count = buffered.len(), "applying buffered remote changes");
        }
        for remote in &buffered {
            self.queue.apply(remote);
        }
    }

    fn lost(&self, error: Error, actions: &mpsc::UnboundedSender<Envelope>, generation: u64) {
        tracing::warn!(model = %self.model, error = %error, "subscription lost");
        self.queue.set_state(&self.model, ReconciliationState::Paused);
        let _ = actions.send(Envelope::phase(generation, EngineAction::ConnectionLost(error)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType, ModelSchema};
    use crate::{MemoryRemote, MemoryStore, Record};
    use serde_json::json;

    fn registry() -> Arc<ModelRegistry> {
        Arc::new(
            ModelRegistry::new(1)
                .with_model(ModelSchema::new(
                    "Post",
                    vec![
                        FieldDef::required("id", FieldType::String),
                        FieldDef::required("title", FieldType::String),
                    ],
                ))
                .with_model(ModelSchema::new(
                    "Comment",
                    vec![FieldDef::required("id", FieldType::String)],
                )),
        )
    }

    fn queue(store: Arc<MemoryStore>) -> IncomingReconciliationQueue {
        IncomingReconciliationQueue::new(
            store,
            registry(),
            EventHub::new(64),
            DeferredEvents::default(),
        )
    }

    fn post(id: &str, title: &str) -> Record {
        Record::new(id, "Post", json!({"id": id, "title": title}))
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn buffers_until_activated() {
        let store = Arc::new(MemoryStore::new(1));
        let remote = Arc::new(MemoryRemote::new());
        let queue = queue(store.clone());
        let (activate, activated) = watch::channel(false);
        let (actions, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let _run = queue
            .subscribe_all(remote.clone(), Duration::from_secs(1), activated, cancel.clone(), actions, 1)
            .await
            .unwrap();
        assert!(queue.all_subscribed());

        remote.put(post("p-1", "live"));
        settle().await;
        assert!(store.query_by_id("Post", "p-1").unwrap().is_none());
        assert!(queue.resync_hints().is_empty());

        activate.send_replace(true);
        settle().await;
        assert_eq!(
            store.query_by_id("Post", "p-1").unwrap().unwrap().payload["title"],
            "live"
        );
        assert!(queue.resync_hints().contains_key("Post"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn stale_event_is_discarded() {
        let store = Arc::new(MemoryStore::new(1));
        let remote = Arc::new(MemoryRemote::new());
        let queue = queue(store.clone());
        let (_activate, activated) = watch::channel(true);
        let (actions, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        queue
            .subscribe_all(remote.clone(), Duration::from_secs(1), activated, cancel.clone(), actions, 1)
            .await
            .unwrap();

        remote.push(RemoteRecord::new(post("p-b", "current"), 6, 600));
        settle().await;
        let before = store.snapshot();

        remote.push(RemoteRecord::new(post("p-b", "stale"), 5, 500));
        settle().await;

        assert_eq!(store.snapshot(), before);
        cancel.cancel();
    }

    #[tokio::test]
    async fn connection_loss_reports_and_pauses() {
        let store = Arc::new(MemoryStore::new(1));
        let remote = Arc::new(MemoryRemote::new());
        let queue = queue(store.clone());
        let (_activate, activated) = watch::channel(true);
        let (actions, mut rx) = mpsc::unbounded_channel();

        queue
            .subscribe_all(remote.clone(), Duration::from_secs(1), activated, CancellationToken::new(), actions, 7)
            .await
            .unwrap();

        remote.set_online(false);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.generation, Some(7));
        assert!(matches!(envelope.action, EngineAction::ConnectionLost(_)));
        settle().await;
        assert!(!queue.all_subscribed());
    }

    #[tokio::test]
    async fn subscribe_fails_when_offline() {
        let store = Arc::new(MemoryStore::new(1));
        let remote = Arc::new(MemoryRemote::new());
        remote.set_online(false);
        let queue = queue(store);
        let (_activate, activated) = watch::channel(false);
        let (actions, _rx) = mpsc::unbounded_channel();

        let result = queue
            .subscribe_all(remote, Duration::from_secs(1), activated, CancellationToken::new(), actions, 1)
            .await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(queue.state("Post"), Some(ReconciliationState::Paused));
    }

    #[test]
    fn deferred_events_keep_arrival_order() {
        let deferred = DeferredEvents::default();
        deferred.defer(RemoteRecord::new(post("p-1", "a"), 2, 20));
        deferred.defer(RemoteRecord::new(post("p-1", "b"), 3, 30));
        deferred.defer(RemoteRecord::new(post("p-2", "c"), 1, 10));

        let taken = deferred.take("Post", "p-1");
        let versions: Vec<_> = taken.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![2, 3]);
        assert_eq!(deferred.len(), 1);
        assert!(deferred.take("Post", "p-1").is_empty());
    }
}
