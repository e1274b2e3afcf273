//! Remote sync engine: the coordinator that sequences every sync phase.
//!
//! A single coordinator task owns the [`EngineState`] and processes
//! [`EngineAction`]s one at a time from an unbounded inbox, so concurrent
//! requests queue up instead of racing. Each network-facing phase runs as a
//! spawned worker tied to a *run*: a cancellation token plus a generation
//! number. Reports from a retired run carry a stale generation and are
//! dropped.

mod state;

pub use state::{resolve, AfterCleanup, EngineAction, EngineState};

use crate::config::EngineConfig;
use crate::hub::{EngineEvent, EventHub};
use crate::incoming::{DeferredEvents, IncomingReconciliationQueue, ReconciliationState};
use crate::ingest::MutationIngester;
use crate::initial_sync::InitialSyncOrchestrator;
use crate::outgoing::{OutgoingMutationQueue, OutgoingState};
use crate::remote::RemoteApi;
use crate::store::{LocalStore, MemoryStore};
use crate::{
    error::Result, Error, ModelName, ModelRegistry, MutationCondition, MutationEvent,
    MutationType, Record,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// An action on its way to the coordinator.
#[derive(Debug)]
pub(crate) struct Envelope {
    /// Run that produced the action; `None` for host requests
    pub(crate) generation: Option<u64>,
    pub(crate) action: EngineAction,
    ack: Option<oneshot::Sender<()>>,
}

impl Envelope {
    pub(crate) fn phase(generation: u64, action: EngineAction) -> Self {
        Self {
            generation: Some(generation),
            action,
            ack: None,
        }
    }

    fn host(action: EngineAction) -> (Self, oneshot::Receiver<()>) {
        let (ack, done) = oneshot::channel();
        let envelope = Self {
            generation: None,
            action,
            ack: Some(ack),
        };
        (envelope, done)
    }
}

/// Builder for [`RemoteSyncEngine`].
pub struct EngineBuilder {
    registry: ModelRegistry,
    store: Option<Arc<dyn LocalStore>>,
    remote: Option<Arc<dyn RemoteApi>>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Local store to sync. Defaults to an unbacked [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Remote backend. Without one the engine stops on start and the store
    /// stays usable offline.
    pub fn remote(mut self, remote: Arc<dyn RemoteApi>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Wire up the components and spawn the coordinator.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<RemoteSyncEngine> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::Configuration("the sync engine must be built inside a tokio runtime".into())
        })?;
        if self.registry.is_empty() {
            return Err(Error::Configuration("no models registered".into()));
        }

        let registry = Arc::new(self.registry);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new(registry.version)));
        let config = self.config;
        let hub = EventHub::new(config.event_capacity);
        let wake = Arc::new(Notify::new());
        let deferred = DeferredEvents::default();

        let ingester =
            MutationIngester::new(store.clone(), registry.clone(), hub.clone(), wake.clone());
        let incoming = IncomingReconciliationQueue::new(
            store.clone(),
            registry.clone(),
            hub.clone(),
            deferred.clone(),
        );
        let outgoing = OutgoingMutationQueue::new(
            store.clone(),
            registry.clone(),
            hub.clone(),
            deferred,
            config.mutation_retry.clone(),
            config.conflict_policy.clone(),
            wake,
        );
        let initial_sync =
            InitialSyncOrchestrator::new(store.clone(), registry.clone(), hub.clone(), &config);

        let (actions, inbox) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(EngineState::NotStarted);
        let shutdown = CancellationToken::new();

        let coordinator = Coordinator {
            state: EngineState::NotStarted,
            state_tx,
            hub: hub.clone(),
            config,
            remote: self.remote,
            incoming: incoming.clone(),
            outgoing: outgoing.clone(),
            initial_sync,
            actions: actions.clone(),
            shutdown: shutdown.clone(),
            generation: 0,
            run: None,
            network_available: true,
            restart_attempt: 0,
            after_cleanup: AfterCleanup::Pause,
            restart_error: None,
            stop_error: None,
        };
        runtime.spawn(coordinator.run(inbox));

        tracing::debug!(models = registry.len(), "sync engine built");

        Ok(RemoteSyncEngine {
            store,
            registry,
            hub,
            ingester,
            incoming,
            outgoing,
            actions,
            state,
            shutdown,
        })
    }
}

/// Host-facing handle of the sync engine.
///
/// Reads and writes go straight to the local store and work in every state,
/// including before `start()` and after a configuration failure.
pub struct RemoteSyncEngine {
    store: Arc<dyn LocalStore>,
    registry: Arc<ModelRegistry>,
    hub: EventHub,
    ingester: MutationIngester,
    incoming: IncomingReconciliationQueue,
    outgoing: OutgoingMutationQueue,
    actions: mpsc::UnboundedSender<Envelope>,
    state: watch::Receiver<EngineState>,
    shutdown: CancellationToken,
}

impl RemoteSyncEngine {
    pub fn builder(registry: ModelRegistry) -> EngineBuilder {
        EngineBuilder {
            registry,
            store: None,
            remote: None,
            config: EngineConfig::default(),
        }
    }

    /// Subscribe to the lifecycle event stream.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.hub.subscribe()
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    pub fn outgoing_state(&self) -> OutgoingState {
        self.outgoing.state()
    }

    pub fn reconciliation_states(&self) -> HashMap<ModelName, ReconciliationState> {
        self.incoming.states()
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Begin syncing. Returns once the request is queued.
    pub fn start(&self) -> Result<()> {
        self.send(EngineAction::Start).map(drop)
    }

    /// Stop syncing and wait until every worker has been released.
    pub async fn stop(&self) -> Result<()> {
        let done = self.send(EngineAction::Stop)?;
        done.await.map_err(|_| Error::Cancelled)
    }

    /// Stop, then empty the local store, outbox, sync metadata and checkpoints.
    pub async fn clear(&self) -> Result<()> {
        self.stop().await?;
        self.store.clear()?;
        self.incoming.reset();
        tracing::info!("local state cleared");
        self.hub.publish(EngineEvent::OutboxStatus { is_empty: true });
        Ok(())
    }

    /// Tell the engine whether the host has network connectivity.
    pub fn set_network_available(&self, available: bool) -> Result<()> {
        self.send(EngineAction::NetworkChanged(available)).map(drop)
    }

    pub fn submit(&self, record: Record, mutation_type: MutationType) -> Result<MutationEvent> {
        self.ingester.submit(record, mutation_type)
    }

    /// Submit a change the backend applies only if `condition` holds for its copy.
    pub fn submit_with_condition(
        &self,
        record: Record,
        mutation_type: MutationType,
        condition: MutationCondition,
    ) -> Result<MutationEvent> {
        self.ingester
            .submit_with_condition(record, mutation_type, Some(condition))
    }

    /// Create the record, or update it if it already exists locally.
    pub fn save(&self, record: Record) -> Result<MutationEvent> {
        let mutation_type = match self.store.query_by_id(&record.model, &record.id)? {
            Some(_) => MutationType::Update,
            None => MutationType::Create,
        };
        self.ingester.submit(record, mutation_type)
    }

    pub fn delete(&self, model: &str, id: &str) -> Result<MutationEvent> {
        let record = self
            .store
            .query_by_id(model, id)?
            .ok_or_else(|| Error::RecordNotFound(id.to_string()))?;
        self.ingester.submit(record, MutationType::Delete)
    }

    pub fn query_by_id(&self, model: &str, id: &str) -> Result<Option<Record>> {
        self.store.query_by_id(model, id)
    }

    pub fn query(&self, model: &str) -> Result<Vec<Record>> {
        self.store.query(model)
    }

    pub fn pending_mutations(&self) -> Result<Vec<MutationEvent>> {
        self.store.pending_mutations()
    }

    fn send(&self, action: EngineAction) -> Result<oneshot::Receiver<()>> {
        let (envelope, done) = Envelope::host(action);
        self.actions
            .send(envelope)
            .map_err(|_| Error::Configuration("sync engine coordinator is not running".into()))?;
        Ok(done)
    }
}

impl Drop for RemoteSyncEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for RemoteSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSyncEngine")
            .field("state", &self.state())
            .field("outgoing", &self.outgoing_state())
            .finish_non_exhaustive()
    }
}

type Tasks = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// Workers spawned since the last `Subscribing` (or restart timer).
struct Run {
    cancel: CancellationToken,
    /// Flipped once the outbox may drain; listeners buffer until then
    activated: watch::Sender<bool>,
    tasks: Tasks,
}

struct Coordinator {
    state: EngineState,
    state_tx: watch::Sender<EngineState>,
    hub: EventHub,
    config: EngineConfig,
    remote: Option<Arc<dyn RemoteApi>>,
    incoming: IncomingReconciliationQueue,
    outgoing: OutgoingMutationQueue,
    initial_sync: InitialSyncOrchestrator,
    actions: mpsc::UnboundedSender<Envelope>,
    shutdown: CancellationToken,
    generation: u64,
    run: Option<Run>,
    network_available: bool,
    restart_attempt: u32,
    after_cleanup: AfterCleanup,
    restart_error: Option<Error>,
    stop_error: Option<Error>,
}

impl Coordinator {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        loop {
            let envelope = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            self.handle(envelope).await;
        }
        self.retire_run();
        tracing::debug!("sync engine coordinator exited");
    }

    async fn handle(&mut self, envelope: Envelope) {
        let Envelope {
            generation,
            action,
            ack,
        } = envelope;

        if generation.is_some_and(|g| g != self.generation) {
            tracing::trace!(?action, "dropping report from a retired run");
        } else {
            // Follow-up actions produced on entry are handled before the
            // next queued one.
            let mut next = Some(action);
            while let Some(action) = next.take() {
                next = self.step(action).await;
            }
        }

        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    async fn step(&mut self, action: EngineAction) -> Option<EngineAction> {
        if let EngineAction::NetworkChanged(available) = action {
            if self.network_available != available {
                self.network_available = available;
                self.hub
                    .publish(EngineEvent::NetworkStatus { active: available });
            }
        }

        let Some(next) = resolve(self.state, &action) else {
            tracing::trace!(state = ?self.state, ?action, "action ignored");
            return None;
        };

        self.prepare(next, action);
        self.transition(next);
        self.enter(next).await
    }

    /// Stash what the target state needs from the action that caused it.
    fn prepare(&mut self, next: EngineState, action: EngineAction) {
        match (next, action) {
            (EngineState::CleaningUp, action) => self.after_cleanup = self.cleanup_target(action),
            (
                EngineState::SchedulingRestart,
                EngineAction::CleanupComplete(AfterCleanup::Restart(err)),
            ) => self.restart_error = Some(err),
            (EngineState::Stopped, EngineAction::CleanupComplete(AfterCleanup::Stop(err))) => {
                self.stop_error = err;
            }
            (EngineState::Stopped, EngineAction::Failed(err)) => self.stop_error = Some(err),
            _ => {}
        }
    }

    fn cleanup_target(&self, action: EngineAction) -> AfterCleanup {
        match action {
            EngineAction::Stop => AfterCleanup::Stop(None),
            _ if !self.network_available => AfterCleanup::Pause,
            EngineAction::ConnectionLost(err) => AfterCleanup::Restart(err),
            EngineAction::Failed(err) if err.is_retryable() => AfterCleanup::Restart(err),
            EngineAction::Failed(err) => AfterCleanup::Stop(Some(err)),
            _ => AfterCleanup::Pause,
        }
    }

    fn transition(&mut self, next: EngineState) {
        let previous = std::mem::replace(&mut self.state, next);
        tracing::debug!(?previous, state = ?next, "engine state");
        self.state_tx.send_replace(next);
        self.hub.publish(EngineEvent::StateChanged(next));
    }

    async fn enter(&mut self, state: EngineState) -> Option<EngineAction> {
        match state {
            EngineState::NotStarted => None,
            EngineState::Configuring => {
                self.restart_attempt = 0;
                Some(self.configure())
            }
            EngineState::Subscribing => {
                self.subscribe();
                None
            }
            EngineState::SyncingInitial => {
                self.hub.publish(EngineEvent::SubscriptionsEstablished);
                self.sync_initial();
                None
            }
            EngineState::MutationsPaused => self.activate(),
            EngineState::DrainingOutgoing => {
                self.drain_outgoing();
                Some(EngineAction::OutgoingStarted)
            }
            EngineState::Synced => {
                self.restart_attempt = 0;
                tracing::info!("sync engine ready");
                self.hub.publish(EngineEvent::Ready);
                None
            }
            EngineState::Paused => {
                self.retire_run();
                self.incoming.set_all(ReconciliationState::Paused);
                tracing::info!("sync paused until the network returns");
                self.hub.publish(EngineEvent::Paused);
                None
            }
            EngineState::CleaningUp => Some(EngineAction::CleanupComplete(self.clean_up().await)),
            EngineState::SchedulingRestart => self.schedule_restart(),
            EngineState::Stopped => {
                let error = self.stop_error.take();
                match &error {
                    Some(err) => tracing::error!(error = %err, "sync engine stopped"),
                    None => tracing::info!("sync engine stopped"),
                }
                self.hub.publish(EngineEvent::Stopped { error });
                None
            }
        }
    }

    fn configure(&self) -> EngineAction {
        match self.remote {
            Some(_) => EngineAction::Configured {
                online: self.network_available,
            },
            None => EngineAction::Failed(Error::Configuration(
                "no remote backend bound; running offline".into(),
            )),
        }
    }

    fn begin_run(&mut self) -> u64 {
        self.retire_run();
        self.generation += 1;
        let (activated, _) = watch::channel(false);
        self.run = Some(Run {
            cancel: self.shutdown.child_token(),
            activated,
            tasks: Tasks::default(),
        });
        self.generation
    }

    /// Cancel the current run without waiting for its workers.
    fn retire_run(&mut self) {
        if let Some(run) = self.run.take() {
            run.cancel.cancel();
            for handle in run.tasks.lock().drain(..) {
                handle.abort();
            }
            self.generation += 1;
        }
    }

    /// Spawn a worker in the current run; its result is posted back as an action.
    fn spawn_phase<F, Fut>(&mut self, phase: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Option<EngineAction>> + Send + 'static,
    {
        let Some(run) = &self.run else {
            tracing::warn!(state = ?self.state, "no active run for phase");
            return;
        };
        let generation = self.generation;
        let actions = self.actions.clone();
        let work = phase(run.cancel.clone());
        let handle = tokio::spawn(async move {
            if let Some(action) = work.await {
                let _ = actions.send(Envelope::phase(generation, action));
            }
        });
        run.tasks.lock().push(handle);
    }

    fn subscribe(&mut self) {
        let Some(remote) = self.remote.clone() else {
            return;
        };
        let generation = self.begin_run();
        let Some((activated, tasks)) = self
            .run
            .as_ref()
            .map(|run| (run.activated.subscribe(), run.tasks.clone()))
        else {
            return;
        };

        let incoming = self.incoming.clone();
        let actions = self.actions.clone();
        let timeout = self.config.subscription_timeout;
        self.spawn_phase(move |cancel| async move {
            let result = incoming
                .subscribe_all(remote, timeout, activated, cancel, actions, generation)
                .await;
            match result {
                Ok(run) => {
                    tasks.lock().extend(run.tasks);
                    Some(EngineAction::SubscriptionsEstablished)
                }
                Err(Error::Cancelled) => None,
                Err(err) => Some(EngineAction::Failed(err)),
            }
        });
    }

    fn sync_initial(&mut self) {
        let Some(remote) = self.remote.clone() else {
            return;
        };
        let sync = self.initial_sync.clone();
        let hints = self.incoming.resync_hints();
        self.spawn_phase(move |cancel| async move {
            match sync.sync(remote.as_ref(), &hints, &cancel).await {
                Ok(_) => Some(EngineAction::InitialSyncCompleted),
                Err(Error::Cancelled) => None,
                Err(err) => Some(EngineAction::Failed(err)),
            }
        });
    }

    fn activate(&mut self) -> Option<EngineAction> {
        if let Some(run) = &self.run {
            run.activated.send_replace(true);
        }
        if self.incoming.all_subscribed() {
            Some(EngineAction::SubscriptionsReady)
        } else {
            // The listener that dropped has already reported the loss.
            tracing::debug!("subscriptions not all live; holding the outbox");
            None
        }
    }

    fn drain_outgoing(&mut self) {
        let Some(remote) = self.remote.clone() else {
            return;
        };
        let outgoing = self.outgoing.clone();
        self.spawn_phase(move |cancel| async move {
            outgoing.run(remote, cancel).await.err().map(EngineAction::Failed)
        });
    }

    #[tracing::instrument(skip(self))]
    async fn clean_up(&mut self) -> AfterCleanup {
        let after = std::mem::replace(&mut self.after_cleanup, AfterCleanup::Pause);
        // Anything the retiring run still reports is stale from here on.
        self.generation += 1;

        if let Some(run) = self.run.take() {
            run.cancel.cancel();
            let deadline = tokio::time::Instant::now() + self.config.stop_grace_period;
            loop {
                let handles = std::mem::take(&mut *run.tasks.lock());
                if handles.is_empty() {
                    break;
                }
                for mut handle in handles {
                    if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                        tracing::warn!("worker did not stop within the grace period; aborting");
                        handle.abort();
                    }
                }
            }

            // An aborted send leaves its event flagged; nothing is in flight now.
            if let Err(err) = self.outgoing.release_interrupted() {
                tracing::error!(error = %err, "failed to release interrupted outbox entries");
            }
        }

        let incoming = match after {
            AfterCleanup::Stop(_) => ReconciliationState::Cancelled,
            AfterCleanup::Pause | AfterCleanup::Restart(_) => ReconciliationState::Paused,
        };
        self.incoming.set_all(incoming);
        after
    }

    fn schedule_restart(&mut self) -> Option<EngineAction> {
        let error = self
            .restart_error
            .take()
            .unwrap_or_else(|| Error::Network("restart requested".into()));
        self.restart_attempt = self.restart_attempt.saturating_add(1);
        let attempt = self.restart_attempt;

        let Some(delay) = self.config.restart_retry.next_delay(attempt) else {
            tracing::error!(attempts = attempt, error = %error, "restart attempts exhausted");
            return Some(EngineAction::Failed(error));
        };

        tracing::warn!(attempt, ?delay, error = %error, "scheduling sync restart");
        self.begin_run();
        self.spawn_phase(move |cancel| async move {
            tokio::select! {
                _ = cancel.cancelled() => None,
                _ = tokio::time::sleep(delay) => Some(EngineAction::RestartDue),
            }
        });
        None
    }
}
