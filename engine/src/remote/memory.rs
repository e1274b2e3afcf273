//! In-process backend for tests, demos and embedding.

use super::{
    apply_remote_mutation, MutationRequest, PageCursor, RemoteApi, RemoteError, Subscription,
    SubscriptionEvent, SubscriptionSink, SyncPage, SyncQuery,
};
use crate::{current_timestamp, ModelName, Record, RecordId, RemoteRecord, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<ModelName, BTreeMap<RecordId, RemoteRecord>>,
    subscribers: HashMap<ModelName, Vec<SubscriptionSink>>,
    mutation_log: Vec<MutationRequest>,
    query_log: Vec<SyncQuery>,
    mutation_failures: VecDeque<RemoteError>,
    query_failures: VecDeque<RemoteError>,
}

/// A backend living in the same process.
///
/// Applies [`apply_remote_mutation`] to its own table, fans each accepted
/// mutation out to subscribers of the model, and can be taken offline or
/// scripted to fail.
#[derive(Debug)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
    online: AtomicBool,
    page_size: AtomicU64,
    clock: AtomicU64,
    holding: watch::Sender<bool>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (holding, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner::default()),
            online: AtomicBool::new(true),
            page_size: AtomicU64::new(DEFAULT_PAGE_SIZE as u64),
            clock: AtomicU64::new(0),
            holding,
        }
    }

    /// Maximum items per sync page, regardless of the requested limit.
    pub fn with_page_size(self, size: usize) -> Self {
        self.page_size.store(size.max(1) as u64, Ordering::SeqCst);
        self
    }

    /// Strictly increasing backend time.
    ///
    /// Callers read it while holding `inner`, so a query's `started_at` is
    /// ordered against every write it could or could not see.
    fn now(&self) -> Timestamp {
        let wall = current_timestamp();
        let mut prev = self.clock.load(Ordering::SeqCst);
        loop {
            let next = wall.max(prev + 1);
            match self
                .clock
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Toggle connectivity. Going offline fails every open subscription.
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was && !online {
            let sinks: Vec<_> = self
                .inner
                .lock()
                .subscribers
                .drain()
                .flat_map(|(_, sinks)| sinks)
                .collect();
            for sink in sinks {
                sink.send(SubscriptionEvent::Failed(RemoteError::transient(
                    "connection lost",
                )));
            }
            tracing::debug!("memory remote offline");
        }
    }

    /// Fail the next `count` mutate calls with `error`.
    pub fn fail_next_mutations(&self, count: usize, error: RemoteError) {
        let mut inner = self.inner.lock();
        inner
            .mutation_failures
            .extend(std::iter::repeat(error).take(count));
    }

    /// Fail the next `count` query calls with `error`.
    pub fn fail_next_queries(&self, count: usize, error: RemoteError) {
        let mut inner = self.inner.lock();
        inner
            .query_failures
            .extend(std::iter::repeat(error).take(count));
    }

    /// Make mutate calls wait (after being logged) until [`release_mutations`](Self::release_mutations).
    pub fn hold_mutations(&self) {
        self.holding.send_replace(true);
    }

    pub fn release_mutations(&self) {
        self.holding.send_replace(false);
    }

    /// Store a record as another client wrote it, and notify subscribers.
    pub fn put(&self, record: Record) -> RemoteRecord {
        let mut inner = self.inner.lock();
        let now = self.now();
        let table = inner.records.entry(record.model.clone()).or_default();
        let stored = match table.get(&record.id) {
            Some(current) => RemoteRecord::new(record, current.version + 1, now),
            None => RemoteRecord::new(record, 1, now),
        };
        table.insert(stored.record.id.clone(), stored.clone());
        Self::fan_out(&mut inner, &stored);
        stored
    }

    /// Delete a record as another client did, and notify subscribers.
    pub fn remove(&self, model: &str, id: &str) -> Option<RemoteRecord> {
        let mut inner = self.inner.lock();
        let now = self.now();
        let current = inner.records.get(model)?.get(id)?.clone();
        let tombstone =
            RemoteRecord::tombstone(current.record, current.version + 1, now.max(current.last_changed_at));
        inner
            .records
            .entry(model.to_string())
            .or_default()
            .insert(id.to_string(), tombstone.clone());
        Self::fan_out(&mut inner, &tombstone);
        Some(tombstone)
    }

    /// Store a record with exact metadata, without notifying anyone.
    pub fn seed(&self, remote: RemoteRecord) {
        self.clock.fetch_max(remote.last_changed_at, Ordering::SeqCst);
        self.inner
            .lock()
            .records
            .entry(remote.record.model.clone())
            .or_default()
            .insert(remote.record.id.clone(), remote);
    }

    /// Deliver an event to subscribers without storing it.
    pub fn push(&self, remote: RemoteRecord) {
        let mut inner = self.inner.lock();
        Self::fan_out(&mut inner, &remote);
    }

    pub fn get(&self, model: &str, id: &str) -> Option<RemoteRecord> {
        self.inner.lock().records.get(model)?.get(id).cloned()
    }

    pub fn records(&self, model: &str) -> Vec<RemoteRecord> {
        self.inner
            .lock()
            .records
            .get(model)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every mutate request received, in arrival order.
    pub fn mutation_log(&self) -> Vec<MutationRequest> {
        self.inner.lock().mutation_log.clone()
    }

    pub fn query_log(&self) -> Vec<SyncQuery> {
        self.inner.lock().query_log.clone()
    }

    pub fn subscriber_count(&self, model: &str) -> usize {
        let mut inner = self.inner.lock();
        let Some(sinks) = inner.subscribers.get_mut(model) else {
            return 0;
        };
        sinks.retain(|s| !s.is_closed());
        sinks.len()
    }

    fn fan_out(inner: &mut Inner, remote: &RemoteRecord) {
        if let Some(sinks) = inner.subscribers.get_mut(&remote.record.model) {
            sinks.retain(|sink| sink.send(SubscriptionEvent::Data(remote.clone())));
        }
    }

    fn offline_error() -> RemoteError {
        RemoteError::transient("remote unreachable")
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    async fn query(&self, query: SyncQuery) -> Result<SyncPage, RemoteError> {
        if !self.is_online() {
            return Err(Self::offline_error());
        }
        let mut inner = self.inner.lock();
        let started_at = self.now();
        inner.query_log.push(query.clone());
        if let Some(err) = inner.query_failures.pop_front() {
            return Err(err);
        }

        let cursor = query
            .next_token
            .as_deref()
            .map(str::parse::<PageCursor>)
            .transpose()
            .map_err(|err| RemoteError::Rejected(err.to_string()))?;

        let mut items: Vec<RemoteRecord> = inner
            .records
            .get(&query.model)
            .map(|t| {
                t.values()
                    .filter(|r| query.last_sync.map_or(true, |since| r.last_changed_at >= since))
                    .filter(|r| cursor.as_ref().map_or(true, |c| c.admits(r)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        items.sort_by(|a, b| {
            (a.last_changed_at, &a.record.id).cmp(&(b.last_changed_at, &b.record.id))
        });

        let page_size = self.page_size.load(Ordering::SeqCst) as usize;
        let limit = query.limit.clamp(1, page_size);
        let has_more = items.len() > limit;
        items.truncate(limit);
        let next_token = has_more
            .then(|| items.last().map(|last| PageCursor::after(last).to_string()))
            .flatten();

        Ok(SyncPage {
            items,
            next_token,
            started_at,
        })
    }

    async fn mutate(&self, request: MutationRequest) -> Result<RemoteRecord, RemoteError> {
        if !self.is_online() {
            return Err(Self::offline_error());
        }

        {
            let mut inner = self.inner.lock();
            inner.mutation_log.push(request.clone());
            if let Some(err) = inner.mutation_failures.pop_front() {
                return Err(err);
            }
        }

        let mut holding = self.holding.subscribe();
        if holding.wait_for(|held| !*held).await.is_err() {
            return Err(Self::offline_error());
        }
        if !self.is_online() {
            return Err(Self::offline_error());
        }

        let mut inner = self.inner.lock();
        let now = self.now();
        let current = inner
            .records
            .get(&request.model)
            .and_then(|t| t.get(&request.record.id));
        let applied = apply_remote_mutation(current, &request, now)?;

        let changed = current != Some(&applied);
        if changed {
            inner
                .records
                .entry(request.model.clone())
                .or_default()
                .insert(applied.record.id.clone(), applied.clone());
            Self::fan_out(&mut inner, &applied);
        }

        tracing::trace!(
            model = %request.model,
            record_id = %request.record.id,
            version = applied.version,
            "memory remote applied mutation"
        );
        Ok(applied)
    }

    async fn subscribe(&self, model: &str) -> Result<Subscription, RemoteError> {
        if !self.is_online() {
            return Err(Self::offline_error());
        }
        let (sink, subscription) = Subscription::channel();
        sink.send(SubscriptionEvent::Established);
        self.inner
            .lock()
            .subscribers
            .entry(model.to_string())
            .or_default()
            .push(sink);
        Ok(subscription)
    }
}
