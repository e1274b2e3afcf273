//! Initial sync orchestrator: paginated catch-up of every model.
//!
//! Models are fetched concurrently, pages within a model sequentially. New
//! checkpoints are committed together, and only once every model finished,
//! so a failed run retries from the previous checkpoints.

use crate::hub::{EngineEvent, EventHub, SyncCounts};
use crate::reconcile::{reconcile_remote, Disposition};
use crate::remote::{RemoteApi, SyncQuery};
use crate::store::LocalStore;
use crate::{
    current_timestamp, error::Result, DropReason, EngineConfig, Error, ModelName,
    ModelRegistry, Timestamp,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of syncing one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSyncResult {
    pub model: ModelName,
    pub is_full_sync: bool,
    pub counts: SyncCounts,
    /// Checkpoint to commit once the whole run succeeds
    pub checkpoint: Timestamp,
}

#[derive(Clone)]
pub(crate) struct InitialSyncOrchestrator {
    store: Arc<dyn LocalStore>,
    registry: Arc<ModelRegistry>,
    hub: EventHub,
    page_size: usize,
    max_records: usize,
    full_sync_interval: Duration,
}

/// Lower bound for a model's sync query, or `None` for a full sync.
///
/// The later of the stored checkpoint and the last live event received is
/// used; anything older than `full_sync_interval` forces a full sync.
pub fn sync_since(
    checkpoint: Option<Timestamp>,
    last_received: Option<Timestamp>,
    now: Timestamp,
    full_sync_interval: Duration,
) -> Option<Timestamp> {
    let since = checkpoint.max(last_received)?;
    let interval = u64::try_from(full_sync_interval.as_millis()).unwrap_or(u64::MAX);
    (now.saturating_sub(since) <= interval).then_some(since)
}

impl InitialSyncOrchestrator {
    pub(crate) fn new(
        store: Arc<dyn LocalStore>,
        registry: Arc<ModelRegistry>,
        hub: EventHub,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            hub,
            page_size: config.sync_page_size.max(1),
            max_records: config.sync_max_records,
            full_sync_interval: config.full_sync_interval,
        }
    }

    /// Sync every registered model and commit new checkpoints.
    ///
    /// `hints` carries the last live event time per model, narrowing a resync
    /// after a reconnect to the gap window. Hints are ignored for models with
    /// no committed checkpoint.
    #[tracing::instrument(skip_all)]
    pub(crate) async fn sync(
        &self,
        remote: &dyn RemoteApi,
        hints: &HashMap<ModelName, Timestamp>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ModelSyncResult>> {
        let models: Vec<ModelName> = self.registry.model_names().cloned().collect();
        self.hub.publish(EngineEvent::SyncQueriesStarted {
            models: models.clone(),
        });

        let now = current_timestamp();
        let results = futures::future::try_join_all(models.iter().map(|model| {
            self.sync_model(remote, model, hints.get(model).copied(), now, cancel)
        }))
        .await?;

        self.store.transact(|tx| {
            for result in &results {
                tx.set_checkpoint(&result.model, result.checkpoint);
            }
            Ok(())
        })?;

        tracing::info!(models = results.len(), "initial sync complete");
        self.hub.publish(EngineEvent::SyncQueriesReady);
        Ok(results)
    }

    async fn sync_model(
        &self,
        remote: &dyn RemoteApi,
        model: &ModelName,
        last_received: Option<Timestamp>,
        now: Timestamp,
        cancel: &CancellationToken,
    ) -> Result<ModelSyncResult> {
        let checkpoint = self.store.checkpoint(model)?;
        // A live hint only narrows a sync that already has a committed base.
        let last_received = checkpoint.and(last_received);
        let since = sync_since(checkpoint, last_received, now, self.full_sync_interval);
        let is_full_sync = since.is_none();

        tracing::debug!(model = %model, ?since, is_full_sync, "syncing model");

        let mut counts = SyncCounts::default();
        let mut next_token = None;
        let mut started_at = None;
        let mut fetched = 0usize;

        loop {
            let remaining = self.max_records.saturating_sub(fetched);
            if remaining == 0 {
                tracing::warn!(model = %model, fetched, "sync stopped at max records");
                break;
            }

            let query = SyncQuery {
                model: model.clone(),
                last_sync: since,
                next_token: next_token.take(),
                limit: self.page_size.min(remaining),
            };
            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                page = remote.query(query) => page?,
            };

            started_at.get_or_insert(page.started_at);
            fetched += page.items.len();

            let registry = &self.registry;
            let dispositions = self.store.transact(|tx| {
                Ok(page
                    .items
                    .iter()
                    .map(|item| match reconcile_remote(tx, registry, item) {
                        Disposition::Deferred => {
                            Disposition::Dropped(DropReason::PendingMutation)
                        }
                        other => other,
                    })
                    .collect::<Vec<_>>())
            })?;
            for disposition in &dispositions {
                disposition.count(&mut counts);
            }

            tracing::trace!(model = %model, items = page.items.len(), "applied sync page");

            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        self.hub.publish(EngineEvent::ModelSynced {
            model: model.clone(),
            is_full_sync,
            counts,
        });

        Ok(ModelSyncResult {
            model: model.clone(),
            is_full_sync,
            counts,
            checkpoint: started_at.unwrap_or(now),
        })
    }
}
