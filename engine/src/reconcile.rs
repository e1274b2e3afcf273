//! Merge rule for incoming remote changes.
//!
//! Both the initial sync and the live reconciliation queue funnel remote
//! records through [`reconcile_remote`], inside a store transaction.
//!
//! # Rule
//!
//! 1. Invalid payloads are dropped
//! 2. A record with an in-process local mutation is deferred until that mutation finishes
//! 3. A record with any other pending local mutation is dropped (the local change wins
//!    and is reconciled through the outgoing queue's conflict handling)
//! 4. Otherwise the remote copy is applied only if `(version, lastChangedAt)` is
//!    strictly newer than the stored sync metadata

use crate::hub::{DropReason, EngineEvent, EventHub, SyncCounts};
use crate::store::Transaction;
use crate::{ModelRegistry, RemoteRecord, SyncMetadata};
use std::cmp::Ordering;

/// What happened to one incoming remote record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Created,
    Updated,
    Deleted,
    Dropped(DropReason),
    /// Re-evaluate once the in-process local mutation completes
    Deferred,
}

impl Disposition {
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            Disposition::Created | Disposition::Updated | Disposition::Deleted
        )
    }

    /// Tally into per-model counts. Deferred records are not counted.
    pub fn count(&self, counts: &mut SyncCounts) {
        match self {
            Disposition::Created => counts.created += 1,
            Disposition::Updated => counts.updated += 1,
            Disposition::Deleted => counts.deleted += 1,
            Disposition::Dropped(_) => counts.dropped += 1,
            Disposition::Deferred => {}
        }
    }
}

/// Compare an incoming copy against stored metadata, ignoring pending mutations.
pub fn merge_disposition(remote: &RemoteRecord, local: Option<&SyncMetadata>) -> Disposition {
    match local {
        None if remote.deleted => Disposition::Deleted,
        None => Disposition::Created,
        Some(local) if remote.compare_to(local) != Ordering::Greater => {
            Disposition::Dropped(DropReason::Stale)
        }
        Some(_) if remote.deleted => Disposition::Deleted,
        Some(local) if local.deleted => Disposition::Created,
        Some(_) => Disposition::Updated,
    }
}

/// Apply one remote record to the store according to the merge rule.
pub fn reconcile_remote(
    tx: &mut dyn Transaction,
    registry: &ModelRegistry,
    remote: &RemoteRecord,
) -> Disposition {
    let record = &remote.record;

    if !remote.deleted {
        if let Err(err) = registry.validate(record) {
            return Disposition::Dropped(DropReason::Invalid(err.to_string()));
        }
    } else if registry.get(&record.model).is_none() {
        return Disposition::Dropped(DropReason::Invalid(format!(
            "model not found: {}",
            record.model
        )));
    }

    let pending = tx.mutations_for(&record.model, &record.id);
    if pending.iter().any(|e| e.in_process) {
        return Disposition::Deferred;
    }
    if !pending.is_empty() {
        return Disposition::Dropped(DropReason::PendingMutation);
    }

    let local = tx.metadata(&record.model, &record.id);
    let disposition = merge_disposition(remote, local.as_ref());

    match disposition {
        Disposition::Created | Disposition::Updated => {
            tx.save(record.clone());
            tx.save_metadata(remote.metadata());
        }
        Disposition::Deleted => {
            tx.delete(&record.model, &record.id);
            tx.save_metadata(remote.metadata());
        }
        Disposition::Dropped(_) | Disposition::Deferred => {}
    }

    disposition
}

/// Publish the lifecycle event matching a disposition.
pub(crate) fn publish_disposition(hub: &EventHub, remote: &RemoteRecord, disposition: &Disposition) {
    let model = remote.record.model.clone();
    let record_id = remote.record.id.clone();

    match disposition {
        Disposition::Created | Disposition::Updated | Disposition::Deleted => {
            hub.publish(EngineEvent::SyncReceived {
                model,
                record_id,
                version: remote.version,
            });
        }
        Disposition::Dropped(reason) => {
            tracing::debug!(
                model = %model,
                record_id = %record_id,
                version = remote.version,
                ?reason,
                "dropped remote change"
            );
            hub.publish(EngineEvent::SyncDropped {
                model,
                record_id,
                reason: reason.clone(),
            });
        }
        Disposition::Deferred => {}
    }
}
