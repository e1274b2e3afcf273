//! Version-conditioned writes.

use ferry_engine::{current_timestamp, MutationRequest, RemoteRecord};

use crate::db::RecordStore;
use crate::error::{AppError, Result};
use crate::websocket::SubscriptionManager;

/// Apply one mutation and fan it out to subscribers of its model.
///
/// A replay of a mutation that already landed returns the stored copy and
/// publishes nothing.
pub async fn handle_mutate(
    records: &dyn RecordStore,
    subscriptions: &SubscriptionManager,
    model: &str,
    request: MutationRequest,
) -> Result<RemoteRecord> {
    if request.model != model || request.record.model != model {
        return Err(AppError::BadRequest(format!(
            "mutation for {} sent to /mutate/{model}",
            request.record.model
        )));
    }
    if request.record.id.is_empty() {
        return Err(AppError::BadRequest("record id is required".into()));
    }
    if !request.record.payload.is_object() {
        return Err(AppError::BadRequest("payload must be a JSON object".into()));
    }

    let applied = records.mutate(&request, current_timestamp()).await?;

    if applied.changed {
        subscriptions.publish(&applied.record);
    } else {
        tracing::debug!(
            model = %model,
            id = %applied.record.record.id,
            "Mutation already applied"
        );
    }

    Ok(applied.record)
}
