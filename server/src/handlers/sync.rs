//! Paged "changed since" queries.

use ferry_engine::{current_timestamp, PageCursor, SyncPage, Timestamp};
use serde::Deserialize;

use crate::config::Config;
use crate::db::RecordStore;
use crate::error::{AppError, Result};

/// Query parameters of `GET /sync/{model}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncParams {
    /// Only records changed at or after this time. Absent for a full sync.
    pub last_sync: Option<Timestamp>,
    /// Cursor token from the previous page.
    pub next_token: Option<String>,
    pub limit: Option<usize>,
}

/// Handle a sync query for one model.
///
/// Pages follow the `(last_changed_at, record_id)` order and each token names
/// the last row returned. `startedAt` trails the clock by the configured
/// checkpoint lag, so a write stamped before the query but committed after it
/// still falls inside the next delta sync.
pub async fn handle_sync(
    records: &dyn RecordStore,
    model: &str,
    params: SyncParams,
    config: &Config,
) -> Result<SyncPage> {
    let started_at = current_timestamp().saturating_sub(config.sync_checkpoint_lag_ms);
    let default_limit = config.sync_page_limit.max(1);
    let limit = params.limit.unwrap_or(default_limit).clamp(1, default_limit);
    let after = match params.next_token.as_deref() {
        None | Some("") => None,
        Some(token) => Some(
            token
                .parse::<PageCursor>()
                .map_err(|err| AppError::BadRequest(format!("invalid nextToken: {err}")))?,
        ),
    };

    let mut items = records
        .page(model, params.last_sync, after.as_ref(), limit + 1)
        .await?;
    let next_token = if items.len() > limit {
        items.truncate(limit);
        items.last().map(|last| PageCursor::after(last).to_string())
    } else {
        None
    };

    tracing::debug!(
        model = %model,
        after = ?after,
        returned = items.len(),
        has_more = next_token.is_some(),
        "Sync query"
    );

    Ok(SyncPage {
        items,
        next_token,
        started_at,
    })
}
