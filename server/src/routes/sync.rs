//! Sync endpoint routes.

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use ferry_engine::{MutationRequest, RemoteRecord, SyncPage};

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{handle_mutate, handle_sync, handle_websocket_connection, SyncParams};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync/{model}", get(sync_handler))
        .route("/mutate/{model}", post(mutate_handler))
        .route("/subscribe", get(subscribe_handler))
}

/// GET /sync/{model} - One page of records changed since `lastSync`.
async fn sync_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(model): Path<String>,
    Query(params): Query<SyncParams>,
) -> Result<Json<SyncPage>> {
    let page = handle_sync(state.records.as_ref(), &model, params, &state.config).await?;
    Ok(Json(page))
}

/// POST /mutate/{model} - Version-conditioned create, update or delete.
async fn mutate_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(model): Path<String>,
    Json(request): Json<MutationRequest>,
) -> Result<Json<RemoteRecord>> {
    let record = handle_mutate(
        state.records.as_ref(),
        &state.subscriptions,
        &model,
        request,
    )
    .await?;
    Ok(Json(record))
}

/// GET /subscribe - Upgrade to a live subscription socket.
async fn subscribe_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    ws: WebSocketUpgrade,
) -> Response {
    let subscriptions = state.subscriptions.clone();
    ws.on_upgrade(move |socket| handle_websocket_connection(socket, subscriptions))
}
