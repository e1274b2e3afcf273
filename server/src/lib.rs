//! Ferry Server - reference backend for the Ferry sync engine.
//!
//! Holds the authoritative copy of every record, accepts version-conditioned
//! mutations over HTTP, serves paged "changed since" queries, and pushes
//! accepted mutations to WebSocket subscribers.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::RecordStore;
use crate::websocket::SubscriptionManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn RecordStore>,
    pub config: Arc<Config>,
    pub subscriptions: Arc<SubscriptionManager>,
}

impl AppState {
    pub fn new(records: Arc<dyn RecordStore>, config: Config) -> Self {
        Self {
            records,
            config: Arc::new(config),
            subscriptions: SubscriptionManager::new_shared(),
        }
    }
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
