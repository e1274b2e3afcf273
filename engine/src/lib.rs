//! # Ferry Engine
//!
//! An offline-first sync engine. Applications read and write records against
//! a local store while the engine reconciles them with a remote backend in
//! the background.
//!
//! ## Components
//!
//! - [`MutationIngester`] validates local writes and appends them to a durable
//!   outbox in the same transaction as the optimistic local change
//! - The outgoing mutation queue drains the outbox in order, one event in
//!   flight at a time, with retry/backoff and conflict handling
//! - The initial sync orchestrator pages through every model changed since the
//!   last checkpoint
//! - The incoming reconciliation queue applies live remote changes through the
//!   version merge rule
//! - [`RemoteSyncEngine`] sequences the phases above and reacts to
//!   connectivity changes
//!
//! The local store ([`LocalStore`]) and the backend ([`RemoteApi`]) are
//! traits. [`MemoryStore`] (optionally file-backed) and [`MemoryRemote`] are
//! the bundled implementations.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ferry_engine::{
//!     FieldDef, FieldType, MemoryRemote, ModelRegistry, ModelSchema, Record,
//!     RemoteSyncEngine,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> ferry_engine::Result<()> {
//! let registry = ModelRegistry::new(1).with_model(ModelSchema::new(
//!     "Post",
//!     vec![
//!         FieldDef::required("id", FieldType::String),
//!         FieldDef::required("title", FieldType::String),
//!     ],
//! ));
//!
//! let engine = RemoteSyncEngine::builder(registry)
//!     .remote(Arc::new(MemoryRemote::new()))
//!     .build()?;
//! engine.start()?;
//!
//! engine.save(Record::new("p-1", "Post", json!({"id": "p-1", "title": "Hello"})))?;
//! assert!(engine.query_by_id("Post", "p-1")?.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! [`MemoryStore::open`] backs the store with a JSON [`StoreSnapshot`] that is
//! rewritten atomically on every commit, so the outbox and sync metadata
//! survive process death.

pub mod condition;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod hub;
mod incoming;
pub mod ingest;
mod initial_sync;
pub mod mutation;
mod outgoing;
pub mod reconcile;
pub mod record;
pub mod remote;
pub mod schema;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use condition::{CompareOp, MutationCondition};
pub use config::{EngineConfig, ExponentialBackoff, RetryPolicy};
pub use conflict::{
    resolve_conflict, ConflictData, ConflictHandler, ConflictOutcome, ConflictPolicy,
    ConflictResolution,
};
pub use engine::{AfterCleanup, EngineAction, EngineBuilder, EngineState, RemoteSyncEngine};
pub use error::{Error, ErrorKind, Result};
pub use hub::{DropReason, EngineEvent, EventHub, SyncCounts};
pub use incoming::ReconciliationState;
pub use ingest::MutationIngester;
pub use initial_sync::{sync_since, ModelSyncResult};
pub use mutation::{MutationEvent, MutationType, Sequence};
pub use outgoing::OutgoingState;
pub use reconcile::{merge_disposition, reconcile_remote, Disposition};
pub use record::{Record, RemoteRecord, SyncMetadata};
pub use remote::{
    apply_remote_mutation, InvalidPageToken, MemoryRemote, MutationRequest, PageCursor, RemoteApi,
    RemoteError, Subscription, SubscriptionEvent, SubscriptionSink, SyncPage, SyncQuery,
};
pub use schema::{FieldDef, FieldType, ModelRegistry, ModelSchema};
pub use snapshot::{StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{LocalStore, MemoryStore, Transaction};

/// Type aliases for clarity
pub type RecordId = String;
pub type ModelName = String;
pub type Version = u64;
/// Milliseconds since the Unix epoch
pub type Timestamp = u64;
pub type SchemaVersion = u32;

/// Current wall-clock time as a [`Timestamp`].
pub fn current_timestamp() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
