//! Record persistence.
//!
//! [`RecordStore`] is the seam between the HTTP layer and storage. Postgres
//! ([`PgRecordStore`]) backs the deployed server; [`MemoryRecordStore`] backs
//! in-process servers and tests.

mod memory;
mod pool;
mod records;

pub use memory::MemoryRecordStore;
pub use pool::*;
pub use records::*;

use async_trait::async_trait;
use ferry_engine::{MutationRequest, PageCursor, RemoteRecord, Timestamp};

use crate::error::Result;

/// Outcome of an accepted mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// The authoritative copy after the mutation.
    pub record: RemoteRecord,
    /// False when the request replayed a mutation that had already landed.
    pub changed: bool,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, model: &str, record_id: &str) -> Result<Option<RemoteRecord>>;

    /// Records of `model` changed at or after `since`, ordered by
    /// `(last_changed_at, record_id)` and starting strictly after `after`.
    async fn page(
        &self,
        model: &str,
        since: Option<Timestamp>,
        after: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<RemoteRecord>>;

    /// Apply a version-conditioned mutation atomically.
    async fn mutate(&self, request: &MutationRequest, now: Timestamp) -> Result<Applied>;
}
