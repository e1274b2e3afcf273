//! Postgres-backed record store.

use async_trait::async_trait;
use ferry_engine::{
    apply_remote_mutation, MutationRequest, PageCursor, Record, RemoteRecord, Timestamp,
};
use sqlx::{PgConnection, PgPool, Row};

use super::{Applied, RecordStore};
use crate::error::{AppError, Result};

/// A stored record row from the database.
#[derive(Debug)]
pub struct StoredRecord {
    pub model: String,
    pub record_id: String,
    pub version: i64,
    pub payload: serde_json::Value,
    pub deleted: bool,
    pub last_changed_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(StoredRecord {
            model: row.try_get("model")?,
            record_id: row.try_get("record_id")?,
            version: row.try_get("version")?,
            payload: row.try_get("payload")?,
            deleted: row.try_get("deleted")?,
            last_changed_at: row.try_get("last_changed_at")?,
        })
    }
}

impl StoredRecord {
    pub fn into_remote(self) -> Result<RemoteRecord> {
        Ok(RemoteRecord {
            version: from_column("version", self.version)?,
            last_changed_at: from_column("last_changed_at", self.last_changed_at)?,
            record: Record::new(self.record_id, self.model, self.payload),
            deleted: self.deleted,
        })
    }
}

fn from_column(column: &str, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| AppError::Internal(format!("negative {column} in records table: {value}")))
}

fn to_column(column: &str, value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| AppError::Internal(format!("{column} {value} does not fit a BIGINT")))
}

/// Client-supplied bound, so out of range is the caller's fault.
fn bound(name: &str, value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| AppError::BadRequest(format!("{name} out of range: {value}")))
}

const COLUMNS: &str = "model, record_id, version, payload, deleted, last_changed_at";

async fn lock_record(
    conn: &mut PgConnection,
    model: &str,
    record_id: &str,
) -> std::result::Result<Option<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(&format!(
        "SELECT {COLUMNS} FROM records WHERE model = $1 AND record_id = $2 FOR UPDATE"
    ))
    .bind(model)
    .bind(record_id)
    .fetch_optional(conn)
    .await
}

/// Insert a new row. Returns false if another writer created it first.
async fn insert_record(conn: &mut PgConnection, record: &RemoteRecord) -> Result<bool> {
    let version = to_column("version", record.version)?;
    let last_changed_at = to_column("last_changed_at", record.last_changed_at)?;
    let result = sqlx::query(
        r#"
        INSERT INTO records (model, record_id, version, payload, deleted, last_changed_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (model, record_id) DO NOTHING
        "#,
    )
    .bind(&record.record.model)
    .bind(&record.record.id)
    .bind(version)
    .bind(&record.record.payload)
    .bind(record.deleted)
    .bind(last_changed_at)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

async fn update_record(conn: &mut PgConnection, record: &RemoteRecord) -> Result<()> {
    let version = to_column("version", record.version)?;
    let last_changed_at = to_column("last_changed_at", record.last_changed_at)?;
    sqlx::query(
        r#"
        UPDATE records
        SET version = $3, payload = $4, deleted = $5, last_changed_at = $6
        WHERE model = $1 AND record_id = $2
        "#,
    )
    .bind(&record.record.model)
    .bind(&record.record.id)
    .bind(version)
    .bind(&record.record.payload)
    .bind(record.deleted)
    .bind(last_changed_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// Record store over the `records` table.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get(&self, model: &str, record_id: &str) -> Result<Option<RemoteRecord>> {
        let row = sqlx::query_as::<_, StoredRecord>(&format!(
            "SELECT {COLUMNS} FROM records WHERE model = $1 AND record_id = $2"
        ))
        .bind(model)
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredRecord::into_remote).transpose()
    }

    async fn page(
        &self,
        model: &str,
        since: Option<Timestamp>,
        after: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<RemoteRecord>> {
        let since = since.map(|s| bound("lastSync", s)).transpose()?;
        let after_changed = after
            .map(|c| bound("nextToken", c.last_changed_at))
            .transpose()?;
        let rows = sqlx::query_as::<_, StoredRecord>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM records
            WHERE model = $1
              AND ($2::BIGINT IS NULL OR last_changed_at >= $2)
              AND ($3::BIGINT IS NULL OR (last_changed_at, record_id) > ($3, $4::TEXT))
            ORDER BY last_changed_at, record_id
            LIMIT $5
            "#
        ))
        .bind(model)
        .bind(since)
        .bind(after_changed)
        .bind(after.map(|c| c.record_id.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredRecord::into_remote).collect()
    }

    async fn mutate(&self, request: &MutationRequest, now: Timestamp) -> Result<Applied> {
        let mut tx = self.pool.begin().await?;

        let current = lock_record(&mut *tx, &request.model, &request.record.id)
            .await?
            .map(StoredRecord::into_remote)
            .transpose()?;
        let record = apply_remote_mutation(current.as_ref(), request, now)?;
        let changed = current.as_ref() != Some(&record);

        if changed {
            match current {
                Some(_) => update_record(&mut *tx, &record).await?,
                None => {
                    if !insert_record(&mut *tx, &record).await? {
                        // Lost a create race; report the winner as a conflict.
                        tx.rollback().await?;
                        let winner = self
                            .get(&request.model, &request.record.id)
                            .await?
                            .ok_or_else(|| AppError::Internal("created row vanished".into()))?;
                        return Err(ferry_engine::RemoteError::ConflictUnhandled(Box::new(
                            winner,
                        ))
                        .into());
                    }
                }
            }
        }

        tx.commit().await?;

        tracing::debug!(
            model = %record.record.model,
            id = %record.record.id,
            version = record.version,
            changed,
            "Applied mutation"
        );

        Ok(Applied { record, changed })
    }
}
