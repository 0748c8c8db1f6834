//! Inbox persistence, grounded in `proerror77-Nova`'s `IdempotencyGuard`
//! (atomic check-and-process via `INSERT ... ON CONFLICT DO NOTHING`),
//! extended with the richer `received -> processing -> {processed|failed}`
//! lifecycle §3 requires instead of Nova's simple processed/not-processed.

use super::model::{DedupKey, InboxRecord, InboxStatus};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Insert a new `received` row for `key` if one doesn't exist yet, or
    /// return the existing row unchanged. Callers check
    /// `InboxRecord::already_processed()` on the result to decide whether
    /// to short-circuit.
    async fn find_or_build(
        &self,
        key: &DedupKey,
        subject: &str,
        payload: &serde_json::Value,
        stream: Option<&str>,
        stream_seq: Option<i64>,
    ) -> StoreResult<InboxRecord>;

    /// `received|failed -> processing`, attempts += 1.
    async fn persist_pre(&self, id: i64) -> StoreResult<()>;

    /// `processing -> processed`, `processed_at = now`.
    async fn persist_post(&self, id: i64) -> StoreResult<()>;

    /// `processing -> failed`, records `last_error`.
    async fn persist_failure(&self, id: i64, error: &str) -> StoreResult<()>;
}

pub struct SqlxInboxStore {
    pool: PgPool,
}

impl SqlxInboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InboxStore for SqlxInboxStore {
    async fn find_or_build(
        &self,
        key: &DedupKey,
        subject: &str,
        payload: &serde_json::Value,
        stream: Option<&str>,
        stream_seq: Option<i64>,
    ) -> StoreResult<InboxRecord> {
        let dedup_key = key.as_storage_key();

        let inserted = sqlx::query(
            r#"
            INSERT INTO inbox
                (dedup_key, subject, payload, status, received_at, processing_attempts, stream, stream_seq)
            VALUES ($1, $2, $3, 'received', now(), 0, $4, $5)
            ON CONFLICT (dedup_key) DO NOTHING
            RETURNING id, dedup_key, subject, payload, status, received_at, processed_at,
                      last_error, processing_attempts, stream, stream_seq
            "#,
        )
        .bind(&dedup_key)
        .bind(subject)
        .bind(payload)
        .bind(stream)
        .bind(stream_seq)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return row_to_record(&row);
        }

        let existing = sqlx::query(
            r#"
            SELECT id, dedup_key, subject, payload, status, received_at, processed_at,
                   last_error, processing_attempts, stream, stream_seq
            FROM inbox WHERE dedup_key = $1
            "#,
        )
        .bind(&dedup_key)
        .fetch_one(&self.pool)
        .await?;

        row_to_record(&existing)
    }

    async fn persist_pre(&self, id: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE inbox SET status = 'processing', processing_attempts = processing_attempts + 1 WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_post(&self, id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE inbox SET status = 'processed', processed_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn persist_failure(&self, id: i64, error: &str) -> StoreResult<()> {
        sqlx::query("UPDATE inbox SET status = 'failed', last_error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> StoreResult<InboxRecord> {
    let status_str: String = row.try_get("status")?;
    let status = InboxStatus::from_str(&status_str)
        .ok_or_else(|| StoreError::Other(format!("unknown inbox status '{status_str}'")))?;
    Ok(InboxRecord {
        id: row.try_get("id")?,
        dedup_key: row.try_get("dedup_key")?,
        subject: row.try_get("subject")?,
        payload: row.try_get("payload")?,
        status,
        received_at: row.try_get("received_at")?,
        processed_at: row.try_get("processed_at")?,
        last_error: row.try_get("last_error")?,
        processing_attempts: row.try_get("processing_attempts")?,
        stream: row.try_get("stream")?,
        stream_seq: row.try_get("stream_seq")?,
    })
}

/// In-memory inbox for tests and for embedding apps that run without a
/// database (`use_inbox = false` bypasses this entirely).
#[derive(Default)]
pub struct MemoryInboxStore {
    records: Mutex<Vec<InboxRecord>>,
    next_id: AtomicI64,
}

impl MemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<InboxRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl InboxStore for MemoryInboxStore {
    async fn find_or_build(
        &self,
        key: &DedupKey,
        subject: &str,
        payload: &serde_json::Value,
        stream: Option<&str>,
        stream_seq: Option<i64>,
    ) -> StoreResult<InboxRecord> {
        let dedup_key = key.as_storage_key();
        let mut records = self.records.lock().unwrap();
        if let Some(existing) = records.iter().find(|r| r.dedup_key == dedup_key) {
            return Ok(existing.clone());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let row = InboxRecord {
            id,
            dedup_key,
            subject: subject.to_string(),
            payload: payload.clone(),
            status: InboxStatus::Received,
            received_at: Utc::now(),
            processed_at: None,
            last_error: None,
            processing_attempts: 0,
            stream: stream.map(str::to_string),
            stream_seq,
        };
        records.push(row.clone());
        Ok(row)
    }

    async fn persist_pre(&self, id: i64) -> StoreResult<()> {
        let mut records = self.records.lock().unwrap();
        let row = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row.status = InboxStatus::Processing;
        row.processing_attempts += 1;
        Ok(())
    }

    async fn persist_post(&self, id: i64) -> StoreResult<()> {
        let mut records = self.records.lock().unwrap();
        let row = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row.status = InboxStatus::Processed;
        row.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn persist_failure(&self, id: i64, error: &str) -> StoreResult<()> {
        let mut records = self.records.lock().unwrap();
        let row = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row.status = InboxStatus::Failed;
        row.last_error = Some(error.to_string());
        Ok(())
    }
}
