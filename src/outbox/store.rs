//! Outbox persistence, grounded in
//! `proerror77-Nova`'s `transactional-outbox` repository (raw `sqlx`
//! queries over a typed row, not dynamic column probing, per §9).

use super::model::{NewOutboxRecord, OutboxRecord, OutboxStatus};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Row, Transaction};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Batch claim + status transitions. Insertion is intentionally not part
/// of this trait — it must share the caller's own business-write
/// transaction, which ties its exact signature to the concrete backend
/// (see `SqlxOutboxStore::insert`/`MemoryOutboxStore::insert`).
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically claim up to `limit` pending rows, ordered by
    /// `(enqueued_at ASC, id ASC)`, flipping them to `publishing` and
    /// incrementing `attempts`.
    async fn claim_batch(&self, limit: i64) -> StoreResult<Vec<OutboxRecord>>;

    async fn mark_sent(&self, event_id: &str) -> StoreResult<()>;

    async fn mark_failed(&self, event_id: &str, error: &str) -> StoreResult<()>;

    /// Operator/retry action: failed -> pending, attempts reset to 0.
    async fn reset_to_pending(&self, event_id: &str) -> StoreResult<()>;

    async fn stale(&self, max_age_secs: i64) -> StoreResult<Vec<OutboxRecord>>;
}

pub struct SqlxOutboxStore {
    pool: PgPool,
}

impl SqlxOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert within the caller's own transaction, so the business write
    /// and the outbox row commit or roll back together.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: NewOutboxRecord,
    ) -> StoreResult<OutboxRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO outbox
                (event_id, subject, payload, resource_type, resource_id, event_type,
                 status, attempts, enqueued_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, now())
            ON CONFLICT (event_id) DO UPDATE SET event_id = outbox.event_id
            RETURNING id, event_id, subject, payload, resource_type, resource_id,
                      event_type, status, attempts, last_error, enqueued_at, sent_at
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.subject)
        .bind(&record.payload)
        .bind(&record.resource_type)
        .bind(&record.resource_id)
        .bind(&record.event_type)
        .fetch_one(&mut **tx)
        .await?;

        row_to_record(&row)
    }
}

#[async_trait]
impl OutboxStore for SqlxOutboxStore {
    async fn claim_batch(&self, limit: i64) -> StoreResult<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'publishing', attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM outbox
                WHERE status = 'pending'
                ORDER BY enqueued_at ASC, id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, event_id, subject, payload, resource_type, resource_id,
                      event_type, status, attempts, last_error, enqueued_at, sent_at
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn mark_sent(&self, event_id: &str) -> StoreResult<()> {
        sqlx::query("UPDATE outbox SET status = 'sent', sent_at = now() WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, event_id: &str, error: &str) -> StoreResult<()> {
        sqlx::query("UPDATE outbox SET status = 'failed', last_error = $2 WHERE event_id = $1")
            .bind(event_id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_to_pending(&self, event_id: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE outbox SET status = 'pending', attempts = 0 WHERE event_id = $1",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stale(&self, max_age_secs: i64) -> StoreResult<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, subject, payload, resource_type, resource_id,
                   event_type, status, attempts, last_error, enqueued_at, sent_at
            FROM outbox
            WHERE status = 'pending' AND enqueued_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(max_age_secs as f64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> StoreResult<OutboxRecord> {
    let status_str: String = row.try_get("status")?;
    let status = OutboxStatus::from_str(&status_str)
        .ok_or_else(|| StoreError::Other(format!("unknown outbox status '{status_str}'")))?;
    Ok(OutboxRecord {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        subject: row.try_get("subject")?,
        payload: row.try_get("payload")?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        event_type: row.try_get("event_type")?,
        status,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        enqueued_at: row.try_get("enqueued_at")?,
        sent_at: row.try_get("sent_at")?,
    })
}

/// In-memory outbox, used by unit/integration tests and the bench suite so
/// the full outbox/publisher pipeline can be exercised without a database.
#[derive(Default)]
pub struct MemoryOutboxStore {
    records: Mutex<Vec<OutboxRecord>>,
    next_id: AtomicI64,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: NewOutboxRecord) -> StoreResult<OutboxRecord> {
        let mut records = self.records.lock().unwrap();
        if let Some(existing) = records.iter().find(|r| r.event_id == record.event_id) {
            return Ok(existing.clone());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let row = OutboxRecord {
            id,
            event_id: record.event_id,
            subject: record.subject,
            payload: record.payload,
            resource_type: record.resource_type,
            resource_id: record.resource_id,
            event_type: record.event_type,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            enqueued_at: Utc::now(),
            sent_at: None,
        };
        records.push(row.clone());
        Ok(row)
    }

    pub fn snapshot(&self) -> Vec<OutboxRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn claim_batch(&self, limit: i64) -> StoreResult<Vec<OutboxRecord>> {
        let mut records = self.records.lock().unwrap();
        let mut sorted: Vec<usize> = (0..records.len())
            .filter(|&i| records[i].status == OutboxStatus::Pending)
            .collect();
        sorted.sort_by_key(|&i| (records[i].enqueued_at, records[i].id));

        let mut claimed = Vec::new();
        for idx in sorted.into_iter().take(limit.max(0) as usize) {
            records[idx].status = OutboxStatus::Publishing;
            records[idx].attempts += 1;
            claimed.push(records[idx].clone());
        }
        Ok(claimed)
    }

    async fn mark_sent(&self, event_id: &str) -> StoreResult<()> {
        let mut records = self.records.lock().unwrap();
        if let Some(r) = records.iter_mut().find(|r| r.event_id == event_id) {
            r.status = OutboxStatus::Sent;
            r.sent_at = Some(Utc::now());
            Ok(())
        } else {
            Err(StoreError::NotFound(event_id.to_string()))
        }
    }

    async fn mark_failed(&self, event_id: &str, error: &str) -> StoreResult<()> {
        let mut records = self.records.lock().unwrap();
        if let Some(r) = records.iter_mut().find(|r| r.event_id == event_id) {
            r.status = OutboxStatus::Failed;
            r.last_error = Some(error.to_string());
            Ok(())
        } else {
            Err(StoreError::NotFound(event_id.to_string()))
        }
    }

    async fn reset_to_pending(&self, event_id: &str) -> StoreResult<()> {
        let mut records = self.records.lock().unwrap();
        if let Some(r) = records.iter_mut().find(|r| r.event_id == event_id) {
            r.status = OutboxStatus::Pending;
            r.attempts = 0;
            Ok(())
        } else {
            Err(StoreError::NotFound(event_id.to_string()))
        }
    }

    async fn stale(&self, max_age_secs: i64) -> StoreResult<Vec<OutboxRecord>> {
        let records = self.records.lock().unwrap();
        let now = Utc::now();
        let max_age = ChronoDuration::seconds(max_age_secs);
        Ok(records
            .iter()
            .filter(|r| r.is_stale(now, max_age))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::model::NewOutboxRecord;

    fn new_record(event_id: &str) -> NewOutboxRecord {
        NewOutboxRecord {
            event_id: event_id.to_string(),
            subject: "prod.billing.sync.crm".into(),
            payload: serde_json::json!({"event_id": event_id}),
            resource_type: Some("order".into()),
            resource_id: Some("ord-1".into()),
            event_type: "order.created".into(),
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent_on_event_id() {
        let store = MemoryOutboxStore::new();
        let a = store.insert(new_record("evt-1")).unwrap();
        let b = store.insert(new_record("evt-1")).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn claim_batch_orders_by_enqueued_at_then_id_and_flips_status() {
        let store = MemoryOutboxStore::new();
        store.insert(new_record("evt-1")).unwrap();
        store.insert(new_record("evt-2")).unwrap();

        let claimed = store.claim_batch(10).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].event_id, "evt-1");
        assert_eq!(claimed[0].status, OutboxStatus::Publishing);
        assert_eq!(claimed[0].attempts, 1);
    }

    #[tokio::test]
    async fn claim_batch_does_not_reclaim_already_publishing_rows() {
        let store = MemoryOutboxStore::new();
        store.insert(new_record("evt-1")).unwrap();
        store.claim_batch(10).await.unwrap();
        let second = store.claim_batch(10).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn mark_sent_and_mark_failed_transition_status() {
        let store = MemoryOutboxStore::new();
        store.insert(new_record("evt-1")).unwrap();
        store.claim_batch(10).await.unwrap();
        store.mark_sent("evt-1").await.unwrap();
        assert_eq!(store.snapshot()[0].status, OutboxStatus::Sent);

        store.insert(new_record("evt-2")).unwrap();
        store.claim_batch(10).await.unwrap();
        store.mark_failed("evt-2", "boom").await.unwrap();
        let row = store.snapshot().into_iter().find(|r| r.event_id == "evt-2").unwrap();
        assert_eq!(row.status, OutboxStatus::Failed);
        assert_eq!(row.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn reset_to_pending_zeroes_attempts() {
        let store = MemoryOutboxStore::new();
        store.insert(new_record("evt-1")).unwrap();
        store.claim_batch(10).await.unwrap();
        store.mark_failed("evt-1", "boom").await.unwrap();
        store.reset_to_pending("evt-1").await.unwrap();
        let row = store.snapshot().remove(0);
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempts, 0);
    }
}
