//! Outbox publisher pipeline (§4.3), grounded in the base crate's
//! `NatsClient::publish_with_options` (header handling, ack await) and
//! `proerror77-Nova`'s `OutboxProcessor` (claim-batch, backoff-then-retry
//! poll loop shape).

use super::model::OutboxRecord;
use super::store::OutboxStore;
use crate::backoff::RetryPolicy;
use crate::connection::SharedSupervisor;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Result of a single publish attempt, matching §4.3's immutable result
/// shape. `to_json` is this type's "to_hash": a plain serializable view
/// with the error rendered as a message string.
#[derive(Debug, Clone, Serialize)]
pub struct PublishResult {
    pub success: bool,
    pub event_id: String,
    pub subject: String,
    pub duplicate: bool,
    pub error: Option<String>,
}

impl PublishResult {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("PublishResult always serializes")
    }
}

/// Summary of one drain of the outbox.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishBatchSummary {
    pub attempted: usize,
    pub sent: usize,
    pub duplicate: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct Publisher<S: OutboxStore> {
    connection: SharedSupervisor,
    store: Arc<S>,
    retry_policy: Box<dyn RetryPolicy>,
    batch_size: i64,
}

impl<S: OutboxStore> Publisher<S> {
    pub fn new(
        connection: SharedSupervisor,
        store: Arc<S>,
        retry_policy: Box<dyn RetryPolicy>,
        batch_size: i64,
    ) -> Self {
        Self {
            connection,
            store,
            retry_policy,
            batch_size,
        }
    }

    /// Claim and publish one batch. Never returns an error for individual
    /// publish failures — those are recorded per-record in the summary and
    /// in the store; only a connection-level failure to even reach
    /// JetStream propagates.
    pub async fn run_once(&self) -> crate::error::ConnectionResult<PublishBatchSummary> {
        let batch = match self.store.claim_batch(self.batch_size).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "failed to claim outbox batch");
                return Ok(PublishBatchSummary::default());
            }
        };

        let mut summary = PublishBatchSummary {
            attempted: batch.len(),
            ..Default::default()
        };

        for record in batch {
            match self.publish_one(record).await {
                Outcome::Sent => summary.sent += 1,
                Outcome::Duplicate => summary.duplicate += 1,
                Outcome::RetriedLater => summary.retried += 1,
                Outcome::Failed => summary.failed += 1,
            }
        }

        Ok(summary)
    }

    async fn publish_one(&self, record: OutboxRecord) -> Outcome {
        let jetstream = match self.connection.jetstream_context().await {
            Ok(js) => js,
            Err(e) => {
                tracing::warn!(event_id = %record.event_id, error = %e, "no JetStream context, leaving record publishing for next cycle");
                return Outcome::RetriedLater;
            }
        };

        let payload = match serde_json::to_vec(&record.payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = self
                    .store
                    .mark_failed(&record.event_id, &format!("payload serialization failed: {e}"))
                    .await;
                return Outcome::Failed;
            }
        };

        let mut headers = async_nats::HeaderMap::new();
        headers.insert("nats-msg-id", record.event_id.as_str());

        let publish = jetstream
            .publish_with_headers(record.subject.clone(), headers, payload.into())
            .await;

        let ack_future = match publish {
            Ok(f) => f,
            Err(e) => return self.handle_publish_failure(&record, &e.to_string()).await,
        };

        match ack_future.await {
            Ok(ack) => {
                tracing::debug!(
                    event_id = %record.event_id,
                    subject = %record.subject,
                    duplicate = ack.duplicate,
                    "published outbox record"
                );
                let _ = self.store.mark_sent(&record.event_id).await;
                if ack.duplicate {
                    Outcome::Duplicate
                } else {
                    Outcome::Sent
                }
            }
            Err(e) => self.handle_publish_failure(&record, &e.to_string()).await,
        }
    }

    async fn handle_publish_failure(&self, record: &OutboxRecord, reason: &str) -> Outcome {
        if !is_transient(reason) {
            let _ = self.store.mark_failed(&record.event_id, reason).await;
            tracing::error!(event_id = %record.event_id, reason, "terminal publish error");
            return Outcome::Failed;
        }

        if record.attempts as u32 >= self.retry_policy.max_attempts() {
            let exhausted = crate::error::RetryExhausted {
                attempts: record.attempts as u32,
                original_error: reason.to_string(),
            };
            let _ = self.store.mark_failed(&record.event_id, &exhausted.to_string()).await;
            tracing::error!(event_id = %record.event_id, %exhausted, "retries exhausted");
            return Outcome::Failed;
        }

        let delay = self.retry_policy.delay(record.attempts as u32);
        tracing::warn!(event_id = %record.event_id, ?delay, reason, "transient publish failure, backing off");
        tokio::time::sleep(delay).await;
        let _ = self.store.reset_to_pending(&record.event_id).await;
        Outcome::RetriedLater
    }
}

enum Outcome {
    Sent,
    Duplicate,
    RetriedLater,
    Failed,
}

fn is_transient(reason: &str) -> bool {
    const TRANSIENT_MARKERS: &[&str] = &[
        "timeout", "timed out", "no responders", "overloaded", "slow consumer",
        "connection", "disconnected",
    ];
    let lower = reason.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Reset every row that's been `pending` longer than `max_age` back to
/// `pending` with `attempts` zeroed, so a row that's been sitting unclaimed
/// (no publisher loop running, or one that crashed before claiming its
/// batch) gets a fresh shot instead of aging out silently. Not part of
/// `OutboxStore` because it's a maintenance sweep, not part of the core
/// claim/publish cycle.
pub async fn reclaim_stale<S: OutboxStore>(store: &S, max_age: Duration) -> usize {
    match store.stale(max_age.as_secs() as i64).await {
        Ok(rows) => {
            let mut n = 0;
            for row in rows {
                if store.reset_to_pending(&row.event_id).await.is_ok() {
                    n += 1;
                }
            }
            n
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to scan for stale outbox records");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_vs_terminal_errors() {
        assert!(is_transient("request timed out"));
        assert!(is_transient("no responders available for request"));
        assert!(!is_transient("maximum payload size exceeded"));
        assert!(!is_transient("permission violation"));
    }

    #[test]
    fn publish_result_to_json_renders_error_as_message_string() {
        let result = PublishResult {
            success: false,
            event_id: "evt-1".into(),
            subject: "prod.billing.sync.crm".into(),
            duplicate: false,
            error: Some("boom".into()),
        };
        let json = result.to_json();
        assert_eq!(json["error"], "boom");
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn reclaim_stale_resets_aged_pending_rows() {
        use super::super::model::{NewOutboxRecord, OutboxStatus};
        use super::super::store::MemoryOutboxStore;

        let store = MemoryOutboxStore::new();
        store
            .insert(NewOutboxRecord {
                event_id: "evt-1".into(),
                subject: "prod.billing.sync.crm".into(),
                payload: serde_json::json!({}),
                resource_type: None,
                resource_id: None,
                event_type: "order.created".into(),
            })
            .unwrap();

        // A zero-second threshold makes any already-enqueued row eligible
        // as soon as any time at all has elapsed.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reset = reclaim_stale(&store, Duration::from_secs(0)).await;
        assert_eq!(reset, 1);

        let row = store.snapshot().into_iter().next().unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempts, 0);
    }
}
