//! Outbox record model, per §3.

use crate::envelope::Event;
use crate::subject::Subject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Publishing,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Publishing => "publishing",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "publishing" => Some(OutboxStatus::Publishing),
            "sent" => Some(OutboxStatus::Sent),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// A row of the outbox table. `payload` holds the fully-built envelope as
/// it will be published — the envelope is frozen at enqueue time, the
/// outbox row just durably records it alongside bookkeeping columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: i64,
    pub event_id: String,
    pub subject: String,
    pub payload: serde_json::Value,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub event_type: String,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Staleness per §3: pending and older than `max_age` (default 1h).
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        self.status == OutboxStatus::Pending && now - self.enqueued_at > max_age
    }
}

pub const DEFAULT_STALE_AGE_SECS: i64 = 3600;

/// Fields required to enqueue a new outbox row.
#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub event_id: String,
    pub subject: String,
    pub payload: serde_json::Value,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub event_type: String,
}

impl NewOutboxRecord {
    /// Build an outbox insert from a frozen envelope and its destination
    /// subject. The envelope's serialized form becomes the row's payload
    /// column, so publishing later is a pure re-send of exactly what was
    /// recorded in the same transaction as the business write.
    pub fn from_event(event: &Event, subject: &Subject) -> serde_json::Result<Self> {
        Ok(Self {
            event_id: event.event_id.clone(),
            subject: subject.as_str().to_string(),
            payload: serde_json::to_value(event)?,
            resource_type: event.resource_type.clone(),
            resource_id: event.resource_id.clone(),
            event_type: event.event_type.clone(),
        })
    }
}

/// Explicit replacement for `skip_publish`, per §9: only a `Local` write
/// enqueues an outbox row. `Inbound` marks a write performed as the effect
/// of applying an event received from the peer, which must not be
/// re-published (that would create a publish cycle between the two apps).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOrigin {
    Local,
    Inbound,
}

impl ApplyOrigin {
    pub fn enqueues_outbox(&self) -> bool {
        matches!(self, ApplyOrigin::Local)
    }
}
