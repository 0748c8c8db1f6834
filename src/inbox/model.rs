//! Inbox record model, per §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    Received,
    Processing,
    Processed,
    Failed,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Received => "received",
            InboxStatus::Processing => "processing",
            InboxStatus::Processed => "processed",
            InboxStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "received" => Some(InboxStatus::Received),
            "processing" => Some(InboxStatus::Processing),
            "processed" => Some(InboxStatus::Processed),
            "failed" => Some(InboxStatus::Failed),
            _ => None,
        }
    }
}

/// Deduplication key for an inbound message: either the producer's
/// `event_id`, or a `(stream, stream_seq)` pair when the message carries
/// no usable `event_id` header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    EventId(String),
    StreamSequence { stream: String, seq: u64 },
}

impl DedupKey {
    pub fn as_storage_key(&self) -> String {
        match self {
            DedupKey::EventId(id) => format!("event_id:{id}"),
            DedupKey::StreamSequence { stream, seq } => format!("seq:{stream}:{seq}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxRecord {
    pub id: i64,
    pub dedup_key: String,
    pub subject: String,
    pub payload: serde_json::Value,
    pub status: InboxStatus,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub processing_attempts: i32,
    pub stream: Option<String>,
    pub stream_seq: Option<i64>,
}

impl InboxRecord {
    pub fn already_processed(&self) -> bool {
        self.status == InboxStatus::Processed
    }
}
