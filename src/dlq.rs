//! Dead-letter queue publication (§4.4/§6/§7), grounded in the base
//! crate's `DlqHandler`/`MemoryDlqHandler`/`should_dead_letter` (same
//! capacity-bounded in-memory shape, generalized to also publish to the
//! real fixed DLQ subject via JetStream instead of only logging).

use crate::connection::SharedSupervisor;
use crate::error::DlqError;
use crate::subject::Subject;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::RwLock;

/// Everything the DLQ payload needs, assembled by the message processor
/// before handing off to a `DlqPublisher`.
#[derive(Debug, Clone)]
pub struct DlqContext {
    pub original_envelope: Option<serde_json::Value>,
    pub raw_payload: Vec<u8>,
    pub consumer_name: String,
    pub delivery_count: u64,
    pub error_class: String,
    pub error_message: String,
}

/// Wire shape published to the DLQ subject, per §6: original envelope (or
/// raw bytes if it couldn't be parsed) plus consumer/error/timing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_envelope: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_payload_base64: Option<String>,
    pub consumer_name: String,
    pub delivery_count: u64,
    pub error_class: String,
    pub error_message: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl From<DlqContext> for DeadLetterPayload {
    fn from(ctx: DlqContext) -> Self {
        let raw_payload_base64 = if ctx.original_envelope.is_none() {
            Some(base64_encode(&ctx.raw_payload))
        } else {
            None
        };
        Self {
            original_envelope: ctx.original_envelope,
            raw_payload_base64,
            consumer_name: ctx.consumer_name,
            delivery_count: ctx.delivery_count,
            error_class: ctx.error_class,
            error_message: ctx.error_message,
            dead_lettered_at: Utc::now(),
        }
    }
}

// Dependency-free base64 so an unparsable raw payload doesn't need the
// `base64` crate pulled in for one call site.
fn base64_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        out.push(ALPHABET[(b0 >> 2) as usize] as char);
        out.push(ALPHABET[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(((b1 & 0x0f) << 2) | (b2 >> 6)) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[(b2 & 0x3f) as usize] as char
        } else {
            '='
        });
    }
    out
}

/// Publishes dead-lettered messages somewhere durable.
#[async_trait]
pub trait DlqPublisher: Send + Sync {
    async fn publish(&self, ctx: DlqContext) -> Result<(), DlqError>;
}

/// Publishes to the fixed per-app DLQ subject via JetStream.
pub struct NatsDlqPublisher {
    connection: SharedSupervisor,
    subject: Subject,
}

impl NatsDlqPublisher {
    pub fn new(connection: SharedSupervisor, subject: Subject) -> Self {
        Self { connection, subject }
    }
}

#[async_trait]
impl DlqPublisher for NatsDlqPublisher {
    async fn publish(&self, ctx: DlqContext) -> Result<(), DlqError> {
        let payload: DeadLetterPayload = ctx.into();
        let bytes = serde_json::to_vec(&payload).map_err(|e| DlqError {
            subject: self.subject.as_str().to_string(),
            reason: e.to_string(),
        })?;

        let jetstream = self
            .connection
            .jetstream_context()
            .await
            .map_err(|e| DlqError {
                subject: self.subject.as_str().to_string(),
                reason: e.to_string(),
            })?;

        jetstream
            .publish(self.subject.as_str().to_string(), bytes.into())
            .await
            .map_err(|e| DlqError {
                subject: self.subject.as_str().to_string(),
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| DlqError {
                subject: self.subject.as_str().to_string(),
                reason: format!("DLQ publish ack failed: {e}"),
            })?;

        Ok(())
    }
}

/// Capacity-bounded in-memory DLQ, for tests and for apps running with
/// `use_dlq = true` but no durable backend configured.
pub struct MemoryDlqHandler {
    entries: RwLock<VecDeque<DeadLetterPayload>>,
    capacity: usize,
}

impl MemoryDlqHandler {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn count(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Most-recently dead-lettered first.
    pub fn list(&self) -> Vec<DeadLetterPayload> {
        self.entries.read().unwrap().iter().rev().cloned().collect()
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqPublisher for MemoryDlqHandler {
    async fn publish(&self, ctx: DlqContext) -> Result<(), DlqError> {
        let payload: DeadLetterPayload = ctx.into();
        let mut entries = self.entries.write().unwrap();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(payload);
        Ok(())
    }
}

/// Whether a message has exhausted its delivery budget and should be
/// dead-lettered rather than redelivered again. `max_deliver == 0` means
/// unlimited redelivery.
pub fn should_dead_letter(deliveries: u64, max_deliver: u32) -> bool {
    max_deliver > 0 && deliveries >= max_deliver as u64
}
