//! The event envelope: the wire format carried on every subject.
//!
//! An `Event` is deeply frozen once constructed — there are no setters, only
//! a constructor and field accessors — and its equality is defined solely on
//! `event_id`, matching the deduplication semantics the rest of the bridge
//! relies on (two envelopes with the same id are the same event even if a
//! field like `occurred_at` differs due to clock skew on retransmit).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const SCHEMA_VERSION: u32 = 1;

/// An immutable event envelope, constructed once and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub schema_version: u32,
    pub event_id: String,
    pub event_type: String,
    pub producer: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,

    pub occurred_at: DateTime<Utc>,
    pub trace_id: String,
    pub payload: Value,
}

/// Fields accepted when building a new event. `event_id`, `trace_id`, and
/// `occurred_at` are optional — omitted values are generated.
#[derive(Debug, Clone, Default)]
pub struct EventBuilder {
    pub event_id: Option<String>,
    pub event_type: String,
    pub producer: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub trace_id: Option<String>,
    pub payload: Value,
}

impl Event {
    /// Construct a fresh envelope, generating `event_id`/`trace_id`/
    /// `occurred_at` when the builder omits them.
    pub fn new(builder: EventBuilder) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            event_id: builder
                .event_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            event_type: builder.event_type,
            producer: builder.producer,
            resource_type: builder.resource_type.filter(|s| !s.is_empty()),
            resource_id: builder.resource_id.filter(|s| !s.is_empty()),
            occurred_at: builder.occurred_at.unwrap_or_else(Utc::now),
            trace_id: builder
                .trace_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            payload: builder.payload,
        }
    }

    /// Serialize to the wire JSON representation.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the wire JSON representation. Missing
    /// `event_id`/`trace_id`/`occurred_at` are backfilled the same way
    /// `new` backfills them, so older producers that omit them still
    /// round-trip into a usable envelope.
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            schema_version: Option<u32>,
            #[serde(default)]
            event_id: Option<String>,
            event_type: String,
            producer: String,
            #[serde(default)]
            resource_type: Option<String>,
            #[serde(default)]
            resource_id: Option<String>,
            #[serde(default)]
            occurred_at: Option<DateTime<Utc>>,
            #[serde(default)]
            trace_id: Option<String>,
            #[serde(default)]
            payload: Value,
        }
        let raw: Raw = serde_json::from_slice(bytes)?;
        Ok(Self {
            schema_version: raw.schema_version.unwrap_or(SCHEMA_VERSION),
            event_id: raw.event_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            event_type: raw.event_type,
            producer: raw.producer,
            resource_type: raw.resource_type,
            resource_id: raw.resource_id,
            occurred_at: raw.occurred_at.unwrap_or_else(Utc::now),
            trace_id: raw.trace_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            payload: raw.payload,
        })
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
    }
}

impl Eq for Event {}
