//! # jetstream-bridge
//!
//! A reliability bridge between an application's own database and a NATS
//! JetStream message bus: a transactional outbox publishes local writes at
//! least once, a subscription manager keeps durable consumers reconciled
//! against their desired configuration, a message processor turns delivery
//! into ack/nak/DLQ decisions, and an inbox applies an inbound event's
//! effects at most once per `event_id`.
//!
//! ## Quick start
//!
//! ```no_run
//! use jetstream_bridge::{Config, ConnectionSupervisor};
//! use std::sync::Arc;
//!
//! # async fn example() -> jetstream_bridge::Result<()> {
//! let config = Config {
//!     app_name: "billing".into(),
//!     destination_app: "crm".into(),
//!     stream_name: "SYNC_BILLING".into(),
//!     ..Default::default()
//! };
//! config.validate()?;
//!
//! let connection = Arc::new(ConnectionSupervisor::new(config.nats_urls.clone())?);
//! connection.connect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`config`] — bridge configuration, presets, validation
//! - [`connection`] — connection supervisor and health checks
//! - [`topology`] — stream/consumer provisioning and reconciliation
//! - [`envelope`] — the wire-format event envelope
//! - [`subject`] — subject grammar and validated builders
//! - [`backoff`] — publish retry and redelivery backoff policies
//! - [`outbox`] — transactional outbox model, store, and publisher
//! - [`inbox`] — idempotent inbox model, store, and processor
//! - [`handler`] / [`middleware`] — the handler contract and its pipeline
//! - [`processor`] — per-message ack/nak/DLQ decision
//! - [`runtime`] — the consumer fetch/process/ack loop
//! - [`dlq`] — dead-letter queue publication

pub mod backoff;
pub mod config;
pub mod connection;
pub mod dlq;
pub mod duration;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod inbox;
pub mod middleware;
pub mod outbox;
pub mod processor;
pub mod runtime;
pub mod subject;
pub mod topology;

pub use backoff::{BackoffStrategy, Classify, ExponentialBackoff, LinearBackoff, RetryPolicy};
pub use config::{Config, ConsumerMode};
pub use connection::{ConnectionState, ConnectionSupervisor, SharedSupervisor};
pub use dlq::{DeadLetterPayload, DlqContext, DlqPublisher, MemoryDlqHandler, NatsDlqPublisher};
pub use envelope::{Event, EventBuilder};
pub use error::{BridgeError, Result};
pub use handler::{EventHandler, HandlerError, HandlerResult};
pub use inbox::model::{DedupKey, InboxRecord, InboxStatus};
pub use inbox::processor::InboxProcessor;
pub use inbox::store::{InboxStore, MemoryInboxStore, SqlxInboxStore};
pub use middleware::{standard_chain, MessageContext, Middleware, MiddlewareChain};
pub use outbox::model::{ApplyOrigin, NewOutboxRecord, OutboxRecord, OutboxStatus};
pub use outbox::publisher::{reclaim_stale, PublishBatchSummary, PublishResult, Publisher};
pub use outbox::store::{MemoryOutboxStore, OutboxStore, SqlxOutboxStore};
pub use processor::{apply_process_result, MessageProcessor, ProcessResult};
pub use runtime::ConsumerRuntime;
pub use subject::Subject;
pub use topology::{DeliverPolicy, SubscriptionSpec, TopologyManager};
