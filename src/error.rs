//! Error taxonomy for the bridge.
//!
//! Each component gets its own error enum rather than one flat type, because
//! each has a different propagation rule: configuration errors abort
//! startup, connection/topology errors are caught and retried at runtime,
//! per-message errors never escape the consumer loop.

use thiserror::Error;

/// Errors that abort startup and are never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid subject '{subject}': {reason}")]
    InvalidSubject { subject: String, reason: String },

    #[error("missing configuration: {0}")]
    MissingConfiguration(String),

    #[error("invalid duration literal '{0}'")]
    InvalidDuration(String),

    #[error("unrecognized config preset '{0}'")]
    UnknownPreset(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Transport/session health errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to NATS at {urls}: {reason}")]
    Connect { urls: String, reason: String },

    #[error("JetStream connection has not been established")]
    NotEstablished,

    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("health check rate limit exceeded, at most one uncached check per {window_secs}s")]
    RateLimited { window_secs: u64 },

    #[error("unsupported NATS URL scheme in '{0}', expected nats://, nats+tls:// or tls://")]
    UnsupportedScheme(String),

    #[error("invalid NATS URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Stream/consumer provisioning errors.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("stream '{0}' not found and auto-provisioning is disabled")]
    StreamNotFound(String),

    #[error("failed to create stream '{stream}': {reason}")]
    StreamCreationFailed { stream: String, reason: String },

    #[error("subject '{subject}' overlaps an existing stream's subjects")]
    SubjectOverlap { subject: String },

    #[error("failed to reconcile consumer '{durable_name}': {reason}")]
    ConsumerReconciliation { durable_name: String, reason: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

pub type TopologyResult<T> = std::result::Result<T, TopologyError>;

/// A single publish attempt failed.
#[derive(Debug, Error)]
#[error("failed to publish event '{event_id}' to subject '{subject}': {reason}")]
pub struct PublishError {
    pub event_id: String,
    pub subject: String,
    pub reason: String,
}

/// A batch publish had partial failures.
#[derive(Debug, Error)]
#[error("{} of a batch failed to publish", failed_events.len())]
pub struct BatchPublishError {
    pub failed_events: Vec<PublishError>,
    pub successful_count: usize,
}

/// A message-processing error, always attached to the message it failed on.
#[derive(Debug, Error)]
#[error("consumer error on event '{event_id}' (delivery {deliveries}): {reason}")]
pub struct ConsumerError {
    pub event_id: String,
    pub deliveries: u64,
    pub reason: String,
    pub recoverable: bool,
}

impl ConsumerError {
    pub fn timeout(event_id: impl Into<String>, deliveries: u64, after_secs: u64) -> Self {
        Self {
            event_id: event_id.into(),
            deliveries,
            reason: format!("timeout after {after_secs}s"),
            recoverable: false,
        }
    }
}

/// All retry attempts for an operation were exhausted.
#[derive(Debug, Error)]
#[error("retry exhausted after {attempts} attempts: {original_error}")]
pub struct RetryExhausted {
    pub attempts: u32,
    pub original_error: String,
}

/// Publishing to the dead-letter subject itself failed.
#[derive(Debug, Error)]
#[error("failed to publish to DLQ subject '{subject}': {reason}")]
pub struct DlqError {
    pub subject: String,
    pub reason: String,
}

/// Errors surfaced by the store layer (outbox/inbox persistence).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Top-level error type uniting all of the above for call sites that need
/// a single `Result` (e.g. the consumer runtime's outer loop).
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    BatchPublish(#[from] BatchPublishError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    #[error(transparent)]
    RetryExhausted(#[from] RetryExhausted),

    #[error(transparent)]
    Dlq(#[from] DlqError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
