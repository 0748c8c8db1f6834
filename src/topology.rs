//! Topology & subscription manager: stream/consumer provisioning and
//! reconciliation (§4.2), grounded in the base crate's
//! `ensure_stream`/`build_consumer_config`/`subscribe_durable_with_options`.

use crate::config::ConsumerMode;
use crate::connection::SharedSupervisor;
use crate::duration::parse_duration_value;
use crate::error::{TopologyError, TopologyResult};
use crate::subject::Subject;
use async_nats::jetstream;
use futures::{Stream, StreamExt};
use std::time::Duration;

/// Mirrors JetStream's `DeliverPolicy`, kept local so callers don't need an
/// `async_nats` dependency just to build a spec.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliverPolicy {
    All,
    Last,
    New,
    ByStartSequence { sequence: u64 },
    LastPerSubject,
}

impl Default for DeliverPolicy {
    fn default() -> Self {
        DeliverPolicy::All
    }
}

/// A durable (or pre-provisioned) consumer's desired configuration, per §3.
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    pub durable_name: String,
    pub filter_subject: Subject,
    pub deliver_policy: DeliverPolicy,
    pub max_deliver: u32,
    pub ack_wait: Duration,
    pub backoff: Vec<Duration>,
    pub consumer_mode: ConsumerMode,
    pub delivery_subject: Option<String>,
    pub deliver_group: Option<String>,
}

/// Fields compared when deciding whether an existing consumer matches the
/// desired spec, normalized to nanoseconds so magnitude-equal durations
/// with different wire shapes compare equal.
#[derive(Debug, PartialEq)]
struct NormalizedSpec {
    filter_subject: String,
    deliver_policy: String,
    max_deliver: u32,
    ack_wait_ns: u128,
    backoff_ns: Vec<u128>,
}

impl SubscriptionSpec {
    fn normalized(&self) -> NormalizedSpec {
        NormalizedSpec {
            filter_subject: self.filter_subject.as_str().to_string(),
            deliver_policy: format!("{:?}", self.deliver_policy),
            max_deliver: self.max_deliver,
            ack_wait_ns: self.ack_wait.as_nanos(),
            backoff_ns: self.backoff.iter().map(|d| d.as_nanos()).collect(),
        }
    }

    fn to_pull_config(&self) -> jetstream::consumer::pull::Config {
        jetstream::consumer::pull::Config {
            durable_name: Some(self.durable_name.clone()),
            filter_subject: self.filter_subject.as_str().to_string(),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            deliver_policy: map_deliver_policy(&self.deliver_policy),
            max_deliver: self.max_deliver as i64,
            ack_wait: self.ack_wait,
            backoff: self.backoff.clone(),
            ..Default::default()
        }
    }

    fn to_push_config(&self) -> jetstream::consumer::push::Config {
        jetstream::consumer::push::Config {
            durable_name: Some(self.durable_name.clone()),
            filter_subject: self.filter_subject.as_str().to_string(),
            deliver_subject: self
                .delivery_subject
                .clone()
                .unwrap_or_else(|| self.filter_subject.worker_delivery().as_str().to_string()),
            deliver_group: self.deliver_group.clone(),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            deliver_policy: map_deliver_policy(&self.deliver_policy),
            max_deliver: self.max_deliver as i64,
            ack_wait: self.ack_wait,
            backoff: self.backoff.clone(),
            ..Default::default()
        }
    }
}

fn map_deliver_policy(policy: &DeliverPolicy) -> jetstream::consumer::DeliverPolicy {
    match policy {
        DeliverPolicy::All => jetstream::consumer::DeliverPolicy::All,
        DeliverPolicy::Last => jetstream::consumer::DeliverPolicy::Last,
        DeliverPolicy::New => jetstream::consumer::DeliverPolicy::New,
        DeliverPolicy::ByStartSequence { sequence } => {
            jetstream::consumer::DeliverPolicy::ByStartSequence {
                start_sequence: *sequence,
            }
        }
        DeliverPolicy::LastPerSubject => jetstream::consumer::DeliverPolicy::LastPerSubject,
    }
}

/// Provisions the stream and reconciles durable consumers against their
/// desired spec.
pub struct TopologyManager {
    connection: SharedSupervisor,
    stream_name: String,
    auto_provision: bool,
    disable_js_api: bool,
}

impl TopologyManager {
    pub fn new(
        connection: SharedSupervisor,
        stream_name: impl Into<String>,
        auto_provision: bool,
        disable_js_api: bool,
    ) -> Self {
        Self {
            connection,
            stream_name: stream_name.into(),
            auto_provision,
            disable_js_api,
        }
    }

    /// Ensure the stream exists covering `subjects`, creating it if
    /// `auto_provision` is set, otherwise failing with `StreamNotFound`.
    pub async fn ensure_stream(
        &self,
        subjects: Vec<String>,
    ) -> TopologyResult<jetstream::stream::Stream> {
        let js = self.connection.jetstream_context().await?;

        if !self.auto_provision {
            return js
                .get_stream(&self.stream_name)
                .await
                .map_err(|_| TopologyError::StreamNotFound(self.stream_name.clone()));
        }

        let config = jetstream::stream::Config {
            name: self.stream_name.clone(),
            subjects,
            retention: jetstream::stream::RetentionPolicy::Limits,
            ..Default::default()
        };

        js.get_or_create_stream(config)
            .await
            .map_err(|e| TopologyError::StreamCreationFailed {
                stream: self.stream_name.clone(),
                reason: e.to_string(),
            })
    }

    /// Reconcile a durable pull consumer against `spec`: fetch existing
    /// consumer info, create if absent, delete+recreate on drift, fall
    /// back to binding a pre-provisioned consumer when the JetStream admin
    /// API is disabled.
    pub async fn reconcile_pull_consumer(
        &self,
        spec: &SubscriptionSpec,
    ) -> TopologyResult<jetstream::consumer::Consumer<jetstream::consumer::pull::Config>> {
        let stream = self.ensure_stream(vec![spec.filter_subject.as_str().to_string()]).await?;
        reconcile_consumer(&stream, spec, self.disable_js_api, spec.to_pull_config()).await
    }

    /// Same reconciliation, for push-mode consumers.
    pub async fn reconcile_push_consumer(
        &self,
        spec: &SubscriptionSpec,
    ) -> TopologyResult<jetstream::consumer::Consumer<jetstream::consumer::push::Config>> {
        let stream = self.ensure_stream(vec![spec.filter_subject.as_str().to_string()]).await?;
        reconcile_consumer(&stream, spec, self.disable_js_api, spec.to_push_config()).await
    }

    /// Pull a batch of messages, cancel-safe: on timeout with zero
    /// messages delivered, returns an empty vec rather than an error.
    pub async fn fetch_batch(
        &self,
        consumer: &jetstream::consumer::Consumer<jetstream::consumer::pull::Config>,
        batch_size: usize,
        timeout: Duration,
    ) -> TopologyResult<Vec<jetstream::Message>> {
        let batch = consumer
            .fetch()
            .max_messages(batch_size)
            .expires(timeout)
            .messages()
            .await
            .map_err(|e| TopologyError::ConsumerReconciliation {
                durable_name: consumer.cached_info().name.clone(),
                reason: e.to_string(),
            })?;

        let mut out = Vec::with_capacity(batch_size);
        let mut batch = std::pin::pin!(batch);
        while let Some(msg) = batch.next().await {
            match msg {
                Ok(m) => out.push(m),
                Err(e) => {
                    tracing::warn!(error = %e, "error reading message from pull batch");
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Drain up to `batch_size` messages already sitting on a push
    /// consumer's live delivery stream, waiting at most `timeout` total.
    /// Mirrors `fetch_batch`'s semantics (empty vec on pure timeout, no
    /// messages delivered) so the runtime's idle-backoff loop can drive
    /// either consumer kind identically.
    pub async fn push_batch<M, E>(
        &self,
        messages: &mut M,
        batch_size: usize,
        timeout: Duration,
    ) -> TopologyResult<Vec<jetstream::Message>>
    where
        M: Stream<Item = Result<jetstream::Message, E>> + Unpin,
        E: std::fmt::Display,
    {
        let mut out = Vec::with_capacity(batch_size);
        let deadline = tokio::time::Instant::now() + timeout;

        while out.len() < batch_size {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, messages.next()).await {
                Ok(Some(Ok(msg))) => out.push(msg),
                Ok(Some(Err(e))) => {
                    tracing::warn!(error = %e, "error reading message from push stream");
                    break;
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        Ok(out)
    }
}

/// Shared reconcile algorithm for both consumer kinds: fetch existing
/// consumer info, create if absent, delete+recreate on drift, fall back to
/// binding a pre-provisioned consumer when the JetStream admin API is
/// disabled. `C` is `pull::Config` or `push::Config`; `Info` isn't
/// parameterized by consumer kind so `consumer_matches` applies to both.
async fn reconcile_consumer<C>(
    stream: &jetstream::stream::Stream,
    spec: &SubscriptionSpec,
    disable_js_api: bool,
    config: C,
) -> TopologyResult<jetstream::consumer::Consumer<C>>
where
    C: jetstream::consumer::IntoConsumerConfig + jetstream::consumer::FromConsumer,
{
    if disable_js_api {
        return stream
            .get_consumer(&spec.durable_name)
            .await
            .map_err(|e| TopologyError::ConsumerReconciliation {
                durable_name: spec.durable_name.clone(),
                reason: format!("JetStream admin API disabled and no pre-provisioned consumer found: {e}"),
            });
    }

    match stream.get_consumer::<C>(&spec.durable_name).await {
        Ok(existing) => {
            if consumer_matches(existing.cached_info(), spec) {
                Ok(existing)
            } else {
                if let Err(e) = stream.delete_consumer(&spec.durable_name).await {
                    tracing::warn!(
                        durable_name = %spec.durable_name,
                        error = %e,
                        "failed to delete drifted consumer, attempting recreate anyway"
                    );
                }
                stream
                    .get_or_create_consumer(&spec.durable_name, config)
                    .await
                    .map_err(|e| TopologyError::ConsumerReconciliation {
                        durable_name: spec.durable_name.clone(),
                        reason: e.to_string(),
                    })
            }
        }
        Err(_) => stream
            .get_or_create_consumer(&spec.durable_name, config)
            .await
            .map_err(|e| TopologyError::ConsumerReconciliation {
                durable_name: spec.durable_name.clone(),
                reason: e.to_string(),
            }),
    }
}

fn consumer_matches(info: &jetstream::consumer::Info, spec: &SubscriptionSpec) -> bool {
    let config = &info.config;
    let existing = NormalizedSpec {
        filter_subject: config.filter_subject.clone(),
        deliver_policy: format!("{:?}", spec_deliver_policy_from_jetstream(&config.deliver_policy)),
        max_deliver: config.max_deliver.max(0) as u32,
        ack_wait_ns: config.ack_wait.as_nanos(),
        backoff_ns: config.backoff.iter().map(|d| d.as_nanos()).collect(),
    };
    existing == spec.normalized()
}

fn spec_deliver_policy_from_jetstream(p: &jetstream::consumer::DeliverPolicy) -> DeliverPolicy {
    match p {
        jetstream::consumer::DeliverPolicy::All => DeliverPolicy::All,
        jetstream::consumer::DeliverPolicy::Last => DeliverPolicy::Last,
        jetstream::consumer::DeliverPolicy::New => DeliverPolicy::New,
        jetstream::consumer::DeliverPolicy::ByStartSequence { start_sequence } => {
            DeliverPolicy::ByStartSequence { sequence: *start_sequence }
        }
        jetstream::consumer::DeliverPolicy::LastPerSubject => DeliverPolicy::LastPerSubject,
        _ => DeliverPolicy::All,
    }
}

/// Convenience used by config loading: accept any of the flexible wire
/// shapes for a single duration field outside of `serde`.
pub fn parse_duration(value: &serde_json::Value) -> Result<Duration, crate::error::ConfigError> {
    parse_duration_value(value)
}
