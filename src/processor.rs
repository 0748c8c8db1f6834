//! Message processor (§4.4): turns one delivered JetStream message into a
//! parsed `Event`, runs it through the middleware chain to the handler,
//! and decides ack/nak/DLQ. Never panics and never propagates a handler
//! error — the decision is returned as `ProcessResult` for the consumer
//! runtime to apply against the raw message.

use crate::dlq::{DlqContext, DlqPublisher};
use crate::envelope::Event;
use crate::handler::{EventHandler, HandlerError};
use crate::middleware::{MessageContext, MiddlewareChain};
use async_nats::jetstream;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const MSG_ID_HEADER: &str = "nats-msg-id";

/// What the consumer runtime should do with the raw message once
/// processing finishes. DLQ publication and the ack/nak decision are
/// bundled together because a DLQ publish failure still needs to fall back
/// to a NAK rather than silently acking a message nobody recorded.
#[derive(Debug)]
pub enum ProcessResult {
    Ack,
    Nak { delay: Duration },
    DlqThenAck,
    DlqThenNak { delay: Duration },
}

pub struct MessageProcessor<H: EventHandler> {
    chain: MiddlewareChain,
    handler: Arc<H>,
    dlq: Option<Arc<dyn DlqPublisher>>,
    backoff: crate::backoff::BackoffStrategy,
    max_deliver: u32,
    consumer_name: String,
}

impl<H: EventHandler> MessageProcessor<H> {
    pub fn new(
        chain: MiddlewareChain,
        handler: Arc<H>,
        dlq: Option<Arc<dyn DlqPublisher>>,
        backoff: crate::backoff::BackoffStrategy,
        max_deliver: u32,
        consumer_name: impl Into<String>,
    ) -> Self {
        Self {
            chain,
            handler,
            dlq,
            backoff,
            max_deliver,
            consumer_name: consumer_name.into(),
        }
    }

    /// Process one delivered message end to end. Reads headers/delivery
    /// count off the raw message but never acks/naks it directly — the
    /// caller applies the returned `ProcessResult`.
    pub async fn process(&self, msg: &jetstream::Message) -> ProcessResult {
        let deliveries = message_deliveries(msg);
        let subject = msg.subject.to_string();
        let header_event_id = msg
            .headers
            .as_ref()
            .and_then(|h| h.get(MSG_ID_HEADER))
            .map(|v| v.to_string());

        let event = match Event::from_json(&msg.payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(subject = %subject, error = %e, "malformed event payload, unable to parse");
                return self
                    .dead_letter(
                        None,
                        msg.payload.to_vec(),
                        deliveries,
                        "MalformedPayload",
                        &e.to_string(),
                    )
                    .await;
            }
        };

        let event_id = header_event_id.unwrap_or_else(|| event.event_id.clone());
        let mut ctx = MessageContext {
            event_id: event_id.clone(),
            deliveries,
            subject: subject.clone(),
            trace_id: None,
        };

        let result = self.chain.run(&event, &mut ctx, self.handler.as_ref()).await;
        self.decide(&event, deliveries, result).await
    }

    /// Maps a handler outcome to a `ProcessResult`, independent of where
    /// the outcome came from. The inbox processor calls this directly
    /// after running the chain itself, so both paths share one ack/nak/DLQ
    /// decision.
    pub async fn decide(
        &self,
        event: &Event,
        deliveries: u64,
        result: Result<(), HandlerError>,
    ) -> ProcessResult {
        match result {
            Ok(()) => ProcessResult::Ack,
            Err(err) => self.handle_failure(event, deliveries, err).await,
        }
    }

    /// Access to the handler/chain, for callers (like the inbox processor)
    /// that need to run the chain themselves before deciding.
    pub fn chain(&self) -> &MiddlewareChain {
        &self.chain
    }

    pub fn handler(&self) -> &H {
        self.handler.as_ref()
    }

    async fn handle_failure(&self, event: &Event, deliveries: u64, err: HandlerError) -> ProcessResult {
        let exhausted = crate::dlq::should_dead_letter(deliveries, self.max_deliver);
        if !err.recoverable || exhausted {
            tracing::error!(
                event_id = %event.event_id,
                deliveries,
                recoverable = err.recoverable,
                error = %err.message,
                "handler failed terminally, dead-lettering"
            );
            return self
                .dead_letter(
                    Some(serde_json::to_value(event).unwrap_or_default()),
                    event.to_json().unwrap_or_default(),
                    deliveries,
                    "HandlerError",
                    &err.message,
                )
                .await;
        }

        let delay = self.backoff.delay(deliveries, err.recoverable);
        tracing::warn!(
            event_id = %event.event_id,
            deliveries,
            ?delay,
            error = %err.message,
            "handler failed, requesting redelivery"
        );
        ProcessResult::Nak { delay }
    }

    async fn dead_letter(
        &self,
        original_envelope: Option<serde_json::Value>,
        raw_payload: Vec<u8>,
        deliveries: u64,
        error_class: &str,
        error_message: &str,
    ) -> ProcessResult {
        let Some(dlq) = &self.dlq else {
            let delay = self.backoff.delay(deliveries, false);
            return ProcessResult::Nak { delay };
        };

        let ctx = DlqContext {
            original_envelope,
            raw_payload,
            consumer_name: self.consumer_name.clone(),
            delivery_count: deliveries,
            error_class: error_class.to_string(),
            error_message: error_message.to_string(),
        };

        match dlq.publish(ctx).await {
            Ok(()) => ProcessResult::DlqThenAck,
            Err(e) => {
                tracing::error!(error = %e, "failed to publish to DLQ, will redeliver instead");
                let delay = self.backoff.delay(deliveries, false);
                ProcessResult::DlqThenNak { delay }
            }
        }
    }
}

pub(crate) fn message_deliveries(msg: &jetstream::Message) -> u64 {
    msg.info().map(|info| info.delivered).unwrap_or(1).max(1)
}

/// Applies a `ProcessResult` to the raw message: ack, or nak with the
/// requested delay, falling back to a plain nak if the delayed variant is
/// rejected by the server.
pub async fn apply_process_result(msg: &jetstream::Message, result: ProcessResult) {
    match result {
        ProcessResult::Ack | ProcessResult::DlqThenAck => {
            if let Err(e) = msg.ack().await {
                tracing::warn!(error = %e, "failed to ack message");
            }
        }
        ProcessResult::Nak { delay } | ProcessResult::DlqThenNak { delay } => {
            safe_nak_message(msg, delay).await;
        }
    }
}

/// Crash-safe NAK: tries a delayed NAK first, falls back to a plain NAK if
/// the server rejects the delay variant, and only logs if both fail (the
/// message will still redeliver once `ack_wait` elapses either way).
pub async fn safe_nak_message(msg: &jetstream::Message, delay: Duration) {
    let delayed = msg
        .ack_with(jetstream::AckKind::Nak(Some(delay)))
        .await;
    if delayed.is_err() {
        if let Err(e) = msg.ack_with(jetstream::AckKind::Nak(None)).await {
            tracing::warn!(error = %e, "failed to nak message after delayed nak was rejected");
        }
    }
}

/// Generates a synthetic event id for observability when a message carries
/// neither a `nats-msg-id` header nor a parseable envelope.
pub fn fallback_event_id() -> String {
    Uuid::new_v4().to_string()
}
