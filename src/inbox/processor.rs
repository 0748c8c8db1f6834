//! Inbox processor (§4.5): wraps the message processor with a
//! find-or-build/persist-pre/persist-post(or failure) envelope so a
//! handler's side effects apply at most once per `event_id`, even across
//! redeliveries. Falls through to the plain message processor untouched
//! when no inbox store is configured (`use_inbox = false`).

use super::model::{DedupKey, InboxRecord};
use super::store::InboxStore;
use crate::envelope::Event;
use crate::handler::EventHandler;
use crate::middleware::MessageContext;
use crate::processor::{apply_process_result, message_deliveries, MessageProcessor, ProcessResult};
use async_nats::jetstream;
use std::sync::Arc;

const MSG_ID_HEADER: &str = "nats-msg-id";

pub struct InboxProcessor<S: InboxStore, H: EventHandler> {
    store: Option<Arc<S>>,
    processor: Arc<MessageProcessor<H>>,
}

impl<S: InboxStore, H: EventHandler> InboxProcessor<S, H> {
    pub fn new(store: Option<Arc<S>>, processor: Arc<MessageProcessor<H>>) -> Self {
        Self { store, processor }
    }

    /// Process one delivered message, applying the inbox's at-most-once
    /// guard when a store is configured. Never panics; any store or
    /// parsing failure degrades to a NAK so the message redelivers rather
    /// than being silently dropped. Returns whether the message ended up
    /// acked.
    pub async fn process(&self, msg: &jetstream::Message) -> bool {
        let Some(store) = &self.store else {
            let result = self.processor.process(msg).await;
            let acked = is_ack(&result);
            apply_process_result(msg, result).await;
            return acked;
        };

        let event = match Event::from_json(&msg.payload) {
            Ok(event) => event,
            Err(_) => {
                // No usable envelope to key the inbox on; let the plain
                // processor's malformed-payload handling apply.
                let result = self.processor.process(msg).await;
                let acked = is_ack(&result);
                apply_process_result(msg, result).await;
                return acked;
            }
        };

        let deliveries = message_deliveries(msg);
        let subject = msg.subject.to_string();
        let header_event_id = msg
            .headers
            .as_ref()
            .and_then(|h| h.get(MSG_ID_HEADER))
            .map(|v| v.to_string());

        let info = msg.info().ok();
        let stream = info.as_ref().map(|i| i.stream.as_str());
        let stream_seq = info.as_ref().map(|i| i.stream_sequence as i64);

        let dedup_key = build_dedup_key(header_event_id, stream, stream_seq, &event.event_id);

        let envelope_json = serde_json::to_value(&event).unwrap_or_default();
        let record = match store
            .find_or_build(&dedup_key, &subject, &envelope_json, stream, stream_seq)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(event_id = %event.event_id, error = %e, "inbox find_or_build failed");
                crate::processor::safe_nak_message(msg, self.retry_delay()).await;
                return false;
            }
        };

        if record.already_processed() {
            tracing::debug!(event_id = %event.event_id, "event already processed, skipping handler");
            let _ = msg.ack().await;
            return true;
        }

        if let Err(e) = store.persist_pre(record.id).await {
            tracing::error!(event_id = %event.event_id, error = %e, "inbox persist_pre failed");
            crate::processor::safe_nak_message(msg, self.retry_delay()).await;
            return false;
        }

        let mut ctx = MessageContext {
            event_id: event.event_id.clone(),
            deliveries,
            subject: subject.clone(),
            trace_id: None,
        };

        let handler_result = self
            .processor
            .chain()
            .run(&event, &mut ctx, self.processor.handler())
            .await;

        self.persist_outcome(store, &record, &handler_result).await;

        let process_result = self.processor.decide(&event, deliveries, handler_result).await;
        let acked = is_ack(&process_result);
        apply_process_result(msg, process_result).await;
        acked
    }

    async fn persist_outcome(
        &self,
        store: &Arc<S>,
        record: &InboxRecord,
        result: &Result<(), crate::handler::HandlerError>,
    ) {
        let outcome = match result {
            Ok(()) => store.persist_post(record.id).await,
            Err(err) => store.persist_failure(record.id, &err.message).await,
        };
        if let Err(e) = outcome {
            tracing::error!(inbox_id = record.id, error = %e, "failed to persist inbox outcome");
        }
    }

    fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(5)
    }
}

fn is_ack(result: &ProcessResult) -> bool {
    matches!(result, ProcessResult::Ack | ProcessResult::DlqThenAck)
}

/// Picks the dedup key for a delivered message: the `nats-msg-id` header
/// when present, else the stream/sequence pair (stable across
/// redeliveries even when the envelope itself carries no `event_id`),
/// and only then the envelope's own `event_id` as a last resort — that
/// field is freshly generated on every parse when the JSON payload omits
/// it, so it won't match across redeliveries of the same message.
fn build_dedup_key(
    header_event_id: Option<String>,
    stream: Option<&str>,
    stream_seq: Option<i64>,
    fallback_event_id: &str,
) -> DedupKey {
    if let Some(id) = header_event_id {
        return DedupKey::EventId(id);
    }
    match (stream, stream_seq) {
        (Some(stream), Some(seq)) => DedupKey::StreamSequence {
            stream: stream.to_string(),
            seq: seq as u64,
        },
        _ => DedupKey::EventId(fallback_event_id.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffStrategy;
    use crate::envelope::EventBuilder;
    use crate::handler::{HandlerError, HandlerResult};
    use crate::inbox::model::InboxStatus;
    use crate::inbox::store::MemoryInboxStore;
    use crate::middleware::MiddlewareChain;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler(Arc<AtomicUsize>);
    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Event) -> HandlerResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample_event() -> Event {
        Event::new(EventBuilder {
            event_id: Some("evt-fixed".into()),
            event_type: "order.created".into(),
            producer: "billing".into(),
            payload: serde_json::json!({}),
            ..Default::default()
        })
    }

    #[test]
    fn dedup_key_prefers_header_over_everything_else() {
        let key = build_dedup_key(Some("hdr-id".into()), Some("STREAM"), Some(7), "fallback-id");
        assert_eq!(key, DedupKey::EventId("hdr-id".into()));
    }

    #[test]
    fn dedup_key_falls_back_to_stream_sequence_when_header_absent() {
        let key = build_dedup_key(None, Some("STREAM"), Some(7), "fallback-id");
        assert_eq!(
            key,
            DedupKey::StreamSequence { stream: "STREAM".into(), seq: 7 }
        );
    }

    #[test]
    fn dedup_key_falls_back_to_stream_sequence_consistently_across_redeliveries() {
        // Same delivery redelivered: same stream/seq even though a
        // freshly-parsed envelope without its own event_id would mint a
        // different random id on each parse.
        let first = build_dedup_key(None, Some("STREAM"), Some(42), "random-id-a");
        let second = build_dedup_key(None, Some("STREAM"), Some(42), "random-id-b");
        assert_eq!(first, second);
    }

    #[test]
    fn dedup_key_falls_back_to_event_id_when_stream_info_unavailable() {
        let key = build_dedup_key(None, None, None, "fallback-id");
        assert_eq!(key, DedupKey::EventId("fallback-id".into()));
    }

    #[tokio::test]
    async fn already_processed_record_short_circuits_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryInboxStore::new());
        let key = DedupKey::EventId("evt-fixed".into());
        let record = store
            .find_or_build(&key, "prod.billing.sync.crm", &serde_json::json!({}), None, None)
            .await
            .unwrap();
        store.persist_pre(record.id).await.unwrap();
        store.persist_post(record.id).await.unwrap();

        let processor = Arc::new(MessageProcessor::new(
            MiddlewareChain::new(vec![]),
            Arc::new(CountingHandler(calls.clone())),
            None,
            BackoffStrategy::default(),
            5,
            "test-worker",
        ));
        let inbox = InboxProcessor::new(Some(store.clone()), processor);

        let found = store
            .find_or_build(&key, "prod.billing.sync.crm", &serde_json::json!({}), None, None)
            .await
            .unwrap();
        assert!(found.already_processed());
        let _ = inbox;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fresh_record_runs_handler_and_marks_processed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryInboxStore::new());
        let key = DedupKey::EventId("evt-fixed".into());

        let handler_chain = MiddlewareChain::new(vec![]);
        let processor = Arc::new(MessageProcessor::new(
            handler_chain,
            Arc::new(CountingHandler(calls.clone())),
            None,
            BackoffStrategy::default(),
            5,
            "test-worker",
        ));

        let event = sample_event();
        let record = store
            .find_or_build(&key, "prod.billing.sync.crm", &serde_json::to_value(&event).unwrap(), None, None)
            .await
            .unwrap();
        assert_eq!(record.status, InboxStatus::Received);

        store.persist_pre(record.id).await.unwrap();
        let mut ctx = MessageContext {
            event_id: event.event_id.clone(),
            deliveries: 1,
            subject: "prod.billing.sync.crm".into(),
            trace_id: None,
        };
        let result = processor.chain().run(&event, &mut ctx, processor.handler()).await;
        assert!(result.is_ok());
        store.persist_post(record.id).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let after = store.snapshot().into_iter().find(|r| r.id == record.id).unwrap();
        assert!(after.already_processed());
    }

    #[tokio::test]
    async fn failed_handler_persists_failure_and_keeps_event_unprocessed() {
        struct AlwaysFails;
        #[async_trait]
        impl EventHandler for AlwaysFails {
            async fn handle(&self, _event: &Event) -> HandlerResult {
                Err(HandlerError::recoverable("db down"))
            }
        }

        let store = Arc::new(MemoryInboxStore::new());
        let key = DedupKey::EventId("evt-fixed".into());
        let event = sample_event();
        let record = store
            .find_or_build(&key, "prod.billing.sync.crm", &serde_json::to_value(&event).unwrap(), None, None)
            .await
            .unwrap();
        store.persist_pre(record.id).await.unwrap();
        store.persist_failure(record.id, "db down").await.unwrap();

        let after = store.snapshot().into_iter().find(|r| r.id == record.id).unwrap();
        assert_eq!(after.status, InboxStatus::Failed);
        assert!(!after.already_processed());
    }
}
