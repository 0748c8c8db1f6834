//! Performance benchmarks for jetstream-bridge
//!
//! Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use jetstream_bridge::backoff::{BackoffStrategy, ExponentialBackoff, RetryPolicy};
use jetstream_bridge::envelope::{Event, EventBuilder};
use jetstream_bridge::outbox::model::NewOutboxRecord;
use jetstream_bridge::outbox::store::{MemoryOutboxStore, OutboxStore};
use jetstream_bridge::subject::Subject;

fn sample_event() -> Event {
    Event::new(EventBuilder {
        event_type: "order.created".into(),
        producer: "billing".into(),
        resource_type: Some("order".into()),
        resource_id: Some("ord-1".into()),
        payload: serde_json::json!({"amount": 42, "currency": "USD"}),
        ..Default::default()
    })
}

fn bench_envelope_construction(c: &mut Criterion) {
    c.bench_function("Event::new", |b| {
        b.iter(sample_event);
    });
}

fn bench_envelope_serialization(c: &mut Criterion) {
    let event = sample_event();

    c.bench_function("Event::to_json", |b| {
        b.iter(|| event.to_json().unwrap());
    });

    let bytes = event.to_json().unwrap();
    c.bench_function("Event::from_json", |b| {
        b.iter(|| Event::from_json(&bytes).unwrap());
    });
}

fn bench_subject_validation(c: &mut Criterion) {
    c.bench_function("Subject::source", |b| {
        b.iter(|| Subject::source("prod", "billing", "crm").unwrap());
    });

    c.bench_function("Subject::parse (rejects wildcard)", |b| {
        b.iter(|| Subject::parse("prod.*.sync.crm").is_err());
    });
}

fn bench_backoff(c: &mut Criterion) {
    let strategy = BackoffStrategy::default();
    c.bench_function("BackoffStrategy::delay", |b| {
        b.iter(|| strategy.delay(4, true));
    });

    let exponential = ExponentialBackoff::default();
    c.bench_function("ExponentialBackoff::delay", |b| {
        b.iter(|| exponential.delay(3));
    });
}

fn bench_outbox_claim(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("outbox_claim_batch");
    for count in [10, 100, 1000] {
        group.bench_function(format!("{count} pending rows"), |b| {
            b.to_async(&rt).iter(|| async {
                let store = MemoryOutboxStore::new();
                for i in 0..count {
                    store
                        .insert(NewOutboxRecord {
                            event_id: format!("evt-{i}"),
                            subject: "prod.billing.sync.crm".into(),
                            payload: serde_json::json!({"i": i}),
                            resource_type: None,
                            resource_id: None,
                            event_type: "order.created".into(),
                        })
                        .unwrap();
                }
                store.claim_batch(count as i64).await.unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_envelope_construction,
    bench_envelope_serialization,
    bench_subject_validation,
    bench_backoff,
    bench_outbox_claim,
);
criterion_main!(benches);
