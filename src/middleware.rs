//! Typed middleware chain (§9: replaces an implicit callback pipeline with
//! `Middleware.call(event, next)`, constructed outermost-first and
//! executed in that same outer-to-inner order, each middleware choosing
//! whether/how to invoke the rest of the chain).

use crate::envelope::Event;
use crate::handler::{EventHandler, HandlerError, HandlerResult};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-message context threaded through the chain and into the handler.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub event_id: String,
    pub deliveries: u64,
    pub subject: String,
    pub trace_id: Option<String>,
}

/// One link in the chain. `next` is the rest of the chain, already bound
/// to the event/context/handler — calling it runs everything inward of
/// this middleware.
pub trait Middleware: Send + Sync {
    fn call<'a>(
        &'a self,
        event: &'a Event,
        ctx: &'a mut MessageContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, HandlerResult>;
}

pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    handler: &'a dyn EventHandler,
}

impl<'a> Next<'a> {
    pub fn run(self, event: &'a Event, ctx: &'a mut MessageContext) -> BoxFuture<'a, HandlerResult> {
        match self.chain.split_first() {
            Some((mw, rest)) => mw.call(
                event,
                ctx,
                Next {
                    chain: rest,
                    handler: self.handler,
                },
            ),
            None => Box::pin(self.handler.handle(event)),
        }
    }
}

/// An ordered, constructed-outermost-first middleware pipeline.
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares }
    }

    pub async fn run(
        &self,
        event: &Event,
        ctx: &mut MessageContext,
        handler: &dyn EventHandler,
    ) -> HandlerResult {
        Next {
            chain: &self.middlewares,
            handler,
        }
        .run(event, ctx)
        .await
    }
}

/// Logs entry/exit around the rest of the chain.
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn call<'a>(
        &'a self,
        event: &'a Event,
        ctx: &'a mut MessageContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            tracing::debug!(event_id = %ctx.event_id, deliveries = ctx.deliveries, "processing event");
            let result = next.run(event, ctx).await;
            match &result {
                Ok(()) => tracing::debug!(event_id = %event.event_id, "event processed"),
                Err(e) => tracing::warn!(event_id = %event.event_id, error = %e, "event processing failed"),
            }
            result
        })
    }
}

/// Re-raises handler errors unchanged; exists as an explicit seam so a
/// future cross-cutting concern (alerting, error aggregation) has
/// somewhere to hook in without touching the handler itself.
pub struct ErrorHandlingMiddleware;

impl Middleware for ErrorHandlingMiddleware {
    fn call<'a>(
        &'a self,
        event: &'a Event,
        ctx: &'a mut MessageContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move { next.run(event, ctx).await })
    }
}

/// Counts successes/failures via callbacks, so embedding apps can wire
/// their own metrics backend without this crate depending on one.
pub struct MetricsMiddleware {
    pub on_success: Arc<dyn Fn(&str) + Send + Sync>,
    pub on_failure: Arc<dyn Fn(&str, &HandlerError) + Send + Sync>,
}

impl Middleware for MetricsMiddleware {
    fn call<'a>(
        &'a self,
        event: &'a Event,
        ctx: &'a mut MessageContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let result = next.run(event, ctx).await;
            match &result {
                Ok(()) => (self.on_success)(&event.event_type),
                Err(e) => (self.on_failure)(&event.event_type, e),
            }
            result
        })
    }
}

/// Propagates the envelope's `trace_id` into the tracing span for the
/// duration of the inner chain, restoring the prior context afterward.
pub struct TracingMiddleware;

impl Middleware for TracingMiddleware {
    fn call<'a>(
        &'a self,
        event: &'a Event,
        ctx: &'a mut MessageContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let span = tracing::info_span!("event", trace_id = %event.trace_id);
            let _enter = span.enter();
            ctx.trace_id = Some(event.trace_id.clone());
            next.run(event, ctx).await
        })
    }
}

/// Enforces a per-message deadline, converting a timeout into a
/// `ConsumerError`-shaped `HandlerError` carrying the event id and
/// delivery count.
pub struct TimeoutMiddleware {
    pub timeout: Duration,
}

impl Middleware for TimeoutMiddleware {
    fn call<'a>(
        &'a self,
        event: &'a Event,
        ctx: &'a mut MessageContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let started = Instant::now();
            match tokio::time::timeout(self.timeout, next.run(event, ctx)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        event_id = %event.event_id,
                        elapsed = ?started.elapsed(),
                        "handler timed out"
                    );
                    Err(HandlerError::recoverable(format!(
                        "timeout after {}s",
                        self.timeout.as_secs()
                    )))
                }
            }
        })
    }
}

/// Build the standard chain (§4.4): Logging, ErrorHandling, Metrics,
/// Tracing, Timeout, outermost to innermost.
pub fn standard_chain(
    timeout: Duration,
    on_success: Arc<dyn Fn(&str) + Send + Sync>,
    on_failure: Arc<dyn Fn(&str, &HandlerError) + Send + Sync>,
) -> MiddlewareChain {
    MiddlewareChain::new(vec![
        Arc::new(LoggingMiddleware),
        Arc::new(ErrorHandlingMiddleware),
        Arc::new(MetricsMiddleware { on_success, on_failure }),
        Arc::new(TracingMiddleware),
        Arc::new(TimeoutMiddleware { timeout }),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventBuilder;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn sample_event() -> Event {
        Event::new(EventBuilder {
            event_type: "order.created".into(),
            producer: "billing".into(),
            payload: serde_json::json!({}),
            ..Default::default()
        })
    }

    fn ctx() -> MessageContext {
        MessageContext {
            event_id: "evt-1".into(),
            deliveries: 1,
            subject: "prod.billing.sync.crm".into(),
            trace_id: None,
        }
    }

    struct OkHandler;
    #[async_trait::async_trait]
    impl EventHandler for OkHandler {
        async fn handle(&self, _event: &Event) -> HandlerResult {
            Ok(())
        }
    }

    struct FailingHandler;
    #[async_trait::async_trait]
    impl EventHandler for FailingHandler {
        async fn handle(&self, _event: &Event) -> HandlerResult {
            Err(HandlerError::recoverable("boom"))
        }
    }

    #[tokio::test]
    async fn empty_chain_calls_handler_directly() {
        let chain = MiddlewareChain::new(vec![]);
        let result = chain.run(&sample_event(), &mut ctx(), &OkHandler).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn metrics_middleware_observes_success_and_failure() {
        let successes = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let s = successes.clone();
        let f = failures.clone();
        let chain = MiddlewareChain::new(vec![Arc::new(MetricsMiddleware {
            on_success: Arc::new(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            }),
            on_failure: Arc::new(move |_, _| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        })]);

        chain.run(&sample_event(), &mut ctx(), &OkHandler).await.unwrap();
        assert_eq!(successes.load(Ordering::SeqCst), 1);

        let _ = chain.run(&sample_event(), &mut ctx(), &FailingHandler).await;
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_middleware_converts_slow_handler_into_recoverable_error() {
        struct SlowHandler;
        #[async_trait::async_trait]
        impl EventHandler for SlowHandler {
            async fn handle(&self, _event: &Event) -> HandlerResult {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            }
        }

        let chain = MiddlewareChain::new(vec![Arc::new(TimeoutMiddleware {
            timeout: Duration::from_millis(5),
        })]);
        let result = chain.run(&sample_event(), &mut ctx(), &SlowHandler).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().recoverable);
    }

    #[tokio::test]
    async fn tracing_middleware_sets_trace_id_on_context() {
        let called = Arc::new(AtomicBool::new(false));
        let c = called.clone();
        struct AssertingHandler(Arc<AtomicBool>);
        #[async_trait::async_trait]
        impl EventHandler for AssertingHandler {
            async fn handle(&self, _event: &Event) -> HandlerResult {
                self.0.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let chain = MiddlewareChain::new(vec![Arc::new(TracingMiddleware)]);
        let mut context = ctx();
        let event = sample_event();
        chain.run(&event, &mut context, &AssertingHandler(c)).await.unwrap();
        assert_eq!(context.trace_id.as_deref(), Some(event.trace_id.as_str()));
        assert!(called.load(Ordering::SeqCst));
    }
}
