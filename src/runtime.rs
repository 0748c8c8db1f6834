//! Consumer runtime (§4.6): the fetch/process/ack loop a worker process
//! runs forever, grounded in the base crate's `subscribe_durable_with_options`
//! consume loop but generalized to pull- and push-mode batches, idle
//! backoff, and signal-driven graceful shutdown.

use crate::config::ConsumerMode;
use crate::connection::SharedSupervisor;
use crate::handler::EventHandler;
use crate::inbox::processor::InboxProcessor;
use crate::inbox::store::InboxStore;
use crate::topology::{SubscriptionSpec, TopologyManager};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_IDLE_SLEEP: Duration = Duration::from_secs(1);
const DEFAULT_MAX_IDLE_BACKOFF: Duration = Duration::from_secs(30);
const MAX_DRAIN_BATCHES: u32 = 5;

const RECOVERABLE_TOPOLOGY_MARKERS: &[&str] = &[
    "not found",
    "was deleted",
    "no responders",
    "stream not found",
    "404",
];

pub struct ConsumerRuntime<S: InboxStore, H: EventHandler> {
    connection: SharedSupervisor,
    topology: Arc<TopologyManager>,
    spec: SubscriptionSpec,
    inbox: Arc<InboxProcessor<S, H>>,
    batch_size: usize,
    fetch_timeout: Duration,
    idle_sleep: Duration,
    max_idle_backoff: Duration,
    running: Arc<AtomicBool>,
}

impl<S: InboxStore, H: EventHandler> ConsumerRuntime<S, H> {
    pub fn new(
        connection: SharedSupervisor,
        topology: Arc<TopologyManager>,
        spec: SubscriptionSpec,
        inbox: Arc<InboxProcessor<S, H>>,
        batch_size: usize,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            topology,
            spec,
            inbox,
            batch_size,
            fetch_timeout,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            max_idle_backoff: DEFAULT_MAX_IDLE_BACKOFF,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A clonable handle callers can use to request shutdown from outside
    /// the running loop (e.g. from an admin endpoint).
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Runs until `stop()` is called or the process receives SIGINT/SIGTERM,
    /// then drains up to `MAX_DRAIN_BATCHES` more batches of already-pulled
    /// work before returning. Dispatches to the pull or push consume loop
    /// per `spec.consumer_mode`.
    pub async fn run(&self) -> crate::error::Result<()> {
        if !self.connection.state().await.eq(&crate::connection::ConnectionState::Connected) {
            self.connection.connect().await?;
        }

        match self.spec.consumer_mode {
            ConsumerMode::Pull => self.run_pull().await,
            ConsumerMode::Push => self.run_push().await,
        }
    }

    async fn run_pull(&self) -> crate::error::Result<()> {
        let mut consumer = self.topology.reconcile_pull_consumer(&self.spec).await?;
        let mut idle_backoff = self.idle_sleep;
        let mut drain_remaining = MAX_DRAIN_BATCHES;

        loop {
            if !self.running.load(Ordering::SeqCst) {
                if drain_remaining == 0 {
                    break;
                }
                drain_remaining -= 1;
            }

            tokio::select! {
                _ = shutdown_signal(), if self.running.load(Ordering::SeqCst) => {
                    tracing::info!("shutdown signal received, draining in-flight batches");
                    self.stop();
                    continue;
                }
                batch = self.topology.fetch_batch(&consumer, self.batch_size, self.fetch_timeout) => {
                    match batch {
                        Ok(messages) if messages.is_empty() => {
                            if !self.running.load(Ordering::SeqCst) {
                                break;
                            }
                            tokio::time::sleep(idle_backoff).await;
                            idle_backoff = (idle_backoff * 2).min(self.max_idle_backoff);
                        }
                        Ok(messages) => {
                            idle_backoff = self.idle_sleep;
                            for msg in &messages {
                                let _ = self.inbox.process(msg).await;
                            }
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            tracing::warn!(error = %reason, "fetch_batch failed");
                            if is_recoverable_topology_error(&reason) {
                                tracing::info!("re-provisioning topology after recoverable error");
                                consumer = self.topology.reconcile_pull_consumer(&self.spec).await?;
                            }
                            tokio::time::sleep(idle_backoff).await;
                            idle_backoff = (idle_backoff * 2).min(self.max_idle_backoff);
                        }
                    }
                }
            }
        }

        tracing::info!("consumer runtime stopped");
        Ok(())
    }

    /// Same loop shape as `run_pull`, driving a push consumer's live
    /// delivery stream (via `topology.push_batch`) instead of pull's
    /// request/response fetch.
    async fn run_push(&self) -> crate::error::Result<()> {
        let consumer = self.topology.reconcile_push_consumer(&self.spec).await?;
        let durable_name = self.spec.durable_name.clone();
        let messages = consumer.messages().await.map_err(|e| {
            crate::error::TopologyError::ConsumerReconciliation {
                durable_name: durable_name.clone(),
                reason: e.to_string(),
            }
        })?;
        let mut messages = std::pin::pin!(messages);

        let mut idle_backoff = self.idle_sleep;
        let mut drain_remaining = MAX_DRAIN_BATCHES;

        loop {
            if !self.running.load(Ordering::SeqCst) {
                if drain_remaining == 0 {
                    break;
                }
                drain_remaining -= 1;
            }

            tokio::select! {
                _ = shutdown_signal(), if self.running.load(Ordering::SeqCst) => {
                    tracing::info!("shutdown signal received, draining in-flight batches");
                    self.stop();
                    continue;
                }
                batch = self.topology.push_batch(&mut messages, self.batch_size, self.fetch_timeout) => {
                    match batch {
                        Ok(messages) if messages.is_empty() => {
                            if !self.running.load(Ordering::SeqCst) {
                                break;
                            }
                            tokio::time::sleep(idle_backoff).await;
                            idle_backoff = (idle_backoff * 2).min(self.max_idle_backoff);
                        }
                        Ok(messages) => {
                            idle_backoff = self.idle_sleep;
                            for msg in &messages {
                                let _ = self.inbox.process(msg).await;
                            }
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            tracing::warn!(error = %reason, "push_batch failed");
                            tokio::time::sleep(idle_backoff).await;
                            idle_backoff = (idle_backoff * 2).min(self.max_idle_backoff);
                        }
                    }
                }
            }
        }

        tracing::info!("consumer runtime stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn is_recoverable_topology_error(reason: &str) -> bool {
    let lower = reason.to_ascii_lowercase();
    RECOVERABLE_TOPOLOGY_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_recoverable_topology_errors() {
        assert!(is_recoverable_topology_error("consumer not found"));
        assert!(is_recoverable_topology_error("stream was deleted"));
        assert!(is_recoverable_topology_error("404 Not Found"));
        assert!(!is_recoverable_topology_error("permission violation"));
    }
}
