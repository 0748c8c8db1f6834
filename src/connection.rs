//! Connection supervisor: owns the single JetStream context used by the
//! rest of the bridge, with an explicit state machine and a rate-limited
//! health check, grounded in the base crate's `NatsClient::connect` /
//! `build_connect_options`.

use crate::error::{ConnectionError, ConnectionResult};
use async_nats::jetstream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Connection lifecycle state, per §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

const CACHE_TTL: Duration = Duration::from_secs(30);
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(5);

struct HealthCache {
    last_checked: Instant,
    last_uncached_check: Instant,
    healthy: bool,
}

/// An explicit, constructible value representing ownership of one NATS
/// connection and its JetStream context (§9: "model global Supervisor as
/// explicit value, not singleton").
pub struct ConnectionSupervisor {
    urls: Vec<String>,
    connect_timeout: Duration,
    request_timeout: Duration,
    token: Option<String>,
    state: Mutex<ConnectionState>,
    inner: Mutex<Option<Inner>>,
    health: Mutex<Option<HealthCache>>,
    // Guarantees connect() is single-flight even under concurrent callers.
    connect_lock: Mutex<()>,
}

struct Inner {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl ConnectionSupervisor {
    pub fn new(urls: Vec<String>) -> ConnectionResult<Self> {
        for url in &urls {
            validate_scheme(url)?;
        }
        Ok(Self {
            urls,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            token: None,
            state: Mutex::new(ConnectionState::Disconnected),
            inner: Mutex::new(None),
            health: Mutex::new(None),
            connect_lock: Mutex::new(()),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// Idempotent, single-flight connect. Concurrent callers serialize on
    /// `connect_lock`; a caller that arrives after another has already
    /// connected observes the existing session without reconnecting.
    pub async fn connect(&self) -> ConnectionResult<()> {
        let _guard = self.connect_lock.lock().await;

        if matches!(self.state().await, ConnectionState::Connected) && self.inner.lock().await.is_some() {
            return Ok(());
        }

        *self.state.lock().await = ConnectionState::Connecting;

        let mut opts = async_nats::ConnectOptions::new()
            .connection_timeout(self.connect_timeout)
            .request_timeout(Some(self.request_timeout));
        if let Some(token) = &self.token {
            opts = opts.token(token.clone());
        }

        let joined = self.urls.join(",");
        let client = opts.connect(&joined).await.map_err(|e| {
            ConnectionError::Connect {
                urls: joined.clone(),
                reason: e.to_string(),
            }
        });

        let client = match client {
            Ok(c) => c,
            Err(e) => {
                *self.state.lock().await = ConnectionState::Failed;
                return Err(e);
            }
        };

        let jetstream = jetstream::new(client.clone());

        if let Err(e) = jetstream.account_info().await {
            *self.state.lock().await = ConnectionState::Failed;
            return Err(ConnectionError::Connect {
                urls: joined,
                reason: format!("JetStream account_info failed: {e}"),
            });
        }

        tracing::info!(urls = %joined, "connected to NATS JetStream");

        *self.inner.lock().await = Some(Inner { client, jetstream });
        *self.state.lock().await = ConnectionState::Connected;
        *self.health.lock().await = None;
        Ok(())
    }

    /// Idempotent disconnect.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(Inner { client, .. }) = inner.take() {
            let _ = client.drain().await;
        }
        *self.state.lock().await = ConnectionState::Disconnected;
        *self.health.lock().await = None;
    }

    pub async fn jetstream_context(&self) -> ConnectionResult<jetstream::Context> {
        self.inner
            .lock()
            .await
            .as_ref()
            .map(|i| i.jetstream.clone())
            .ok_or(ConnectionError::NotEstablished)
    }

    pub async fn nats_client(&self) -> ConnectionResult<async_nats::Client> {
        self.inner
            .lock()
            .await
            .as_ref()
            .map(|i| i.client.clone())
            .ok_or(ConnectionError::NotEstablished)
    }

    /// Cached, rate-limited health check: a positive result is reused for
    /// up to 30s; at most one uncached check is allowed per 5s, excess
    /// callers get `HealthCheckFailed`/rate-limit error rather than
    /// hammering the server.
    pub async fn connected(&self) -> ConnectionResult<bool> {
        {
            let cache = self.health.lock().await;
            if let Some(c) = cache.as_ref() {
                if c.healthy && c.last_checked.elapsed() < CACHE_TTL {
                    return Ok(true);
                }
                if c.last_uncached_check.elapsed() < RATE_LIMIT_WINDOW {
                    return Err(ConnectionError::RateLimited {
                        window_secs: RATE_LIMIT_WINDOW.as_secs(),
                    });
                }
            }
        }

        let jetstream = match self.jetstream_context().await {
            Ok(js) => js,
            Err(_) => {
                let mut cache = self.health.lock().await;
                *cache = Some(HealthCache {
                    last_checked: Instant::now(),
                    last_uncached_check: Instant::now(),
                    healthy: false,
                });
                return Ok(false);
            }
        };

        let healthy = jetstream.account_info().await.is_ok();
        let mut cache = self.health.lock().await;
        *cache = Some(HealthCache {
            last_checked: Instant::now(),
            last_uncached_check: Instant::now(),
            healthy,
        });
        Ok(healthy)
    }
}

fn validate_scheme(url: &str) -> ConnectionResult<()> {
    let supported = ["nats://", "nats+tls://", "tls://"];
    if !supported.iter().any(|s| url.starts_with(s)) {
        return Err(ConnectionError::UnsupportedScheme(url.to_string()));
    }

    let parsed = url::Url::parse(url).map_err(|e| ConnectionError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let host_present = parsed.host_str().is_some_and(|h| !h.is_empty());
    if !host_present {
        return Err(ConnectionError::InvalidUrl {
            url: url.to_string(),
            reason: "host is required".into(),
        });
    }

    match parsed.port() {
        Some(port) if port >= 1 => Ok(()),
        _ => Err(ConnectionError::InvalidUrl {
            url: url.to_string(),
            reason: "port must be between 1 and 65535".into(),
        }),
    }
}

/// Shared, clonable handle to a supervisor for components that need to
/// reach the same connection concurrently.
pub type SharedSupervisor = Arc<ConnectionSupervisor>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_scheme_at_construction() {
        let err = ConnectionSupervisor::new(vec!["redis://localhost".into()]);
        assert!(err.is_err());
    }

    #[test]
    fn accepts_all_supported_schemes() {
        assert!(ConnectionSupervisor::new(vec!["nats://localhost:4222".into()]).is_ok());
        assert!(ConnectionSupervisor::new(vec!["nats+tls://localhost:4222".into()]).is_ok());
        assert!(ConnectionSupervisor::new(vec!["tls://localhost:4222".into()]).is_ok());
    }

    #[test]
    fn rejects_missing_host() {
        let err = ConnectionSupervisor::new(vec!["nats://:4222".into()]);
        assert!(matches!(err, Err(ConnectionError::InvalidUrl { .. })));
    }

    #[test]
    fn rejects_missing_port() {
        let err = ConnectionSupervisor::new(vec!["nats://localhost".into()]);
        assert!(matches!(err, Err(ConnectionError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn starts_disconnected_and_jetstream_context_requires_connect() {
        let sup = ConnectionSupervisor::new(vec!["nats://127.0.0.1:4222".into()]).unwrap();
        assert_eq!(sup.state().await, ConnectionState::Disconnected);
        assert!(matches!(
            sup.jetstream_context().await,
            Err(ConnectionError::NotEstablished)
        ));
    }

    #[tokio::test]
    async fn disconnect_before_connect_is_a_harmless_no_op() {
        let sup = ConnectionSupervisor::new(vec!["nats://127.0.0.1:4222".into()]).unwrap();
        sup.disconnect().await;
        assert_eq!(sup.state().await, ConnectionState::Disconnected);
    }
}
