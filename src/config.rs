//! Bridge configuration: wire shape, presets, and validation.

use crate::duration::{deserialize_duration, deserialize_duration_list};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerMode {
    Pull,
    Push,
}

/// Full configuration surface for one bridge instance, matching §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app_name: String,
    pub destination_app: String,
    pub stream_name: String,
    pub nats_urls: Vec<String>,
    pub auto_provision: bool,
    pub use_outbox: bool,
    pub use_inbox: bool,
    pub use_dlq: bool,
    pub max_deliver: u32,

    #[serde(deserialize_with = "deserialize_duration")]
    pub ack_wait: Duration,

    #[serde(deserialize_with = "deserialize_duration_list")]
    pub backoff: Vec<Duration>,

    pub consumer_mode: ConsumerMode,
    pub delivery_subject: Option<String>,
    pub push_consumer_group: Option<String>,
    pub lazy_connect: bool,
    pub connect_retry_attempts: u32,

    #[serde(deserialize_with = "deserialize_duration")]
    pub connect_retry_delay: Duration,

    pub disable_js_api: bool,
    pub env: String,
    pub preset_applied: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            destination_app: String::new(),
            stream_name: String::new(),
            nats_urls: vec!["nats://127.0.0.1:4222".to_string()],
            auto_provision: true,
            use_outbox: true,
            use_inbox: true,
            use_dlq: true,
            max_deliver: 5,
            ack_wait: Duration::from_secs(30),
            backoff: vec![
                Duration::from_millis(250),
                Duration::from_secs(1),
                Duration::from_secs(2),
            ],
            consumer_mode: ConsumerMode::Pull,
            delivery_subject: None,
            push_consumer_group: None,
            lazy_connect: false,
            connect_retry_attempts: 3,
            connect_retry_delay: Duration::from_secs(1),
            disable_js_api: false,
            env: "development".to_string(),
            preset_applied: None,
        }
    }
}

impl Config {
    /// Validate required fields and cross-field constraints not
    /// expressible in the type itself.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name.is_empty() {
            return Err(ConfigError::MissingConfiguration("app_name".into()));
        }
        if self.destination_app.is_empty() {
            return Err(ConfigError::MissingConfiguration("destination_app".into()));
        }
        if self.stream_name.is_empty() {
            return Err(ConfigError::MissingConfiguration("stream_name".into()));
        }
        if self.nats_urls.is_empty() {
            return Err(ConfigError::MissingConfiguration("nats_urls".into()));
        }
        for url in &self.nats_urls {
            validate_nats_url(url)?;
        }
        if self.max_deliver == 0 {
            return Err(ConfigError::MissingConfiguration(
                "max_deliver must be >= 1".into(),
            ));
        }
        if self.backoff.is_empty() {
            return Err(ConfigError::MissingConfiguration(
                "backoff must be a non-empty ordered list".into(),
            ));
        }
        if self.consumer_mode == ConsumerMode::Push && self.delivery_subject.is_none() {
            // Not fatal: the topology manager derives a default
            // `{destination}.worker` subject when this is unset.
        }
        Ok(())
    }

    /// Push-mode queue group, falling back through
    /// `push_consumer_group -> durable_name -> app_name` per §9.
    pub fn push_queue_group<'a>(&'a self, durable_name: &'a str) -> &'a str {
        self.push_consumer_group
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                if !durable_name.is_empty() {
                    durable_name
                } else {
                    &self.app_name
                }
            })
    }

    pub fn apply_preset(mut self, name: &str) -> Result<Self, ConfigError> {
        let preset = preset_by_name(name)?;
        preset(&mut self);
        self.preset_applied = Some(name.to_string());
        Ok(self)
    }
}

fn validate_nats_url(url: &str) -> Result<(), ConfigError> {
    let supported = ["nats://", "nats+tls://", "tls://"];
    if !supported.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(ConfigError::InvalidSubject {
            subject: url.to_string(),
            reason: "unsupported NATS URL scheme".into(),
        });
    }

    let parsed = url::Url::parse(url).map_err(|e| ConfigError::InvalidSubject {
        subject: url.to_string(),
        reason: format!("malformed URL: {e}"),
    })?;

    let host_present = parsed.host_str().is_some_and(|h| !h.is_empty());
    if !host_present {
        return Err(ConfigError::InvalidSubject {
            subject: url.to_string(),
            reason: "host is required".into(),
        });
    }

    match parsed.port() {
        Some(port) if port >= 1 => Ok(()),
        _ => Err(ConfigError::InvalidSubject {
            subject: url.to_string(),
            reason: "port must be between 1 and 65535".into(),
        }),
    }
}

type PresetFn = fn(&mut Config);

fn preset_by_name(name: &str) -> Result<PresetFn, ConfigError> {
    match name {
        "development" => Ok(preset_development),
        "test" => Ok(preset_test),
        "staging" => Ok(preset_staging),
        "production" => Ok(preset_production),
        "high_throughput" => Ok(preset_high_throughput),
        "maximum_reliability" => Ok(preset_maximum_reliability),
        other => Err(ConfigError::UnknownPreset(other.to_string())),
    }
}

fn preset_development(c: &mut Config) {
    c.env = "development".into();
    c.auto_provision = true;
    c.max_deliver = 3;
    c.ack_wait = Duration::from_secs(10);
}

fn preset_test(c: &mut Config) {
    c.env = "test".into();
    c.auto_provision = true;
    c.use_dlq = false;
    c.max_deliver = 1;
    c.ack_wait = Duration::from_secs(2);
    c.connect_retry_attempts = 1;
}

fn preset_staging(c: &mut Config) {
    c.env = "staging".into();
    c.auto_provision = true;
    c.max_deliver = 5;
    c.ack_wait = Duration::from_secs(30);
}

fn preset_production(c: &mut Config) {
    c.env = "production".into();
    c.auto_provision = false;
    c.max_deliver = 5;
    c.ack_wait = Duration::from_secs(30);
    c.connect_retry_attempts = 10;
    c.connect_retry_delay = Duration::from_secs(2);
}

fn preset_high_throughput(c: &mut Config) {
    c.consumer_mode = ConsumerMode::Push;
    c.max_deliver = 3;
    c.ack_wait = Duration::from_secs(15);
    c.backoff = vec![Duration::from_millis(100), Duration::from_millis(500)];
}

fn preset_maximum_reliability(c: &mut Config) {
    c.auto_provision = false;
    c.use_outbox = true;
    c.use_inbox = true;
    c.use_dlq = true;
    c.max_deliver = 10;
    c.ack_wait = Duration::from_secs(60);
    c.backoff = vec![
        Duration::from_secs(1),
        Duration::from_secs(5),
        Duration::from_secs(15),
        Duration::from_secs(30),
    ];
    c.connect_retry_attempts = 20;
}
