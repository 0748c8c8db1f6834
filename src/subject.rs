//! Subject grammar and validation.
//!
//! Subjects are dot-separated tokens belonging to one of three families:
//! source (`{env}.{app}.sync.{peer}`), destination (the same tokens with
//! `app` and `peer` swapped), and the fixed per-app DLQ subject
//! (`{env}.{app}.sync.dlq`).

use crate::error::ConfigError;
use std::fmt;

const MAX_COMPONENT_LEN: usize = 255;

/// A validated, dot-separated NATS subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subject(String);

impl Subject {
    /// Parse and validate an arbitrary subject string.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ConfigError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(ConfigError::InvalidSubject {
                subject: raw,
                reason: "subject is empty".into(),
            });
        }
        for component in raw.split('.') {
            validate_component(&raw, component)?;
        }
        Ok(Self(raw))
    }

    /// Build the source subject `{env}.{app}.sync.{peer}`.
    pub fn source(env: &str, app: &str, peer: &str) -> Result<Self, ConfigError> {
        Self::parse(format!("{env}.{app}.sync.{peer}"))
    }

    /// Build the destination subject `{env}.{peer}.sync.{app}` — the mirror
    /// image of `source`, as seen from the peer's side.
    pub fn destination(env: &str, app: &str, peer: &str) -> Result<Self, ConfigError> {
        Self::parse(format!("{env}.{peer}.sync.{app}"))
    }

    /// Build the fixed DLQ subject `{env}.{app}.sync.dlq`.
    pub fn dlq(env: &str, app: &str) -> Result<Self, ConfigError> {
        Self::parse(format!("{env}.{app}.sync.dlq"))
    }

    /// The default push-consumer delivery subject for a destination subject.
    pub fn worker_delivery(&self) -> Self {
        Self(format!("{}.worker", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn validate_component(full: &str, component: &str) -> Result<(), ConfigError> {
    if component.is_empty() {
        return Err(ConfigError::InvalidSubject {
            subject: full.to_string(),
            reason: "empty component between dots".into(),
        });
    }
    if component.len() > MAX_COMPONENT_LEN {
        return Err(ConfigError::InvalidSubject {
            subject: full.to_string(),
            reason: format!("component longer than {MAX_COMPONENT_LEN} bytes"),
        });
    }
    for ch in component.chars() {
        if ch == '.' || ch == '*' || ch == '>' || ch.is_whitespace() || (ch as u32) < 0x20 {
            return Err(ConfigError::InvalidSubject {
                subject: full.to_string(),
                reason: format!("component '{component}' contains disallowed character {ch:?}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_source_and_destination_as_mirror_images() {
        let src = Subject::source("prod", "billing", "crm").unwrap();
        let dst = Subject::destination("prod", "billing", "crm").unwrap();
        assert_eq!(src.as_str(), "prod.billing.sync.crm");
        assert_eq!(dst.as_str(), "prod.crm.sync.billing");
    }

    #[test]
    fn builds_dlq_subject() {
        let dlq = Subject::dlq("prod", "billing").unwrap();
        assert_eq!(dlq.as_str(), "prod.billing.sync.dlq");
    }

    #[test]
    fn worker_delivery_appends_suffix() {
        let dst = Subject::destination("prod", "billing", "crm").unwrap();
        assert_eq!(dst.worker_delivery().as_str(), "prod.crm.sync.billing.worker");
    }

    #[test]
    fn rejects_empty_subject() {
        assert!(Subject::parse("").is_err());
    }

    #[test]
    fn rejects_wildcard_components() {
        assert!(Subject::parse("prod.*.sync.crm").is_err());
        assert!(Subject::parse("prod.billing.sync.>").is_err());
    }

    #[test]
    fn rejects_whitespace_and_control_chars() {
        assert!(Subject::parse("prod.bill ing.sync.crm").is_err());
        assert!(Subject::parse("prod.bill\ting.sync.crm").is_err());
        assert!(Subject::parse("prod.bill\u{0}ing.sync.crm").is_err());
    }

    #[test]
    fn rejects_component_over_255_bytes() {
        let long = "a".repeat(256);
        assert!(Subject::parse(format!("prod.{long}.sync.crm")).is_err());
    }

    #[test]
    fn accepts_component_at_255_bytes() {
        let long = "a".repeat(255);
        assert!(Subject::parse(format!("prod.{long}.sync.crm")).is_ok());
    }

    #[test]
    fn rejects_empty_component_between_dots() {
        assert!(Subject::parse("prod..sync.crm").is_err());
    }
}
