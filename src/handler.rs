//! The user-supplied handler contract.

use crate::envelope::Event;
use async_trait::async_trait;
use thiserror::Error;

/// An error raised by a handler or a middleware. `recoverable` drives the
/// message processor's ack/nak/DLQ decision (§4.4): recoverable errors are
/// retried via NAK-with-backoff, unrecoverable ones go straight to DLQ.
#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub recoverable: bool,
}

impl HandlerError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
        }
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Business logic that reacts to one inbound event. Implementations own
/// nothing about acking, NAKing, or the DLQ — that's the processor's job;
/// a handler just does the work and reports success or failure.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> HandlerResult;
}

#[async_trait]
impl<F> EventHandler for F
where
    F: Fn(&Event) -> HandlerResult + Send + Sync,
{
    async fn handle(&self, event: &Event) -> HandlerResult {
        self(event)
    }
}
