//! Idempotent inbox (§3/§4.5): applies an inbound event's effects at most
//! once per `event_id`, even across redeliveries.

pub mod model;
pub mod processor;
pub mod store;
