//! Bidirectional bridge between a CRM's change-data-capture stream and a
//! message broker.
//!
//! Outbound: CDC notifications are shaped per entity, serialized to the XML
//! wire format, validated and fanned out to the downstream service
//! bindings. Inbound: per-queue reconcilers apply documents produced by
//! those services back onto the CRM record store. Records are correlated
//! across both systems with generated, strictly increasing correlation ids.

pub mod application;
pub mod domain;
pub mod infrastructure;
