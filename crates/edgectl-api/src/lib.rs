//! Broker-facing layer for the edgectl field controller.
//!
//! This crate knows how to talk to an MQTT broker and nothing about
//! control logic:
//!
//! - **[`MqttSession`]**: a persistent broker session driven by a
//!   background poll loop. Reconnects with a fixed backoff, publishes
//!   [`LinkState`] through a `watch` channel and forwards
//!   [`LinkEvent`]s (connect, disconnect, inbound messages, publish
//!   acknowledgements) over `mpsc`.
//!
//! - **[`BrokerLink`]**: the seam `edgectl-core` publishes through.
//!   [`MqttSession`] implements it; tests substitute an in-process fake.
//!
//! - **[`Topics`]**: the `{prefix}/{controllerId}/...` topic scheme,
//!   including classification of inbound command topics.
//!
//! - **[`wire`]**: JSON payloads exchanged with the backend.

pub mod error;
pub mod session;
pub mod topics;
pub mod wire;

pub use error::Error;
pub use session::{BrokerLink, DeliveryTag, LinkEvent, LinkState, MqttSession, SessionConfig};
pub use topics::{CommandTopic, Topics};
