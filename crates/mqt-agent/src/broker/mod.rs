//! Broker session management
//!
//! The [`ConnectionManager`] owns the single MQTT session. It drives the
//! client's event loop in a background task and reports everything the
//! rest of the engine cares about as [`BrokerEvent`]s on a channel.

mod acks;
mod manager;
mod options;
mod reconnect;
mod state;

pub use manager::ConnectionManager;
pub use options::{mqtt_options, MAX_PACKET_SIZE};
pub use reconnect::FixedInterval;
pub use state::{next_state, StateCell, Transition};

use bytes::Bytes;
use mqt_protocol::{QualityLevel, TopicName};

/// A publication received from the broker
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: TopicName,
    pub payload: Bytes,
    pub quality: QualityLevel,
}

impl InboundMessage {
    pub fn new(topic: impl Into<TopicName>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            quality: QualityLevel::AtMostOnce,
        }
    }
}

/// Notifications from the connection manager
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// The broker accepted the session. `resumed` is set after a reconnect.
    Connected { resumed: bool },
    /// An established session dropped; the manager is reconnecting
    ConnectionLost { reason: String },
    /// A publication arrived
    Message(InboundMessage),
}
