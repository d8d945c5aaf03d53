//! Control packet types
//!
//! Peers manage data-plane tunnels by publishing control packets on the
//! shared control topic. On the wire a packet is a single JSON object:
//!
//! ```text
//! { "kind": "open", "topic": "<topic>", "quality": 1,
//!   "params": { "peer_topic": "<topic>", "remote": 22, "origin": "<client id>" } }
//! ```
//!
//! # Kinds
//!
//! - `open`: provision a tunnel subscribed on `topic`
//! - `close`: tear down the tunnel subscribed on `topic`
//! - anything else is decoded as [`ControlCommand::Unknown`] and ignored by
//!   receivers, so new kinds can be introduced without breaking old peers
//!
//! Unknown fields inside `params` are ignored.

use crate::quality::QualityLevel;
use crate::topic::TopicName;
use serde::{Deserialize, Serialize};

/// Wire name of the open kind
pub const KIND_OPEN: &str = "open";

/// Wire name of the close kind
pub const KIND_CLOSE: &str = "close";

/// A decoded control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Provision a tunnel
    Open(OpenTunnel),
    /// Tear a tunnel down
    Close(CloseTunnel),
    /// A kind this build does not understand
    Unknown {
        kind: String,
        topic: Option<TopicName>,
    },
}

impl ControlCommand {
    /// Wire name of this packet's kind
    pub fn kind(&self) -> &str {
        match self {
            ControlCommand::Open(_) => KIND_OPEN,
            ControlCommand::Close(_) => KIND_CLOSE,
            ControlCommand::Unknown { kind, .. } => kind,
        }
    }

    /// Target topic, if the packet carries one
    pub fn topic(&self) -> Option<&TopicName> {
        match self {
            ControlCommand::Open(open) => Some(&open.topic),
            ControlCommand::Close(close) => Some(&close.topic),
            ControlCommand::Unknown { topic, .. } => topic.as_ref(),
        }
    }

    /// Client identifier of the peer that published the packet
    pub fn origin(&self) -> Option<&str> {
        match self {
            ControlCommand::Open(open) => open.params.origin.as_deref(),
            ControlCommand::Close(close) => close.params.origin.as_deref(),
            ControlCommand::Unknown { .. } => None,
        }
    }
}

/// Request to provision a tunnel on `topic`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTunnel {
    /// Topic the new tunnel subscribes to
    pub topic: TopicName,
    /// Requested delivery quality; receivers fall back to their default
    pub quality: Option<QualityLevel>,
    pub params: OpenParams,
}

impl OpenTunnel {
    pub fn new(topic: TopicName) -> Self {
        Self {
            topic,
            quality: None,
            params: OpenParams::default(),
        }
    }
}

/// Parameters of an open packet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenParams {
    /// Topic the new tunnel publishes its outbound bytes to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_topic: Option<TopicName>,

    /// Host the receiving side should dial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Port the initiating side listens on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<u16>,

    /// Port the receiving side should dial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<u16>,

    /// Client identifier of the sender
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// Request to tear down the tunnel on `topic`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseTunnel {
    pub topic: TopicName,
    pub params: CloseParams,
}

impl CloseTunnel {
    pub fn new(topic: TopicName) -> Self {
        Self {
            topic,
            params: CloseParams::default(),
        }
    }
}

/// Parameters of a close packet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloseParams {
    /// Client identifier of the sender
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}
