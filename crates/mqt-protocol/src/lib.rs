//! mqt-protocol: Control-channel wire format for mqtunnel
//!
//! This crate defines the JSON control packets peers exchange on the shared
//! control topic, together with the topic and quality types used by every
//! other crate in the workspace.

pub mod codec;
pub mod error;
pub mod packet;
pub mod quality;
pub mod topic;

pub use codec::{decode, encode};
pub use error::ProtocolError;
pub use packet::{CloseParams, CloseTunnel, ControlCommand, OpenParams, OpenTunnel};
pub use quality::QualityLevel;
pub use topic::TopicName;
