//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding control packets or naming topics
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Payload is not a JSON object of the expected shape
    #[error("Malformed control packet: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A field required by the packet kind is absent
    #[error("Control packet missing field: {0}")]
    MissingField(&'static str),

    /// Quality level outside 0..=2
    #[error("Invalid quality level: {0}")]
    InvalidQuality(u64),

    /// Topic name is empty or contains wildcard characters
    #[error("Invalid topic name {name:?}: {reason}")]
    InvalidTopic { name: String, reason: &'static str },
}
