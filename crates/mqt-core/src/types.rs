//! Core domain types

use mqt_protocol::QualityLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Plaintext MQTT port; every other port requires TLS
pub const PLAINTEXT_PORT: u16 = 1883;

/// Connectivity state of the broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No session; initial state
    Disconnected,
    /// Initial handshake in progress
    Connecting,
    /// Session is up
    Connected,
    /// Session dropped; the transport is retrying
    Reconnecting,
    /// Terminal state after close
    Closed,
}

impl ConnectionState {
    /// Whether no further transitions are possible
    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// How the broker connection is secured. Exactly one mode is active per
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMode {
    /// No TLS (plaintext port)
    Plaintext,
    /// Server-authenticated TLS against the given CA or the platform roots
    Tls { ca_cert: Option<PathBuf> },
    /// Mutual TLS with a client certificate
    MutualTls {
        ca_cert: PathBuf,
        client_cert: PathBuf,
        private_key: PathBuf,
        verify_server: bool,
    },
    /// TLS without certificate verification
    Insecure,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Plaintext => write!(f, "plaintext"),
            TransportMode::Tls { .. } => write!(f, "tls"),
            TransportMode::MutualTls { .. } => write!(f, "mutual-tls"),
            TransportMode::Insecure => write!(f, "insecure-tls"),
        }
    }
}

/// What a tunnel does with an inbound chunk when its queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for the consumer to drain the queue
    Block,
    /// Discard the chunk that did not fit
    DropNewest,
}

impl OverflowPolicy {
    /// Dropping is only allowed for fire-and-forget tunnels
    pub fn for_quality(quality: QualityLevel, drop_when_full: bool) -> Self {
        if drop_when_full && quality == QualityLevel::AtMostOnce {
            OverflowPolicy::DropNewest
        } else {
            OverflowPolicy::Block
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Reconnecting), "reconnecting");
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
    }

    #[test]
    fn test_overflow_policy_requires_fire_and_forget() {
        assert_eq!(
            OverflowPolicy::for_quality(QualityLevel::AtMostOnce, true),
            OverflowPolicy::DropNewest
        );
        assert_eq!(
            OverflowPolicy::for_quality(QualityLevel::AtLeastOnce, true),
            OverflowPolicy::Block
        );
        assert_eq!(
            OverflowPolicy::for_quality(QualityLevel::AtMostOnce, false),
            OverflowPolicy::Block
        );
    }
}
