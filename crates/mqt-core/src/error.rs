//! Core error types for mqtunnel

use mqt_protocol::{ProtocolError, TopicName};
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the mqtunnel crates
#[derive(Error, Debug)]
pub enum MqtError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Broker session error
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Tunnel error
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport security error
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broker session errors
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// A network round-trip exceeded the command timeout
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    /// The broker refused the connection (bad credentials, bad client id)
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// The connection dropped before the operation was acknowledged
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The broker answered a subscribe with a failure return code
    #[error("Subscription rejected for {0}")]
    SubscriptionRejected(String),

    /// Network or MQTT state error reported by the transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// The connection manager has been closed
    #[error("Broker client closed")]
    Closed,
}

/// Tunnel errors
#[derive(Error, Debug, Clone)]
pub enum TunnelError {
    /// Tunnel is closing or closed
    #[error("Tunnel closed: {0}")]
    Closed(TopicName),

    /// The topic already has a tunnel
    #[error("Tunnel already open: {0}")]
    AlreadyOpen(TopicName),

    /// The adapter did not drain the inbound queue within the delivery timeout
    #[error("Tunnel stalled: {0}")]
    Stalled(TopicName),

    /// A tunnel may not use the control topic
    #[error("Topic {0} is reserved for the control channel")]
    ReservedTopic(TopicName),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Config file could not be read
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Transport security errors
#[derive(Error, Debug)]
pub enum TlsError {
    /// PEM file could not be read
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// PEM material could not be parsed
    #[error("Failed to parse {label}: {source}")]
    Pem {
        label: String,
        source: std::io::Error,
    },

    /// PEM material contained no certificates
    #[error("No certificates found in {0}")]
    NoCertificates(String),

    /// PEM material contained no private key
    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    /// Client certificate leaf failed to parse
    #[error("Invalid client certificate: {0}")]
    InvalidCertificate(String),

    /// Platform root store could not be loaded
    #[error("Failed to load native root certificates: {0}")]
    NativeRoots(std::io::Error),

    /// rustls rejected the material
    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}
