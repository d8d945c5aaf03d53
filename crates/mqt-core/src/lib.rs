//! mqt-core: Core abstractions and configuration for mqtunnel
//!
//! This crate provides the configuration, error types, transport security
//! builder, log dispatch and the broker client trait shared by the engine
//! and the command-line entry points.

pub mod config;
pub mod error;
pub mod logging;
pub mod tls;
pub mod traits;
pub mod types;

pub use error::{BrokerError, ConfigError, MqtError, TlsError, TunnelError};
pub use traits::{BrokerClient, PublishToken, SubscriptionSet};
pub use types::{ConnectionState, OverflowPolicy, TransportMode};
