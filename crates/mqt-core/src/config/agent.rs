//! Tunnel agent configuration

use mqt_protocol::{QualityLevel, TopicName};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;
use crate::types::{TransportMode, PLAINTEXT_PORT};

/// Default control topic shared by both peers
pub const DEFAULT_CONTROL_TOPIC: &str = "mqtunnel/control";

/// Configuration for a tunnel agent.
///
/// Loaded once at startup and treated as immutable afterwards. Call
/// [`AgentConfig::prepare`] before handing it to the engine so the control
/// override and client identifier are settled and the values validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Broker hostname or address
    pub host: String,

    /// Broker port. 1883 is plaintext, any other port uses TLS.
    pub port: u16,

    /// Optional broker username
    pub username: Option<String>,

    /// Optional broker password
    pub password: Option<String>,

    /// MQTT client identifier (random UUID when absent)
    pub client_id: Option<String>,

    /// CA certificate (PEM)
    pub ca_cert: Option<PathBuf>,

    /// Client certificate chain (PEM), enables mutual TLS
    pub client_cert: Option<PathBuf>,

    /// Client private key (PEM)
    pub private_key: Option<PathBuf>,

    /// Skip broker certificate verification when no client certificate is set
    pub ignore_tls_errors: bool,

    /// Verify the broker certificate in the mutual-TLS path
    pub verify_server_cert: bool,

    /// Control topic
    pub control: String,

    /// Delay between reconnect attempts
    #[serde(with = "duration_secs")]
    pub reconnect_interval: Duration,

    /// Bound for connect, subscribe and unsubscribe round-trips
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// MQTT keep-alive interval
    #[serde(with = "duration_secs")]
    pub keep_alive: Duration,

    /// Default delivery quality for tunnels (0, 1 or 2)
    pub tunnel_quality: QualityLevel,

    /// Capacity of each tunnel's inbound queue, in chunks
    pub inbound_capacity: usize,

    /// Drop chunks for a full queue instead of blocking (QoS 0 tunnels only)
    pub drop_when_full: bool,

    /// How long a blocked delivery waits for queue space before the tunnel
    /// is torn down
    #[serde(with = "duration_secs")]
    pub delivery_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: PLAINTEXT_PORT,
            username: None,
            password: None,
            client_id: None,
            ca_cert: None,
            client_cert: None,
            private_key: None,
            ignore_tls_errors: false,
            verify_server_cert: true,
            control: DEFAULT_CONTROL_TOPIC.to_string(),
            reconnect_interval: Duration::from_secs(20),
            command_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(30),
            tunnel_quality: QualityLevel::AtMostOnce,
            inbound_capacity: 256,
            drop_when_full: false,
            delivery_timeout: Duration::from_secs(10),
        }
    }
}

impl AgentConfig {
    /// Apply the control-topic override, settle the client identifier and
    /// validate the result.
    pub fn prepare(mut self, control_override: Option<&str>) -> Result<Self, ConfigError> {
        if let Some(control) = control_override.filter(|c| !c.is_empty()) {
            self.control = control.to_string();
        }
        if self.client_id.as_deref().map_or(true, str::is_empty) {
            self.client_id = Some(uuid::Uuid::new_v4().to_string());
        }
        self.validate()?;
        Ok(self)
    }

    /// Check field values and TLS material combinations
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingField("host".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }
        self.control_topic()?;

        if self.command_timeout.is_zero() {
            return Err(ConfigError::Invalid("command_timeout must be non-zero".into()));
        }
        if self.reconnect_interval.is_zero() {
            return Err(ConfigError::Invalid("reconnect_interval must be non-zero".into()));
        }
        if !self.keep_alive.is_zero() && self.keep_alive < Duration::from_secs(1) {
            return Err(ConfigError::Invalid("keep_alive must be zero or at least one second".into()));
        }
        if self.delivery_timeout.is_zero() {
            return Err(ConfigError::Invalid("delivery_timeout must be non-zero".into()));
        }
        if self.inbound_capacity == 0 {
            return Err(ConfigError::Invalid("inbound_capacity must be non-zero".into()));
        }

        if self.port != PLAINTEXT_PORT && self.client_cert.is_some() {
            if self.ca_cert.is_none() {
                return Err(ConfigError::MissingField("ca_cert".into()));
            }
            if self.private_key.is_none() {
                return Err(ConfigError::MissingField("private_key".into()));
            }
        }

        Ok(())
    }

    /// The control topic as a validated topic name
    pub fn control_topic(&self) -> Result<TopicName, ConfigError> {
        TopicName::parse(self.control.as_str())
            .map_err(|e| ConfigError::Invalid(format!("control topic: {}", e)))
    }

    /// Client identifier, empty until [`AgentConfig::prepare`] has run
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or_default()
    }

    /// Resolve the transport mode for this configuration
    pub fn transport_mode(&self) -> TransportMode {
        if self.port == PLAINTEXT_PORT {
            return TransportMode::Plaintext;
        }

        match (&self.client_cert, &self.ca_cert, &self.private_key) {
            (Some(client_cert), Some(ca_cert), Some(private_key)) => TransportMode::MutualTls {
                ca_cert: ca_cert.clone(),
                client_cert: client_cert.clone(),
                private_key: private_key.clone(),
                verify_server: self.verify_server_cert,
            },
            _ if self.ignore_tls_errors => TransportMode::Insecure,
            _ => TransportMode::Tls {
                ca_cert: self.ca_cert.clone(),
            },
        }
    }
}
