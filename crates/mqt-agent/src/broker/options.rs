//! MQTT client options from agent configuration

use rumqttc::{MqttOptions, QoS, TlsConfiguration, Transport};

use mqt_core::config::AgentConfig;
use mqt_core::{tls, ConfigError, MqtError};
use mqt_protocol::QualityLevel;

/// Largest packet accepted or sent, in bytes. Tunnel chunks are far smaller;
/// the client default of 10 KiB is not.
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Build client options: identity, credentials, keep-alive and transport.
///
/// Reconnection is driven by the connection manager, so the session is
/// always clean and subscriptions are restored explicitly.
pub fn mqtt_options(config: &AgentConfig) -> Result<MqttOptions, MqtError> {
    let client_id = config.client_id();
    if client_id.is_empty() || client_id.starts_with(char::is_whitespace) {
        return Err(ConfigError::Invalid(format!("client id {:?}", client_id)).into());
    }

    let mut options = MqttOptions::new(client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(true);
    options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or_default());
    }

    let mode = config.transport_mode();
    tracing::debug!("Broker transport: {}", mode);
    if let Some(tls) = tls::client_config(&mode)? {
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(tls)));
    }

    Ok(options)
}

pub(crate) fn to_qos(quality: QualityLevel) -> QoS {
    match quality {
        QualityLevel::AtMostOnce => QoS::AtMostOnce,
        QualityLevel::AtLeastOnce => QoS::AtLeastOnce,
        QualityLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

pub(crate) fn from_qos(qos: QoS) -> QualityLevel {
    match qos {
        QoS::AtMostOnce => QualityLevel::AtMostOnce,
        QoS::AtLeastOnce => QualityLevel::AtLeastOnce,
        QoS::ExactlyOnce => QualityLevel::ExactlyOnce,
    }
}
