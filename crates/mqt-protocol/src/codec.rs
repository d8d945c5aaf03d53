//! JSON codec for control packets

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::packet::{CloseParams, CloseTunnel, ControlCommand, OpenParams, OpenTunnel, KIND_CLOSE, KIND_OPEN};
use crate::quality::QualityLevel;
use crate::topic::TopicName;

/// Wire shape shared by every packet kind
#[derive(Debug, Serialize, Deserialize)]
struct WirePacket {
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    quality: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

/// Decode a control packet from a UTF-8 JSON payload
pub fn decode(payload: &[u8]) -> Result<ControlCommand, ProtocolError> {
    let wire: WirePacket = serde_json::from_slice(payload)?;

    match wire.kind.as_str() {
        KIND_OPEN => {
            let topic = required_topic(wire.topic)?;
            let quality = wire.quality.map(QualityLevel::try_from).transpose()?;
            let params: OpenParams = decode_params(wire.params)?;
            if let Some(peer) = &params.peer_topic {
                TopicName::parse(peer.as_str())?;
            }
            Ok(ControlCommand::Open(OpenTunnel {
                topic,
                quality,
                params,
            }))
        }
        KIND_CLOSE => {
            let topic = required_topic(wire.topic)?;
            let params: CloseParams = decode_params(wire.params)?;
            Ok(ControlCommand::Close(CloseTunnel { topic, params }))
        }
        _ => Ok(ControlCommand::Unknown {
            kind: wire.kind,
            topic: wire.topic.and_then(|t| TopicName::parse(t).ok()),
        }),
    }
}

/// Encode a control packet as a JSON payload
pub fn encode(command: &ControlCommand) -> Result<Vec<u8>, ProtocolError> {
    let wire = match command {
        ControlCommand::Open(open) => WirePacket {
            kind: KIND_OPEN.to_string(),
            topic: Some(open.topic.to_string()),
            quality: open.quality.map(|q| u64::from(q.as_u8())),
            params: Some(serde_json::to_value(&open.params)?),
        },
        ControlCommand::Close(close) => WirePacket {
            kind: KIND_CLOSE.to_string(),
            topic: Some(close.topic.to_string()),
            quality: None,
            params: Some(serde_json::to_value(&close.params)?),
        },
        ControlCommand::Unknown { kind, topic } => WirePacket {
            kind: kind.clone(),
            topic: topic.as_ref().map(ToString::to_string),
            quality: None,
            params: None,
        },
    };

    Ok(serde_json::to_vec(&wire)?)
}

fn required_topic(topic: Option<String>) -> Result<TopicName, ProtocolError> {
    let topic = topic.ok_or(ProtocolError::MissingField("topic"))?;
    TopicName::parse(topic)
}

fn decode_params<T>(params: Option<serde_json::Value>) -> Result<T, ProtocolError>
where
    T: Default + serde::de::DeserializeOwned,
{
    match params {
        None | Some(serde_json::Value::Null) => Ok(T::default()),
        Some(value) => Ok(serde_json::from_value(value)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_open_with_params() {
        let payload = br#"{"kind":"open","topic":"t/a","quality":1,
            "params":{"peer_topic":"t/b","remote":22,"origin":"peer-1","future":true}}"#;

        let command = decode(payload).unwrap();
        let ControlCommand::Open(open) = command else {
            panic!("expected an open packet");
        };
        assert_eq!(open.topic.as_str(), "t/a");
        assert_eq!(open.quality, Some(QualityLevel::AtLeastOnce));
        assert_eq!(open.params.peer_topic, Some(TopicName::from("t/b")));
        assert_eq!(open.params.remote, Some(22));
        assert_eq!(open.params.origin.as_deref(), Some("peer-1"));
    }

    #[test]
    fn test_decode_open_missing_topic_fails() {
        let err = decode(br#"{"kind":"open"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("topic")));
    }

    #[test]
    fn test_decode_rejects_bad_quality_and_wildcards() {
        assert!(matches!(
            decode(br#"{"kind":"open","topic":"t","quality":7}"#),
            Err(ProtocolError::InvalidQuality(7))
        ));
        assert!(matches!(
            decode(br#"{"kind":"close","topic":"t/#"}"#),
            Err(ProtocolError::InvalidTopic { .. })
        ));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let command = decode(br#"{"kind":"resize","topic":"t/a","cols":80}"#).unwrap();
        assert_eq!(command.kind(), "resize");
        assert_eq!(command.topic().map(TopicName::as_str), Some("t/a"));
        assert!(command.origin().is_none());
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        assert!(matches!(decode(b"not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            decode(br#"{"kind":"open","topic":"t","params":5}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_encode_close_omits_quality() {
        let mut close = CloseTunnel::new(TopicName::from("t/b"));
        close.params.origin = Some("me".into());

        let payload = encode(&ControlCommand::Close(close.clone())).unwrap();
        let text = String::from_utf8(payload.clone()).unwrap();
        assert!(!text.contains("quality"));
        assert_eq!(decode(&payload).unwrap(), ControlCommand::Close(close));
    }
}
