//! Topic name type

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a concrete broker topic.
///
/// Topics used by tunnels and the control channel are always concrete, so
/// MQTT wildcard characters are rejected when a name is parsed from
/// untrusted input.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicName(String);

impl TopicName {
    /// Parse and validate a topic name
    pub fn parse(name: impl Into<String>) -> Result<Self, ProtocolError> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("empty")
        } else if name.contains(['+', '#']) {
            Some("contains a wildcard")
        } else if name.contains('\0') {
            Some("contains a NUL character")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ProtocolError::InvalidTopic { name, reason }),
            None => Ok(Self(name)),
        }
    }

    /// Append a level to this topic (`base/level`)
    pub fn child(&self, level: impl fmt::Display) -> Self {
        Self(format!("{}/{}", self.0, level))
    }

    /// Get the raw topic string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Topics delivered by the broker are concrete, so no validation is applied
impl From<String> for TopicName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&str> for TopicName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl AsRef<str> for TopicName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_concrete_topic() {
        let topic = TopicName::parse("mqtunnel/control").unwrap();
        assert_eq!(topic.as_str(), "mqtunnel/control");
    }

    #[test]
    fn test_parse_rejects_wildcards_and_empty() {
        assert!(TopicName::parse("").is_err());
        assert!(TopicName::parse("a/+/b").is_err());
        assert!(TopicName::parse("a/#").is_err());
    }

    #[test]
    fn test_child_appends_level() {
        let base = TopicName::from("mqtunnel/control");
        assert_eq!(base.child("22-2222").child("a").as_str(), "mqtunnel/control/22-2222/a");
    }
}
