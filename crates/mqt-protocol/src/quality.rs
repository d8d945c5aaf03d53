//! Delivery quality levels

use crate::error::ProtocolError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Broker delivery guarantee for a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QualityLevel {
    /// Fire and forget; no acknowledgement, no retransmission
    #[default]
    AtMostOnce = 0,
    /// Acknowledged delivery, duplicates possible
    AtLeastOnce = 1,
    /// Four-step handshake delivery
    ExactlyOnce = 2,
}

impl QualityLevel {
    /// Wire value (0, 1 or 2)
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the broker acknowledges publications at this level
    pub fn is_acknowledged(self) -> bool {
        self != QualityLevel::AtMostOnce
    }
}

impl TryFrom<u64> for QualityLevel {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QualityLevel::AtMostOnce),
            1 => Ok(QualityLevel::AtLeastOnce),
            2 => Ok(QualityLevel::ExactlyOnce),
            other => Err(ProtocolError::InvalidQuality(other)),
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qos{}", self.as_u8())
    }
}

impl Serialize for QualityLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for QualityLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u64::deserialize(deserializer)?;
        QualityLevel::try_from(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_at_most_once() {
        assert_eq!(QualityLevel::default(), QualityLevel::AtMostOnce);
        assert!(!QualityLevel::default().is_acknowledged());
    }

    #[test]
    fn test_try_from_rejects_out_of_range() {
        assert_eq!(QualityLevel::try_from(1).unwrap(), QualityLevel::AtLeastOnce);
        assert!(matches!(
            QualityLevel::try_from(3),
            Err(ProtocolError::InvalidQuality(3))
        ));
    }
}
