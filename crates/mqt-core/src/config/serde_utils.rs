//! Serde helpers for configuration values

/// Durations stored as seconds.
///
/// Whole seconds are written back as integers. Fractional values such as
/// `keep_alive = 0.5` are accepted on input so short test intervals can be
/// expressed in TOML.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Whole(u64),
        Fractional(f64),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_u64(duration.as_secs())
        } else {
            serializer.serialize_f64(duration.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Seconds::deserialize(deserializer)? {
            Seconds::Whole(secs) => Ok(Duration::from_secs(secs)),
            Seconds::Fractional(secs) if secs.is_finite() && secs >= 0.0 => {
                Ok(Duration::from_secs_f64(secs))
            }
            Seconds::Fractional(secs) => Err(serde::de::Error::custom(format!(
                "invalid duration: {} seconds",
                secs
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timeouts {
        #[serde(with = "duration_secs")]
        command: Duration,
    }

    #[test]
    fn test_whole_seconds_from_toml() {
        let parsed: Timeouts = toml::from_str("command = 5").unwrap();
        assert_eq!(parsed.command, Duration::from_secs(5));
    }

    #[test]
    fn test_fractional_seconds_from_toml() {
        let parsed: Timeouts = toml::from_str("command = 0.25").unwrap();
        assert_eq!(parsed.command, Duration::from_millis(250));
    }

    #[test]
    fn test_negative_seconds_rejected() {
        assert!(toml::from_str::<Timeouts>("command = -1.5").is_err());
    }

    #[test]
    fn test_serialize_prefers_integers() {
        let whole = Timeouts {
            command: Duration::from_secs(20),
        };
        assert_eq!(serde_json::to_string(&whole).unwrap(), r#"{"command":20}"#);

        let fractional = Timeouts {
            command: Duration::from_millis(1500),
        };
        assert_eq!(serde_json::to_string(&fractional).unwrap(), r#"{"command":1.5}"#);
    }
}
