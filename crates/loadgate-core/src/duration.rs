//! Human-readable durations (`"20s"`, `"1m30s"`, `"250ms"`) for configuration files.
//!
//! Use with `#[serde(with = "crate::duration")]` on `Duration` fields, or
//! `crate::duration::option` on `Option<Duration>` fields.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Parse a human duration string.
pub fn parse(input: &str) -> CoreResult<Duration> {
    humantime::parse_duration(input.trim()).map_err(|e| CoreError::InvalidDuration {
        input: input.to_string(),
        message: e.to_string(),
    })
}

/// Format a duration the way it is written in configuration.
pub fn format(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format(*duration))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = RawDuration::deserialize(deserializer)?;
    raw.into_duration().map_err(serde::de::Error::custom)
}

/// Durations may also be given as a bare number of milliseconds, which is
/// what environment overrides tend to produce.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Text(String),
    Millis(u64),
}

impl RawDuration {
    fn into_duration(self) -> CoreResult<Duration> {
        match self {
            Self::Text(text) => parse(&text),
            Self::Millis(ms) => Ok(Duration::from_millis(ms)),
        }
    }
}

pub mod option {
    use super::RawDuration;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<RawDuration>::deserialize(deserializer)?
            .map(RawDuration::into_duration)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compound_durations() {
        assert_eq!(parse("20s").unwrap(), Duration::from_secs(20));
        assert_eq!(parse("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse(" 250ms ").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse("soon").unwrap_err();
        assert!(matches!(err, CoreError::InvalidDuration { .. }));
    }

    #[test]
    fn test_format_roundtrips_through_parse() {
        let d = Duration::from_millis(61_500);
        assert_eq!(parse(&format(d)).unwrap(), d);
    }
}
