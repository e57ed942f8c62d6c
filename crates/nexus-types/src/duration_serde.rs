//! Humantime-style `Duration` serde helpers for config files.
//!
//! Accepts `"500ms"`, `"30s"`, `"5m"`, `"2h"` or a bare number of seconds.
//!
//! ```rust,ignore
//! #[serde(with = "nexus_types::duration_serde")]
//! pub send_timeout: Duration,
//! ```

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if duration.subsec_millis() != 0 || duration.as_secs() == 0 {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    } else {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Parse a humantime-style duration string.
pub fn parse_duration(s: &str) -> Result<Duration, &'static str> {
    let s = s.trim();
    // "ms" must be checked before the single-letter suffixes.
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| "invalid milliseconds")
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| "invalid seconds")
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .map(|m| Duration::from_secs(m * 60))
            .map_err(|_| "invalid minutes")
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .map(|h| Duration::from_secs(h * 3600))
            .map_err(|_| "invalid hours")
    } else {
        s.parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| "invalid duration format")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("30m"), Ok(Duration::from_secs(1800)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_duration(" 7 "), Ok(Duration::from_secs(7)));
        assert!(parse_duration("soon").is_err());
    }

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Holder {
        #[serde(with = "super")]
        d: Duration,
    }

    #[test]
    fn test_serde_roundtrip() {
        let h = Holder {
            d: Duration::from_millis(1500),
        };
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, r#"{"d":"1500ms"}"#);
        let back: Holder = serde_json::from_str(&json).unwrap();
        assert_eq!(back.d, h.d);
    }
}
