//! Small cross-cutting helpers shared by config, models, and the
//! resilience components.

/// Serde helpers for human-readable `Duration`s (`"30s"`, `"5m"`,
/// `"1h"`, `"250ms"`) in TOML/JSON config and wire types.
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format_duration(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    /// Variant for `Option<Duration>` fields, used the same way via
    /// `#[serde(with = "crate::common::duration_serde::option")]`.
    pub mod option {
        use super::{format_duration, parse_duration};
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            duration.map(format_duration).serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw: Option<String> = Option::deserialize(deserializer)?;
            raw.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }

    fn format_duration(d: Duration) -> String {
        let millis = d.as_millis();
        if millis % 1000 != 0 {
            return format!("{millis}ms");
        }
        let secs = d.as_secs();
        if secs % 3600 == 0 && secs != 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 && secs != 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    pub fn parse_duration(raw: &str) -> Result<Duration, String> {
        let s = raw.trim();
        if s.is_empty() {
            return Err("empty duration string".into());
        }
        if let Some(stripped) = s.strip_suffix("ms") {
            let n: u64 = stripped.parse().map_err(|_| format!("invalid duration: {raw}"))?;
            return Ok(Duration::from_millis(n));
        }
        if let Some(stripped) = s.strip_suffix('h') {
            let n: u64 = stripped.parse().map_err(|_| format!("invalid duration: {raw}"))?;
            return Ok(Duration::from_secs(n * 3600));
        }
        if let Some(stripped) = s.strip_suffix('m') {
            let n: u64 = stripped.parse().map_err(|_| format!("invalid duration: {raw}"))?;
            return Ok(Duration::from_secs(n * 60));
        }
        if let Some(stripped) = s.strip_suffix('s') {
            let n: u64 = stripped.parse().map_err(|_| format!("invalid duration: {raw}"))?;
            return Ok(Duration::from_secs(n));
        }
        Err(format!("unknown duration unit in: {raw}"))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_common_units() {
            assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
            assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
            assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
            assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        }

        #[test]
        fn formats_round_trip() {
            for d in [Duration::from_secs(30), Duration::from_secs(300), Duration::from_millis(250)] {
                let s = format_duration(d);
                assert_eq!(parse_duration(&s).unwrap(), d);
            }
        }
    }
}

/// Generates a random jitter multiplier in `[0.5, 1.5)`, used by the
/// dispatcher's backoff formula (`base * 2^(attempt-1) * jitter()`).
pub fn jitter() -> f64 {
    use rand::Rng;
    rand::thread_rng().gen_range(0.5..1.5)
}
