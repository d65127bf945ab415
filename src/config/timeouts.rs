//! Timeouts for engine interactions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeouts applied to the various engine interactions.
///
/// Durations deserialize from strings in the usual `60s` / `1m30s` / `500ms`
/// form, or from raw integers counting nanoseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Maximum time starting a container may take.
    #[serde(
        default = "default_minute",
        rename = "containerStart",
        with = "duration_format"
    )]
    pub container_start: Duration,

    /// Maximum time to wait for a container to stop. Keep this higher than
    /// the engine's own stop timeout.
    #[serde(
        default = "default_minute",
        rename = "containerStop",
        with = "duration_format"
    )]
    pub container_stop: Duration,

    /// Maximum time starting a command may take.
    #[serde(
        default = "default_minute",
        rename = "commandStart",
        with = "duration_format"
    )]
    pub command_start: Duration,

    /// Maximum time sending a signal may take.
    #[serde(default = "default_minute", with = "duration_format")]
    pub signal: Duration,

    /// Maximum time a window resize may take.
    #[serde(default = "default_minute", with = "duration_format")]
    pub window: Duration,

    /// HTTP timeout for individual engine requests.
    #[serde(default = "default_http", with = "duration_format")]
    pub http: Duration,
}

fn default_minute() -> Duration {
    Duration::from_secs(60)
}

fn default_http() -> Duration {
    Duration::from_secs(15)
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            container_start: default_minute(),
            container_stop: default_minute(),
            command_start: default_minute(),
            signal: default_minute(),
            window: default_minute(),
            http: default_http(),
        }
    }
}

/// Parse a duration string: a sequence of decimal numbers with unit suffixes,
/// e.g. `300ms`, `1.5h` or `2m30s`. Valid units are `ns`, `us`/`µs`, `ms`,
/// `s`, `m` and `h`.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty duration".to_string());
    }
    if value == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos = 0u128;
    let mut rest = value;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in duration {value:?}"))?;
        if digits_end == 0 {
            return Err(format!("invalid duration {value:?}"));
        }
        let number: f64 = rest[..digits_end]
            .parse()
            .map_err(|_| format!("invalid number in duration {value:?}"))?;
        rest = &rest[digits_end..];

        let (unit_nanos, unit_len) = if rest.starts_with("ns") {
            (1u128, 2)
        } else if rest.starts_with("us") {
            (1_000, 2)
        } else if rest.starts_with("µs") {
            (1_000, "µs".len())
        } else if rest.starts_with("ms") {
            (1_000_000, 2)
        } else if rest.starts_with('s') {
            (1_000_000_000, 1)
        } else if rest.starts_with('m') {
            (60_000_000_000, 1)
        } else if rest.starts_with('h') {
            (3_600_000_000_000, 1)
        } else {
            return Err(format!("unknown unit in duration {value:?}"));
        };
        rest = &rest[unit_len..];
        total_nanos += (number * unit_nanos as f64) as u128;
    }

    Ok(Duration::from_nanos(total_nanos.min(u64::MAX as u128) as u64))
}

fn format_duration(duration: &Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        "0s".to_string()
    } else if nanos % 1_000_000_000 == 0 {
        format!("{}s", nanos / 1_000_000_000)
    } else if nanos % 1_000_000 == 0 {
        format!("{}ms", nanos / 1_000_000)
    } else if nanos % 1_000 == 0 {
        format!("{}us", nanos / 1_000)
    } else {
        format!("{nanos}ns")
    }
}

pub(crate) mod duration_format {
    use std::time::Duration;

    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a duration string or a nanosecond count")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
                super::parse_duration(value).map_err(de::Error::custom)
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
                Ok(Duration::from_nanos(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
                if value < 0 {
                    return Err(de::Error::custom("negative duration"));
                }
                Ok(Duration::from_nanos(value as u64))
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<Duration, E> {
                if value < 0.0 {
                    return Err(de::Error::custom("negative duration"));
                }
                Ok(Duration::from_nanos(value as u64))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}
