//! Duration literals in configuration files.
//!
//! Accepts `"300ms"`, `"2s"`, `"5m"`, `"1h30m"` and compound forms, plus
//! bare numbers meaning seconds. Used through `#[serde(with = "...")]` on
//! duration-typed config fields.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserializer, Serializer};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid duration literal: {0:?}")]
pub struct DurationParseError(pub String);

/// Parse a duration literal: one or more `<number><unit>` segments where
/// unit is one of `ns`, `us`, `ms`, `s`, `m`, `h`.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationParseError(input.to_string()));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| DurationParseError(input.to_string()))?;
        if digits == 0 {
            return Err(DurationParseError(input.to_string()));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| DurationParseError(input.to_string()))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let scaled = match unit {
            "ns" => Duration::from_secs_f64(value / 1e9),
            "us" => Duration::from_secs_f64(value / 1e6),
            "ms" => Duration::from_secs_f64(value / 1e3),
            "s" => Duration::from_secs_f64(value),
            "m" => Duration::from_secs_f64(value * 60.0),
            "h" => Duration::from_secs_f64(value * 3600.0),
            _ => return Err(DurationParseError(input.to_string())),
        };
        total += scaled;
    }
    Ok(total)
}

/// Render a duration back as a compact literal (`"2s"`, `"5m"`, `"1h30m"`).
#[must_use]
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }

    let mut nanos = d.as_nanos();
    let mut out = String::new();
    for (unit, step) in [
        ("h", 3_600_000_000_000u128),
        ("m", 60_000_000_000),
        ("s", 1_000_000_000),
        ("ms", 1_000_000),
        ("us", 1_000),
        ("ns", 1),
    ] {
        let count = nanos / step;
        if count > 0 {
            out.push_str(&format!("{count}{unit}"));
            nanos %= step;
        }
    }
    out
}

pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_duration(*d))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a duration literal or a number of seconds")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            parse_duration(v).map_err(E::custom)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("negative duration"))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
            if v < 0.0 {
                return Err(E::custom("negative duration"));
            }
            Ok(Duration::from_secs_f64(v))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
