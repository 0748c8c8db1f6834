//! Flexible duration normalization.
//!
//! Config fields that name a duration accept several wire shapes: a bare
//! integer (ambiguous — `<1000` is seconds, `>=1000` is milliseconds, the
//! same heuristic `humantime`-less ecosystems settle on), a floating point
//! number of seconds, or an annotated string such as `"250ms"`, `"2s"`,
//! `"1_500ms"`, `"1.5h"`. Lists (e.g. the backoff ladder) are normalized
//! elementwise.

use crate::error::ConfigError;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::time::Duration;

const AMBIGUOUS_INT_SECONDS_CEILING: u64 = 1000;

/// Parse a single duration value from its JSON representation.
pub fn parse_duration_value(value: &serde_json::Value) -> Result<Duration, ConfigError> {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_u64() {
                Ok(parse_ambiguous_int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Duration::from_secs_f64(f))
            } else {
                Err(ConfigError::InvalidDuration(n.to_string()))
            }
        }
        serde_json::Value::String(s) => parse_duration_str(s),
        other => Err(ConfigError::InvalidDuration(other.to_string())),
    }
}

/// Bare integers are ambiguous: below the ceiling they are seconds, at or
/// above it they are milliseconds. This mirrors how the bridge's config
/// previously accepted unit-less numbers from its embedding application.
fn parse_ambiguous_int(n: u64) -> Duration {
    if n < AMBIGUOUS_INT_SECONDS_CEILING {
        Duration::from_secs(n)
    } else {
        Duration::from_millis(n)
    }
}

/// Parse an annotated duration string: `<number><unit>`, unit one of
/// `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`, `d`, case-insensitive, with
/// underscores allowed in the numeric part for readability (`"1_500ms"`).
pub fn parse_duration_str(raw: &str) -> Result<Duration, ConfigError> {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();

    let split_at = lower
        .find(|c: char| c.is_alphabetic() || c == '\u{b5}')
        .ok_or_else(|| ConfigError::InvalidDuration(raw.to_string()))?;
    let (num_part, unit_part) = lower.split_at(split_at);
    let cleaned_num: String = num_part.chars().filter(|c| *c != '_').collect();

    let unit = unit_part.trim();
    let invalid = || ConfigError::InvalidDuration(raw.to_string());

    if let Ok(whole) = cleaned_num.parse::<u64>() {
        return Ok(apply_unit_int(whole, unit).ok_or_else(invalid)?);
    }
    let value: f64 = cleaned_num.parse().map_err(|_| invalid())?;
    apply_unit_float(value, unit).ok_or_else(invalid)
}

fn apply_unit_int(value: u64, unit: &str) -> Option<Duration> {
    match unit {
        "ns" => Some(Duration::from_nanos(value)),
        "us" | "\u{b5}s" => Some(Duration::from_micros(value)),
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        "d" => Some(Duration::from_secs(value * 86_400)),
        _ => None,
    }
}

fn apply_unit_float(value: f64, unit: &str) -> Option<Duration> {
    let seconds = match unit {
        "ns" => value / 1e9,
        "us" | "\u{b5}s" => value / 1e6,
        "ms" => value / 1e3,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        "d" => value * 86_400.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(seconds))
}

/// Parse a list of duration values, normalizing each element.
pub fn parse_duration_list(value: &serde_json::Value) -> Result<Vec<Duration>, ConfigError> {
    match value {
        serde_json::Value::Array(items) => items.iter().map(parse_duration_value).collect(),
        other => parse_duration_value(other).map(|d| vec![d]),
    }
}

/// `serde` deserializer for a single flexible duration field.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    parse_duration_value(&value).map_err(de::Error::custom)
}

/// `serde` deserializer for a list of flexible duration fields.
pub fn deserialize_duration_list<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    parse_duration_list(&value).map_err(de::Error::custom)
}
