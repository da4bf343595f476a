//! Human-friendly durations: `90`, `"90s"`, `"2m"`, `"1h30m"`, `"1d"`, `"1w"`.
//!
//! A bare number is a count of seconds; anything else goes through `humantime`.

use serde::{Deserialize, Deserializer};
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("invalid duration '{value}': {reason}")]
pub struct InvalidDuration {
    pub value: String,
    pub reason: String,
}

/// Parse a duration string.
///
/// # Errors
/// Returns `InvalidDuration` for input `humantime` rejects, e.g. empty input,
/// unknown units, a trailing number without unit or overflow.
pub fn parse(value: &str) -> Result<Duration, InvalidDuration> {
    let trimmed = value.trim();
    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    humantime::parse_duration(trimmed).map_err(|err| InvalidDuration {
        value: value.to_string(),
        reason: err.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

/// `#[serde(with = "duration")]` entry point.
///
/// # Errors
/// Returns a deserialization error for values `parse` rejects.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(seconds) => Ok(Duration::from_secs(seconds)),
        RawDuration::Text(text) => parse(&text).map_err(serde::de::Error::custom),
    }
}
