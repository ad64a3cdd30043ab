//! Helpers for serializing and deserializing [`Duration`] as seconds.
//!
//! Whole durations are written as integers, sub-second ones as fractional seconds. Both forms
//! are accepted when reading.

use serde::{Deserialize, Deserializer, Serializer, de::Error};
use std::time::Duration;

/// Serializes [`Duration`] as seconds.
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

/// Deserializes seconds into a [`Duration`].
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Whole(u64),
        Fractional(f64),
    }

    match Seconds::deserialize(deserializer)? {
        Seconds::Whole(secs) => Ok(Duration::from_secs(secs)),
        Seconds::Fractional(secs) => Duration::try_from_secs_f64(secs).map_err(D::Error::custom),
    }
}
