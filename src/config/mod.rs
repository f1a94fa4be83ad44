//! Application configuration.
//!
//! The configuration is loaded from a YAML file via the `config` crate. Every
//! tunable carries a serde default so a minimal file only needs the database
//! and broker URLs. Durations are written in the unit their field name
//! carries (`*_ms` or `*_secs`).

mod app_config;
mod retry;

pub use app_config::{AppConfig, WebhookSettings};
pub use retry::{HttpRetryConfig, JitterSetting, RetryPolicy};

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Deserializes a `Duration` from a millisecond integer.
pub fn deserialize_duration_from_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let ms = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(ms))
}

/// Deserializes a `Duration` from a second integer.
pub fn deserialize_duration_from_seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

/// Serializes a `Duration` as a millisecond integer.
pub fn serialize_duration_to_ms<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Serializes a `Duration` as a second integer.
pub fn serialize_duration_to_seconds<S>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}
