//! Retry policies.
//!
//! Every retry site in the crate refers to a named [`RetryPolicy`] instance
//! from the application configuration instead of hand-rolling its own delay
//! arithmetic. [`HttpRetryConfig`] is the variant consumed by the HTTP
//! middleware stack used for webhook delivery.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{
    deserialize_duration_from_ms, deserialize_duration_from_seconds, serialize_duration_to_ms,
    serialize_duration_to_seconds,
};

/// Jitter applied to computed backoff delays.
#[derive(Default, Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JitterSetting {
    /// Delays are used exactly as computed.
    None,
    /// Delays are randomized over `[0, computed]`.
    #[default]
    Full,
}

/// A bounded exponential backoff policy.
///
/// The delay before retrying attempt `n` (zero-based) is
/// `base_delay * factor^n`, capped at `max_delay` and optionally jittered.
/// `max_attempts` bounds how many retries a site may schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries before the site gives up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(
        default = "default_base_delay",
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub base_delay_ms: Duration,
    /// Multiplier applied for each further attempt.
    #[serde(default = "default_factor")]
    pub factor: u32,
    /// Upper bound on any single delay.
    #[serde(
        default = "default_max_delay",
        deserialize_with = "deserialize_duration_from_seconds",
        serialize_with = "serialize_duration_to_seconds"
    )]
    pub max_delay_secs: Duration,
    /// Jitter applied to each delay.
    #[serde(default)]
    pub jitter: JitterSetting,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_factor() -> u32 {
    2
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            factor: default_factor(),
            max_delay_secs: default_max_delay(),
            jitter: JitterSetting::None,
        }
    }
}

impl RetryPolicy {
    /// Returns true once `attempt` (zero-based) has used up the retry budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Computes the delay to wait before retrying the given attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.factor).saturating_pow(attempt.min(32));
        let raw = self
            .base_delay_ms
            .saturating_mul(factor.min(u64::from(u32::MAX)) as u32)
            .min(self.max_delay_secs);
        match self.jitter {
            JitterSetting::None => raw,
            JitterSetting::Full => {
                if raw.is_zero() {
                    raw
                } else {
                    let millis = rand::thread_rng().gen_range(0..=raw.as_millis() as u64);
                    Duration::from_millis(millis)
                }
            }
        }
    }
}

/// Retry configuration for the webhook HTTP client middleware.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HttpRetryConfig {
    /// Maximum number of retries for transient HTTP errors.
    #[serde(default = "default_max_attempts")]
    pub max_retries: u32,
    /// Base of the exponential backoff computation.
    #[serde(default = "default_factor")]
    pub base_for_backoff: u32,
    /// Initial backoff delay before the first retry.
    #[serde(
        default = "default_http_initial_backoff",
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub initial_backoff_ms: Duration,
    /// Maximum backoff delay.
    #[serde(
        default = "default_http_max_backoff",
        deserialize_with = "deserialize_duration_from_seconds",
        serialize_with = "serialize_duration_to_seconds"
    )]
    pub max_backoff_secs: Duration,
    /// Jitter applied to the middleware backoff.
    #[serde(default)]
    pub jitter: JitterSetting,
}

fn default_http_initial_backoff() -> Duration {
    Duration::from_millis(250)
}

fn default_http_max_backoff() -> Duration {
    Duration::from_secs(10)
}

impl Default for HttpRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_attempts(),
            base_for_backoff: default_factor(),
            initial_backoff_ms: default_http_initial_backoff(),
            max_backoff_secs: default_http_max_backoff(),
            jitter: JitterSetting::default(),
        }
    }
}
