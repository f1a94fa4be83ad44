//! Monitoring task model.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filters::FilterDoc;

/// Parameters for creating a monitoring task, before it is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Owner the task belongs to (chat-bot user id).
    pub owner_id: i64,

    /// Human-readable task name.
    pub name: String,

    /// Item listing URL the task monitors.
    pub url: String,

    /// Structured filter document.
    #[serde(default)]
    pub filters: FilterDoc,

    /// Desired check interval in seconds; clamped to the enforced minimum on
    /// creation.
    pub check_interval_secs: i64,
}

impl TaskConfig {
    /// Clamps the check interval to the enforced minimum.
    pub fn clamp_interval(&mut self, min_interval: Duration) {
        let min_secs = min_interval.as_secs() as i64;
        if self.check_interval_secs < min_secs {
            tracing::warn!(
                requested = self.check_interval_secs,
                clamped_to = min_secs,
                "check interval below the enforced minimum, clamping"
            );
            self.check_interval_secs = min_secs;
        }
    }
}

/// A monitoring task as stored in the database.
#[derive(Debug, Clone)]
pub struct MonitoringTask {
    /// Unique identifier.
    pub id: i64,

    /// Owner the task belongs to.
    pub owner_id: i64,

    /// Human-readable task name.
    pub name: String,

    /// Item listing URL the task monitors.
    pub url: String,

    /// Structured filter document.
    pub filters: FilterDoc,

    /// Check interval in seconds.
    pub check_interval_secs: i64,

    /// Whether the task is currently scheduled.
    pub is_active: bool,

    /// Number of completed checks. Advanced by the result processor only.
    pub total_checks: i64,

    /// Time of the last issued check, if any.
    pub last_check: Option<DateTime<Utc>>,

    /// Time the next check is due.
    pub next_check: DateTime<Utc>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl MonitoringTask {
    /// Effective scheduling interval, never below the enforced minimum.
    pub fn effective_interval(&self, min_interval: Duration) -> chrono::Duration {
        let secs = self.check_interval_secs.max(min_interval.as_secs() as i64);
        chrono::Duration::seconds(secs)
    }

    /// Whether a check is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_check
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_below_minimum_is_clamped() {
        let mut config = TaskConfig {
            owner_id: 1,
            name: "redlines".to_string(),
            url: "https://steamcommunity.com/market/listings/730/AK-47".to_string(),
            filters: FilterDoc::default(),
            check_interval_secs: 5,
        };
        config.clamp_interval(Duration::from_secs(30));
        assert_eq!(config.check_interval_secs, 30);

        config.check_interval_secs = 90;
        config.clamp_interval(Duration::from_secs(30));
        assert_eq!(config.check_interval_secs, 90);
    }

    #[test]
    fn effective_interval_enforces_floor() {
        let task = MonitoringTask {
            id: 1,
            owner_id: 1,
            name: "t".to_string(),
            url: "u".to_string(),
            filters: FilterDoc::default(),
            check_interval_secs: 10,
            is_active: true,
            total_checks: 0,
            last_check: None,
            next_check: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(
            task.effective_interval(Duration::from_secs(30)),
            chrono::Duration::seconds(30)
        );
    }
}
