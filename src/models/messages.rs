//! Bus message payloads exchanged between the scheduler, workers, and the
//! result processor. All messages are JSON on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{filters::FilterDoc, models::listing::Listing};

/// A check request published by the scheduler onto `check.requests`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Task the check belongs to.
    pub task_id: i64,

    /// Listing URL to fetch.
    pub url: String,

    /// Filter document snapshot taken at publish time.
    pub filters: FilterDoc,

    /// Zero-based delivery attempt; incremented on every requeue.
    pub attempt: u32,

    /// Correlates the request with its eventual result.
    pub correlation_id: Uuid,
}

impl CheckRequest {
    /// Builds the initial (attempt zero) request for a task.
    pub fn new(task_id: i64, url: String, filters: FilterDoc) -> Self {
        Self {
            task_id,
            url,
            filters,
            attempt: 0,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Derives the follow-up request published on a requeue.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// Failure classification carried on unsuccessful check results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckFailureKind {
    /// The upstream rate-limited the leased proxy.
    RateLimited,
    /// The listing payload could not be parsed.
    Parse,
    /// Transport-level failure (connect, timeout, upstream outage).
    Transport,
}

/// A check outcome published by a worker onto `check.results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Task the check belongs to.
    pub task_id: i64,

    /// Correlation id of the originating request.
    pub correlation_id: Uuid,

    /// Whether listings were fetched successfully.
    pub ok: bool,

    /// Failure classification; present iff `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CheckFailureKind>,

    /// Extracted listings; empty on failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listings: Vec<Listing>,

    /// When the fetch attempt finished.
    pub fetched_at: DateTime<Utc>,
}

impl CheckResult {
    /// Builds a successful result for a request.
    pub fn success(request: &CheckRequest, listings: Vec<Listing>) -> Self {
        Self {
            task_id: request.task_id,
            correlation_id: request.correlation_id,
            ok: true,
            kind: None,
            listings,
            fetched_at: Utc::now(),
        }
    }

    /// Builds a failed result for a request.
    pub fn failure(request: &CheckRequest, kind: CheckFailureKind) -> Self {
        Self {
            task_id: request.task_id,
            correlation_id: request.correlation_id,
            ok: false,
            kind: Some(kind),
            listings: Vec::new(),
            fetched_at: Utc::now(),
        }
    }
}

/// A match event handed to the notifier when a listing is first observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchNotification {
    /// Task that matched.
    pub task_id: i64,

    /// Task name, for the human-readable message.
    pub task_name: String,

    /// Owner to notify.
    pub owner_id: i64,

    /// Matched item name.
    pub item_name: String,

    /// Listing price in cents.
    pub price_cents: i64,

    /// Fingerprint of the matched listing.
    pub listing_fingerprint: String,

    /// Listing URL of the task.
    pub url: String,

    /// When the match was recorded.
    pub found_at: DateTime<Utc>,
}
