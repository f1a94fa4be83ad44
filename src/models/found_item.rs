//! De-duplication records for already-notified matches.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A match that has been recorded (and notified) for a task.
///
/// Rows are insert-only: `first_seen_at` is never rewritten and the
/// `(task_id, fingerprint)` pair is unique, which is the sole mechanism
/// guaranteeing at-most-once notification under at-least-once delivery.
#[derive(Debug, Clone)]
pub struct FoundItem {
    /// Unique identifier.
    pub id: i64,

    /// Task this match belongs to.
    pub task_id: i64,

    /// Stable listing fingerprint.
    pub fingerprint: String,

    /// Price of the listing when first observed, in cents.
    pub price_cents: i64,

    /// When the match was first observed.
    pub first_seen_at: DateTime<Utc>,

    /// Opaque payload summary of the listing.
    pub raw: Value,
}
