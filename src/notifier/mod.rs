//! Match notification delivery.
//!
//! Notification is fire-and-forget from the result processor's point of
//! view: a delivery failure is logged, never propagated, and never blocks
//! acknowledgement of the result message. At-most-once semantics per
//! `(task, fingerprint)` come from the found-items unique constraint, not
//! from this layer.

mod webhook;

pub use webhook::WebhookNotifier;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-helpers"))]
use mockall::automock;
use thiserror::Error;

use crate::models::messages::MatchNotification;

/// Errors from notification delivery.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// The delivery request failed or the endpoint answered non-success.
    #[error("notification request failed: {0}")]
    Request(String),

    /// The notifier configuration is unusable.
    #[error("invalid notifier configuration: {0}")]
    Config(String),

    /// The notification payload could not be serialized.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Delivers a match event to the task's owner.
#[cfg_attr(any(test, feature = "test-helpers"), automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one match event.
    async fn notify_match(&self, event: &MatchNotification) -> Result<(), NotificationError>;
}

/// Development notifier that only logs the event.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_match(&self, event: &MatchNotification) -> Result<(), NotificationError> {
        tracing::info!(
            task_id = event.task_id,
            owner_id = event.owner_id,
            item = %event.item_name,
            price_cents = event.price_cents,
            "match found"
        );
        Ok(())
    }
}
