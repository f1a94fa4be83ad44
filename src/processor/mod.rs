//! The result processor.
//!
//! Consumes `check.results` under the session discipline: every message is
//! handled on a fresh session. Counters advance here, on result receipt, so
//! `total_checks` reflects completed work rather than issued work. New
//! matches are recorded with an insert guarded by the unique
//! `(task_id, fingerprint)` constraint, and the notifier fires only when the
//! insert affected a row; that constraint is the sole mechanism keeping
//! notifications at-most-once under at-least-once delivery.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{BusError, Delivery, MessageBus, CHECK_RESULTS_QUEUE},
    models::messages::{CheckResult, MatchNotification},
    notifier::Notifier,
    persistence::{PersistenceError, Store},
};

/// Errors surfaced by the result processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// A bus operation failed.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// A store operation failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// A stored document could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Consumes check results, records matches, and emits notifications.
pub struct ResultProcessor {
    store: Store,
    bus: Arc<dyn MessageBus>,
    notifier: Arc<dyn Notifier>,
    prefetch: u16,
}

impl ResultProcessor {
    /// Creates a processor over the given collaborators.
    pub fn new(
        store: Store,
        bus: Arc<dyn MessageBus>,
        notifier: Arc<dyn Notifier>,
        prefetch: u16,
    ) -> Self {
        Self {
            store,
            bus,
            notifier,
            prefetch,
        }
    }

    /// Runs the consume loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ProcessorError> {
        let mut deliveries = self.bus.consume(CHECK_RESULTS_QUEUE, self.prefetch).await?;
        tracing::info!("result processor started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("result processor stopping");
                    return Ok(());
                }
                delivery = deliveries.recv() => {
                    let Some(delivery) = delivery else {
                        return Err(ProcessorError::Bus(BusError::Closed));
                    };
                    self.handle_delivery(delivery).await?;
                }
            }
        }
    }

    /// Processes one delivery. Malformed payloads are acknowledged and
    /// dropped; store failures requeue the message for redelivery.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<(), ProcessorError> {
        let result: CheckResult = match serde_json::from_slice(&delivery.payload) {
            Ok(result) => result,
            Err(error) => {
                tracing::error!(error = %error, "dropping malformed check result");
                delivery.ack().await?;
                return Ok(());
            }
        };

        match self.apply_result(&result).await {
            Ok(()) => delivery.ack().await?,
            Err(error) => {
                tracing::error!(
                    task_id = result.task_id,
                    correlation_id = %result.correlation_id,
                    error = %error,
                    "check result processing failed, requeueing"
                );
                delivery.requeue().await?;
            }
        }
        Ok(())
    }

    /// Applies one check result on a dedicated session.
    pub async fn apply_result(&self, result: &CheckResult) -> Result<(), ProcessorError> {
        let mut session = self.store.session().await?;

        let Some(task) = session.fetch_task(result.task_id).await? else {
            tracing::debug!(task_id = result.task_id, "result for a deleted task dropped");
            return Ok(());
        };
        if !task.is_active {
            tracing::debug!(task_id = task.id, "result for an inactive task dropped");
            return Ok(());
        }

        // Counts completed checks, successful or not.
        session.bump_total_checks(task.id).await?;

        if !result.ok {
            tracing::debug!(
                task_id = task.id,
                kind = ?result.kind,
                "failed check result recorded"
            );
            return Ok(());
        }

        let mut new_matches = 0usize;
        for listing in &result.listings {
            if !task.filters.matches(listing) {
                continue;
            }

            let fingerprint = listing.fingerprint(task.id);
            let raw = serde_json::to_value(listing)?;
            let inserted = session
                .record_found_item(task.id, &fingerprint, listing.price_cents, &raw)
                .await?;
            if !inserted {
                tracing::debug!(
                    task_id = task.id,
                    fingerprint = %fingerprint,
                    "listing already recorded, not notifying"
                );
                continue;
            }

            new_matches += 1;
            let event = MatchNotification {
                task_id: task.id,
                task_name: task.name.clone(),
                owner_id: task.owner_id,
                item_name: listing.item_name.clone(),
                price_cents: listing.price_cents,
                listing_fingerprint: fingerprint,
                url: task.url.clone(),
                found_at: result.fetched_at,
            };
            // Fire and forget: the insert has already committed, so a
            // delivery failure must not fail (and thereby replay) the
            // message.
            if let Err(error) = self.notifier.notify_match(&event).await {
                tracing::error!(
                    task_id = task.id,
                    error = %error,
                    "match notification delivery failed"
                );
            }
        }

        if new_matches > 0 {
            tracing::info!(
                task_id = task.id,
                new_matches,
                listings = result.listings.len(),
                "new matches recorded"
            );
        }
        Ok(())
    }
}
