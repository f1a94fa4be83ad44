//! Durable message bus seam.
//!
//! Two logical queues connect the subsystems: `check.requests` (scheduler to
//! workers) and `check.results` (workers to the result processor). Delivery
//! is at-least-once; consumers acknowledge explicitly and downstream writes
//! are idempotent.

pub mod memory;
pub mod rabbitmq;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::RetryPolicy;

/// Queue carrying check requests from the scheduler to the workers.
pub const CHECK_REQUESTS_QUEUE: &str = "check.requests";

/// Queue carrying check results from the workers to the result processor.
pub const CHECK_RESULTS_QUEUE: &str = "check.results";

/// Errors surfaced by bus implementations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker rejected or failed the operation.
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    /// The consumer or internal channel was closed.
    #[error("bus channel closed")]
    Closed,

    /// A message payload could not be serialized.
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One consumed message plus its acknowledgement handle.
pub struct Delivery {
    /// Raw message payload.
    pub payload: Vec<u8>,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    /// Wraps a payload with its acknowledgement handle.
    pub fn new(payload: Vec<u8>, acker: Box<dyn Acknowledge>) -> Self {
        Self { payload, acker }
    }

    /// Acknowledges the message; the broker may now discard it.
    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    /// Returns the message to the queue for redelivery.
    pub async fn requeue(self) -> Result<(), BusError> {
        self.acker.nack(true).await
    }
}

/// Acknowledgement operations backing a [`Delivery`].
#[async_trait]
pub trait Acknowledge: Send {
    /// Confirms processing of the message.
    async fn ack(self: Box<Self>) -> Result<(), BusError>;
    /// Rejects the message, optionally requeueing it.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BusError>;
}

/// A durable at-least-once message broker.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes a message onto a queue, waiting for broker confirmation.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BusError>;

    /// Publishes a message that becomes consumable only after `delay`.
    async fn publish_delayed(
        &self,
        queue: &str,
        payload: &[u8],
        delay: Duration,
    ) -> Result<(), BusError>;

    /// Starts consuming a queue with the given unacknowledged-message window.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<mpsc::Receiver<Delivery>, BusError>;
}

/// Serializes a value and publishes it.
pub async fn publish_json<T: Serialize>(
    bus: &dyn MessageBus,
    queue: &str,
    value: &T,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(value)?;
    bus.publish(queue, &payload).await
}

/// Publishes with the named retry policy, backing off while the broker is
/// unavailable. The payload stays in memory until the broker confirms.
pub async fn publish_with_retry(
    bus: &dyn MessageBus,
    policy: &RetryPolicy,
    queue: &str,
    payload: &[u8],
) -> Result<(), BusError> {
    let mut attempt = 0;
    loop {
        match bus.publish(queue, payload).await {
            Ok(()) => return Ok(()),
            Err(error) if !policy.is_exhausted(attempt) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    queue,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "bus publish failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
