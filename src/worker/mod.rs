//! The parsing worker.
//!
//! Workers are stateless and horizontally scalable: each consumes
//! `check.requests`, leases a proxy, drives the fetcher, and publishes the
//! classified outcome onto `check.results`. Retries are message requeues
//! with a delay, so a worker never sleeps while holding a lease.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{publish_with_retry, BusError, Delivery, MessageBus, CHECK_REQUESTS_QUEUE, CHECK_RESULTS_QUEUE},
    config::{AppConfig, RetryPolicy},
    fetcher::{FetchError, Fetcher},
    models::messages::{CheckFailureKind, CheckRequest, CheckResult},
    persistence::PersistenceError,
    proxies::ProxyManager,
};

/// Errors surfaced by the worker loop.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A bus operation failed.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// A proxy-pool operation failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// A message could not be serialized.
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Worker tunables, extracted from the application configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Retry schedule for classified fetch failures.
    pub fetch_retry: RetryPolicy,
    /// Retry policy for publishing results.
    pub publish_retry: RetryPolicy,
    /// Requeue delay when no proxy is leasable.
    pub proxy_wait_delay: Duration,
    /// Unacknowledged message window for the consumer.
    pub prefetch: u16,
}

impl WorkerConfig {
    /// Extracts the worker tunables from the application configuration.
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            fetch_retry: config.fetch_retry.clone(),
            publish_retry: config.bus_publish_retry.clone(),
            proxy_wait_delay: config.proxy_wait_delay_ms,
            prefetch: config.worker_prefetch,
        }
    }
}

/// Consumes check requests and publishes check results.
pub struct CheckWorker {
    bus: Arc<dyn MessageBus>,
    proxies: Arc<ProxyManager>,
    fetcher: Arc<dyn Fetcher>,
    config: WorkerConfig,
}

impl CheckWorker {
    /// Creates a worker over the given collaborators.
    pub fn new(
        bus: Arc<dyn MessageBus>,
        proxies: Arc<ProxyManager>,
        fetcher: Arc<dyn Fetcher>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            bus,
            proxies,
            fetcher,
            config,
        }
    }

    /// Runs the consume loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        let mut deliveries = self
            .bus
            .consume(CHECK_REQUESTS_QUEUE, self.config.prefetch)
            .await?;
        tracing::info!("parsing worker started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("parsing worker stopping");
                    return Ok(());
                }
                delivery = deliveries.recv() => {
                    let Some(delivery) = delivery else {
                        return Err(WorkerError::Bus(BusError::Closed));
                    };
                    self.handle_delivery(delivery).await?;
                }
            }
        }
    }

    /// Processes one delivery. Malformed payloads are acknowledged and
    /// dropped; infrastructure failures requeue the message.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<(), WorkerError> {
        let request: CheckRequest = match serde_json::from_slice(&delivery.payload) {
            Ok(request) => request,
            Err(error) => {
                tracing::error!(error = %error, "dropping malformed check request");
                delivery.ack().await?;
                return Ok(());
            }
        };

        match self.process_request(&request).await {
            Ok(()) => delivery.ack().await?,
            Err(error) => {
                tracing::error!(
                    task_id = request.task_id,
                    correlation_id = %request.correlation_id,
                    error = %error,
                    "check request processing failed, requeueing"
                );
                delivery.requeue().await?;
            }
        }
        Ok(())
    }

    /// Drives one check request through the proxy pool and the fetcher.
    pub async fn process_request(&self, request: &CheckRequest) -> Result<(), WorkerError> {
        let Some(lease) = self.proxies.acquire().await? else {
            tracing::warn!(
                task_id = request.task_id,
                attempt = request.attempt,
                "no proxy available for check request"
            );
            return self
                .retry_or_fail(request, CheckFailureKind::Transport, self.config.proxy_wait_delay)
                .await;
        };

        match self.fetcher.fetch_listings(&request.url, &lease).await {
            Ok(listings) => {
                self.proxies.report_success(&lease).await?;
                tracing::debug!(
                    task_id = request.task_id,
                    listings = listings.len(),
                    "fetch succeeded"
                );
                self.publish_result(CheckResult::success(request, listings))
                    .await
            }
            Err(FetchError::RateLimited) => {
                self.proxies.report_rate_limit(&lease).await?;
                self.retry_or_fail(
                    request,
                    CheckFailureKind::RateLimited,
                    self.config.fetch_retry.delay_for(request.attempt),
                )
                .await
            }
            Err(FetchError::Upstream(status)) => {
                // Upstream outages follow the rate-limit retry schedule, but
                // the proxy is not at fault and keeps its record.
                tracing::warn!(
                    task_id = request.task_id,
                    status,
                    "upstream server error during fetch"
                );
                self.retry_or_fail(
                    request,
                    CheckFailureKind::Transport,
                    self.config.fetch_retry.delay_for(request.attempt),
                )
                .await
            }
            Err(FetchError::Transport(reason)) => {
                self.proxies.report_transport_failure(&lease).await?;
                tracing::warn!(
                    task_id = request.task_id,
                    reason = %reason,
                    "transport failure during fetch"
                );
                self.retry_or_fail(
                    request,
                    CheckFailureKind::Transport,
                    self.config.fetch_retry.delay_for(request.attempt),
                )
                .await
            }
            Err(FetchError::Parse(reason)) => {
                // The egress path worked; the page shape did not. No retry.
                self.proxies.report_success(&lease).await?;
                tracing::error!(
                    task_id = request.task_id,
                    reason = %reason,
                    "listing payload could not be parsed"
                );
                self.publish_result(CheckResult::failure(request, CheckFailureKind::Parse))
                    .await
            }
        }
    }

    /// Requeues the request with a delay, or publishes a failed result once
    /// the attempt budget is spent.
    async fn retry_or_fail(
        &self,
        request: &CheckRequest,
        kind: CheckFailureKind,
        delay: Duration,
    ) -> Result<(), WorkerError> {
        if self.config.fetch_retry.is_exhausted(request.attempt) {
            tracing::warn!(
                task_id = request.task_id,
                attempt = request.attempt,
                ?kind,
                "retry budget exhausted, publishing failed result"
            );
            return self
                .publish_result(CheckResult::failure(request, kind))
                .await;
        }

        let retry = request.next_attempt();
        let payload = serde_json::to_vec(&retry)?;
        self.bus
            .publish_delayed(CHECK_REQUESTS_QUEUE, &payload, delay)
            .await?;
        tracing::debug!(
            task_id = request.task_id,
            attempt = retry.attempt,
            delay_ms = delay.as_millis() as u64,
            "check request requeued"
        );
        Ok(())
    }

    async fn publish_result(&self, result: CheckResult) -> Result<(), WorkerError> {
        let payload = serde_json::to_vec(&result)?;
        publish_with_retry(
            self.bus.as_ref(),
            &self.config.publish_retry,
            CHECK_RESULTS_QUEUE,
            &payload,
        )
        .await?;
        Ok(())
    }
}
