//! The supervisor owns the long-running services of the `run` entrypoint
//! (the monitoring scheduler and the result processor) and manages their
//! startup, shutdown signals, and graceful drain.

mod builder;

pub use builder::SupervisorBuilder;

use std::sync::Arc;

use thiserror::Error;
use tokio::{signal, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    config::AppConfig,
    persistence::{PersistenceError, Store},
    processor::ResultProcessor,
    scheduler::{MonitoringScheduler, SchedulerError},
};

/// Errors that can occur while assembling or running the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No configuration was provided to the builder.
    #[error("missing configuration for supervisor")]
    MissingConfig,

    /// No store was provided to the builder.
    #[error("missing store for supervisor")]
    MissingStore,

    /// No message bus was provided to the builder.
    #[error("missing message bus for supervisor")]
    MissingBus,

    /// No notifier was provided to the builder.
    #[error("missing notifier for supervisor")]
    MissingNotifier,

    /// The scheduler failed to start.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// A store operation failed during startup or shutdown.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// The primary runtime manager for the `run` entrypoint.
pub struct Supervisor {
    config: AppConfig,
    store: Store,
    scheduler: MonitoringScheduler,
    processor: Arc<ResultProcessor>,
    cancellation_token: CancellationToken,
    join_set: JoinSet<()>,
}

impl Supervisor {
    pub(crate) fn new(
        config: AppConfig,
        store: Store,
        scheduler: MonitoringScheduler,
        processor: Arc<ResultProcessor>,
    ) -> Self {
        Self {
            config,
            store,
            scheduler,
            processor,
            cancellation_token: CancellationToken::new(),
            join_set: JoinSet::new(),
        }
    }

    /// Returns a new builder.
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::new()
    }

    /// Starts all services and blocks until shutdown completes.
    ///
    /// Shutdown begins on SIGINT/SIGTERM or when a critical service fails;
    /// it cancels all loops cooperatively, waits up to the configured grace
    /// deadline, and closes the store.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        let cancellation_token = self.cancellation_token.clone();
        self.join_set.spawn(async move {
            let ctrl_c = signal::ctrl_c();
            #[cfg(unix)]
            let terminate = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut stream) => {
                        stream.recv().await;
                    }
                    Err(error) => {
                        tracing::error!(error = %error, "failed to register SIGTERM handler");
                        std::future::pending::<()>().await;
                    }
                }
            };
            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => tracing::info!("SIGINT received, initiating graceful shutdown"),
                _ = terminate => tracing::info!("SIGTERM received, initiating graceful shutdown"),
            }
            cancellation_token.cancel();
        });

        self.scheduler.start().await?;

        let processor = Arc::clone(&self.processor);
        let processor_token = self.cancellation_token.child_token();
        let cancel_on_failure = self.cancellation_token.clone();
        self.join_set.spawn(async move {
            if let Err(error) = processor.run(processor_token).await {
                tracing::error!(error = %error, "result processor failed, initiating shutdown");
                cancel_on_failure.cancel();
            }
        });

        tracing::info!("supervisor running");
        loop {
            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    tracing::info!("supervisor cancellation signal received, shutting down");
                    break;
                }

                joined = self.join_set.join_next() => {
                    match joined {
                        Some(Err(error)) => {
                            tracing::error!(error = %error, "a supervised task panicked, initiating shutdown");
                            self.cancellation_token.cancel();
                        }
                        Some(Ok(())) => continue,
                        None => break,
                    }
                }
            }
        }

        // Graceful drain: scheduler loops first, then the remaining tasks.
        self.scheduler.stop(self.config.shutdown_timeout_secs).await;
        self.join_set.shutdown().await;
        self.store.close().await;
        tracing::info!("supervisor shutdown complete");
        Ok(())
    }
}
