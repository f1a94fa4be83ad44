//! Assembles the supervisor and wires its services together.

use std::sync::Arc;

use super::{Supervisor, SupervisorError};
use crate::{
    bus::MessageBus,
    config::AppConfig,
    notifier::Notifier,
    persistence::Store,
    processor::ResultProcessor,
    scheduler::{MonitoringScheduler, SchedulerConfig},
};

/// Builder collecting the supervisor's collaborators.
#[derive(Default)]
pub struct SupervisorBuilder {
    config: Option<AppConfig>,
    store: Option<Store>,
    bus: Option<Arc<dyn MessageBus>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl SupervisorBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the application configuration.
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the store.
    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the message bus.
    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Sets the notifier.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Wires the services and returns the supervisor.
    pub fn build(self) -> Result<Supervisor, SupervisorError> {
        let config = self.config.ok_or(SupervisorError::MissingConfig)?;
        let store = self.store.ok_or(SupervisorError::MissingStore)?;
        let bus = self.bus.ok_or(SupervisorError::MissingBus)?;
        let notifier = self.notifier.ok_or(SupervisorError::MissingNotifier)?;

        let scheduler = MonitoringScheduler::new(
            store.clone(),
            Arc::clone(&bus),
            SchedulerConfig::from_app_config(&config),
        );
        let processor = Arc::new(ResultProcessor::new(
            store.clone(),
            bus,
            notifier,
            config.worker_prefetch,
        ));

        Ok(Supervisor::new(config, store, scheduler, processor))
    }
}
