//! Automation runtime.
//!
//! Wires the SQLite store, event bus and engine together and manages their
//! lifecycle, providing unified startup and graceful shutdown.

use std::sync::Arc;

use tracing::{debug, info};

use crate::automation::{
    ActionExecutor, Automation, AutomationStore, Schedule, ScheduleInfo, SqliteAutomationStore,
};
use crate::config::EngineConfig;
use crate::error::AutomationResult;
use crate::events::{AutomationEvent, EventBus};

/// Runtime owning an automation engine and its collaborators.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use tripwire_core::{AutomationRuntime, EngineConfig, LoggingExecutor};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = EngineConfig::from_env()?;
///     let runtime = AutomationRuntime::new(config, Arc::new(LoggingExecutor))?;
///
///     runtime.start().await?;
///     runtime.bus().emit(AutomationEvent::Foreground);
///
///     runtime.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct AutomationRuntime {
    automation: Arc<Automation>,
    store: Arc<dyn AutomationStore>,
    bus: EventBus,
    config: EngineConfig,
}

impl AutomationRuntime {
    /// Create a runtime with the given configuration.
    ///
    /// This opens the store and builds the engine but does not start it.
    pub fn new(config: EngineConfig, executor: Arc<dyn ActionExecutor>) -> AutomationResult<Self> {
        debug!(
            db_path = ?config.db_path,
            bus_capacity = config.event_bus_capacity,
            start_paused = config.start_paused,
            "Creating AutomationRuntime"
        );

        let store: Arc<dyn AutomationStore> = match &config.db_path {
            Some(path) => {
                debug!(path = %path.display(), "Creating file-backed automation store");
                Arc::new(SqliteAutomationStore::new(path)?)
            }
            None => {
                debug!("Creating in-memory automation store");
                Arc::new(SqliteAutomationStore::in_memory()?)
            }
        };

        let bus = EventBus::with_capacity(config.event_bus_capacity);
        let automation = Arc::new(Automation::new(
            store.clone(),
            executor,
            bus.clone(),
            config.clone(),
        ));

        Ok(Self {
            automation,
            store,
            bus,
            config,
        })
    }

    /// Start the engine and announce app initialization.
    pub async fn start(&self) -> AutomationResult<()> {
        self.start_with_schedules(Vec::new()).await.map(|_| ())
    }

    /// Start the engine, store `seed` and only then announce app
    /// initialization, so seeded app-init triggers see the event.
    pub async fn start_with_schedules(
        &self,
        seed: Vec<ScheduleInfo>,
    ) -> AutomationResult<Vec<Schedule>> {
        self.automation.start().await?;
        let seeded = if seed.is_empty() {
            Vec::new()
        } else {
            self.automation.schedule_all(seed).await?
        };
        self.bus.emit(AutomationEvent::AppInit);
        info!(seeded = seeded.len(), "Automation runtime started");
        Ok(seeded)
    }

    /// Tear the engine down.
    pub async fn shutdown(&self) {
        self.automation.tear_down().await;
        info!("Automation runtime stopped");
    }

    /// Get the engine.
    pub fn automation(&self) -> Arc<Automation> {
        self.automation.clone()
    }

    /// Get the store.
    pub fn store(&self) -> Arc<dyn AutomationStore> {
        self.store.clone()
    }

    /// Get the event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Get the runtime configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
