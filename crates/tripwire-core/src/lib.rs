//! tripwire-core - Core library for tripwire.
//!
//! This crate provides a durable, event-driven automation engine: schedules
//! guarded by triggers that accumulate progress across events, with delays,
//! execution limits and time windows.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tripwire_core::{AutomationRuntime, EngineConfig, LoggingExecutor, ScheduleInfo, Trigger};
//!
//! let runtime = AutomationRuntime::new(EngineConfig::default(), Arc::new(LoggingExecutor))?;
//! runtime.start().await?;
//!
//! // Fire once the "purchase" event has been tracked twice
//! let schedule = runtime
//!     .automation()
//!     .schedule(
//!         ScheduleInfo::new()
//!             .with_trigger(Trigger::custom_event_count("purchase", 2.0))
//!             .with_action("show_message", "thanks"),
//!     )
//!     .await?;
//! ```

pub mod automation;
pub mod config;
pub mod error;
pub mod events;
pub mod runtime;

// Re-export commonly used types
pub use automation::{
    ActionExecutor, AppState, Automation, AutomationStore, ChannelExecutor, ExecutionState,
    LoggingExecutor, PendingResult, ProgressPolicy, Schedule, ScheduleDelay, ScheduleInfo,
    SqliteAutomationStore, Trigger, TriggerType,
};
pub use config::EngineConfig;
pub use error::{AutomationError, AutomationResult, ErrorCode};
pub use events::{AutomationEvent, CustomEvent, EventBus, RegionEvent};
pub use runtime::AutomationRuntime;
