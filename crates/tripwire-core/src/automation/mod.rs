//! Event-driven automation.
//!
//! Schedules pair triggers with actions. Triggers accumulate progress from
//! matching events; once every trigger of a schedule reaches its goal the
//! schedule fires, optionally waits on a delay, and its actions are handed to
//! an [`ActionExecutor`].

mod clock;
mod delay;
mod engine;
mod executor;
mod predicate;
mod store;
mod types;

pub use clock::{Clock, TokioClock};
pub use delay::AppStateSnapshot;
pub use engine::{Automation, PendingResult};
pub use executor::{ActionExecutor, ChannelExecutor, LoggingExecutor};
pub use predicate::{evaluate, evaluate_trigger, Matcher, MatchResult, Predicate, PredicateCache};
pub use store::{AutomationStore, SqliteAutomationStore, StoreUpdate, UpdateOp};
pub use types::{
    AppState, ExecutionState, ProgressPolicy, Schedule, ScheduleDelay, ScheduleInfo, Trigger,
    TriggerEntry, TriggerType,
};
