//! Action execution seam.
//!
//! The engine hands every fulfilled schedule to an [`ActionExecutor`] once per
//! fulfillment cycle. Dispatch is at-least-once, so executors should tolerate
//! seeing the same schedule again after a restart.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::automation::types::Schedule;
use crate::error::{AutomationError, AutomationResult};

/// Runs the actions of a fulfilled schedule.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, schedule: &Schedule) -> AutomationResult<()>;
}

/// Executor that only logs the actions it receives.
#[derive(Debug, Default, Clone)]
pub struct LoggingExecutor;

#[async_trait]
impl ActionExecutor for LoggingExecutor {
    async fn execute(&self, schedule: &Schedule) -> AutomationResult<()> {
        tracing::info!(
            schedule_id = %schedule.id,
            group = ?schedule.group(),
            execution_count = schedule.execution_count,
            actions = %serde_json::Value::Object(schedule.info.actions.clone()),
            "Executing schedule actions"
        );
        Ok(())
    }
}

/// Executor that forwards schedules to a channel for an embedding application.
#[derive(Debug, Clone)]
pub struct ChannelExecutor {
    sender: mpsc::UnboundedSender<Schedule>,
}

impl ChannelExecutor {
    /// Create the executor and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Schedule>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ActionExecutor for ChannelExecutor {
    async fn execute(&self, schedule: &Schedule) -> AutomationResult<()> {
        self.sender
            .send(schedule.clone())
            .map_err(|_| AutomationError::execution(&schedule.id, "action receiver dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::types::{ExecutionState, ScheduleInfo, Trigger};

    fn schedule() -> Schedule {
        Schedule {
            id: "id".to_string(),
            info: ScheduleInfo::new()
                .with_trigger(Trigger::app_init(1.0))
                .with_action("greet", "hello"),
            execution_count: 1,
            execution_state: ExecutionState::Dispatching,
            delayed_execution_timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_channel_executor_forwards() {
        let (executor, mut rx) = ChannelExecutor::new();
        executor.execute(&schedule()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, "id");
    }

    #[tokio::test]
    async fn test_channel_executor_fails_without_receiver() {
        let (executor, rx) = ChannelExecutor::new();
        drop(rx);
        let err = executor.execute(&schedule()).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ExecFailed);
    }

    #[tokio::test]
    async fn test_logging_executor_succeeds() {
        assert!(LoggingExecutor.execute(&schedule()).await.is_ok());
    }
}
