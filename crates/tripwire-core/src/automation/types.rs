//! Automation types.
//!
//! This module defines the core types of the automation system:
//! - `Trigger`: an event category plus predicate and numeric goal
//! - `ScheduleInfo`: triggers, actions, limit, window and delay of a schedule
//! - `Schedule`: a persisted schedule with its execution bookkeeping
//! - `TriggerEntry`: the persisted progress accumulator of one trigger

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use strum::{Display, EnumString, IntoStaticStr};

use crate::error::{AutomationError, AutomationResult, ErrorCode};

/// Event categories a trigger can match.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Counts matching custom events.
    CustomEventCount,
    /// Sums the value of matching custom events.
    CustomEventValue,
    /// Counts entries into a region.
    RegionEnter,
    /// Counts exits from a region.
    RegionExit,
    /// Counts app foregrounds.
    Foreground,
    /// Counts app backgrounds.
    Background,
    /// Counts screen views.
    ScreenView,
    /// Counts app initializations.
    AppInit,
}

impl TriggerType {
    /// Storage name of the trigger type.
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// How progress past the goal is treated once a schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPolicy {
    /// Progress returns to zero; any excess is discarded.
    #[default]
    Reset,
    /// Progress keeps whatever exceeded the goal.
    CarryOver,
}

/// A trigger definition. Immutable once its schedule is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Event category this trigger matches
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Goal the accumulated progress must reach
    pub goal: f64,
    /// Optional JSON predicate over the event payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Value>,
    /// Whether matching cancels a pending delay instead of firing
    #[serde(default)]
    pub is_cancellation: bool,
}

impl Trigger {
    /// Create a trigger with no predicate.
    pub fn new(trigger_type: TriggerType, goal: f64) -> Self {
        Self {
            trigger_type,
            goal,
            predicate: None,
            is_cancellation: false,
        }
    }

    /// Trigger counting custom events with the given name.
    pub fn custom_event_count(event_name: impl Into<String>, goal: f64) -> Self {
        Self::new(TriggerType::CustomEventCount, goal)
            .with_predicate(key_equals("event_name", Value::from(event_name.into())))
    }

    /// Trigger summing the value of custom events with the given name.
    pub fn custom_event_value(event_name: impl Into<String>, goal: f64) -> Self {
        Self::new(TriggerType::CustomEventValue, goal)
            .with_predicate(key_equals("event_name", Value::from(event_name.into())))
    }

    /// Trigger counting entries into a region.
    pub fn region_enter(region_id: impl Into<String>, goal: f64) -> Self {
        Self::new(TriggerType::RegionEnter, goal)
            .with_predicate(key_equals("region_id", Value::from(region_id.into())))
    }

    /// Trigger counting exits from a region.
    pub fn region_exit(region_id: impl Into<String>, goal: f64) -> Self {
        Self::new(TriggerType::RegionExit, goal)
            .with_predicate(key_equals("region_id", Value::from(region_id.into())))
    }

    /// Trigger counting views of a screen.
    pub fn screen_view(screen: impl Into<String>, goal: f64) -> Self {
        Self::new(TriggerType::ScreenView, goal)
            .with_predicate(key_equals("screen", Value::from(screen.into())))
    }

    /// Trigger counting app foregrounds.
    pub fn foreground(goal: f64) -> Self {
        Self::new(TriggerType::Foreground, goal)
    }

    /// Trigger counting app backgrounds.
    pub fn background(goal: f64) -> Self {
        Self::new(TriggerType::Background, goal)
    }

    /// Trigger counting app initializations.
    pub fn app_init(goal: f64) -> Self {
        Self::new(TriggerType::AppInit, goal)
    }

    /// Builder method to set the predicate
    pub fn with_predicate(mut self, predicate: Value) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Builder method to mark this as a cancellation trigger
    pub fn as_cancellation(mut self) -> Self {
        self.is_cancellation = true;
        self
    }
}

fn key_equals(key: &str, value: Value) -> Value {
    json!({ "key": key, "value": { "equals": value } })
}

/// App state required by a delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    #[default]
    Any,
    Foreground,
    Background,
}

/// Longest accepted delay, ten years.
pub const MAX_DELAY_SECONDS: f64 = 315_360_000.0;

/// Conditions a fulfilled schedule must wait for before dispatch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScheduleDelay {
    /// Seconds to wait after fulfillment
    #[serde(default)]
    pub seconds: f64,
    /// Required app state
    #[serde(default)]
    pub app_state: AppState,
    /// Screen that must be the current screen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<String>,
    /// Region the device must currently be inside
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_id: Option<String>,
    /// Triggers that cancel the pending dispatch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancellation_triggers: Vec<Trigger>,
}

impl ScheduleDelay {
    /// Create a delay that only waits for the given number of seconds.
    pub fn seconds(seconds: f64) -> Self {
        Self {
            seconds,
            ..Default::default()
        }
    }

    /// Builder method to require an app state
    pub fn with_app_state(mut self, app_state: AppState) -> Self {
        self.app_state = app_state;
        self
    }

    /// Builder method to require a screen
    pub fn with_screen(mut self, screen: impl Into<String>) -> Self {
        self.screen = Some(screen.into());
        self
    }

    /// Builder method to require a region
    pub fn with_region(mut self, region_id: impl Into<String>) -> Self {
        self.region_id = Some(region_id.into());
        self
    }

    /// Builder method to add a cancellation trigger
    pub fn with_cancellation_trigger(mut self, trigger: Trigger) -> Self {
        self.cancellation_triggers.push(trigger.as_cancellation());
        self
    }

    /// Delay duration in milliseconds.
    pub fn millis(&self) -> i64 {
        (self.seconds * 1000.0).round() as i64
    }
}

/// Immutable definition of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    /// Triggers that must all reach their goal
    pub triggers: Vec<Trigger>,
    /// Action payload handed to the executor (action name to value)
    #[serde(default)]
    pub actions: Map<String, Value>,
    /// Optional group for bulk cancellation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Maximum number of executions
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Epoch millis before which the schedule cannot fire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    /// Epoch millis after which the schedule is discarded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    /// Post-fulfillment delay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<ScheduleDelay>,
}

fn default_limit() -> u32 {
    1
}

impl Default for ScheduleInfo {
    fn default() -> Self {
        Self {
            triggers: Vec::new(),
            actions: Map::new(),
            group: None,
            limit: default_limit(),
            start: None,
            end: None,
            delay: None,
        }
    }
}

impl ScheduleInfo {
    /// Create an empty schedule info (limit 1, no window, no delay).
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a schedule info from JSON.
    pub fn from_json(value: Value) -> AutomationResult<Self> {
        let info: Self = serde_json::from_value(value)?;
        info.validate()?;
        Ok(info)
    }

    /// Builder method to add a trigger
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Builder method to add an action
    pub fn with_action(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.actions.insert(name.into(), value.into());
        self
    }

    /// Builder method to set the group
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Builder method to set the execution limit
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Builder method to set the start of the window
    pub fn with_start(mut self, start_millis: i64) -> Self {
        self.start = Some(start_millis);
        self
    }

    /// Builder method to set the end of the window
    pub fn with_end(mut self, end_millis: i64) -> Self {
        self.end = Some(end_millis);
        self
    }

    /// Builder method to set the delay
    pub fn with_delay(mut self, delay: ScheduleDelay) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Check the invariants a schedule must satisfy before insertion.
    pub fn validate(&self) -> AutomationResult<()> {
        if self.triggers.is_empty() {
            return Err(AutomationError::Validation {
                message: "schedule requires at least one trigger".to_string(),
                code: ErrorCode::ValMissingField,
                details: Default::default(),
                suggestion: Some("Add a trigger with with_trigger()".to_string()),
            });
        }
        if self.triggers.iter().any(|t| t.is_cancellation) {
            return Err(AutomationError::validation_with_suggestion(
                "cancellation triggers cannot fire a schedule",
                "Attach cancellation triggers to the schedule delay",
            ));
        }
        let cancellations = self
            .delay
            .iter()
            .flat_map(|d| d.cancellation_triggers.iter());
        for trigger in self.triggers.iter().chain(cancellations) {
            if !(trigger.goal > 0.0) || !trigger.goal.is_finite() {
                return Err(AutomationError::validation(format!(
                    "trigger goal must be positive, got {}",
                    trigger.goal
                )));
            }
        }
        if self.limit == 0 {
            return Err(AutomationError::validation("schedule limit must be at least 1"));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(AutomationError::Validation {
                    message: format!("schedule start {} is after end {}", start, end),
                    code: ErrorCode::ValInvalidWindow,
                    details: Default::default(),
                    suggestion: None,
                });
            }
        }
        if let Some(delay) = &self.delay {
            if !(delay.seconds >= 0.0) || !delay.seconds.is_finite() {
                return Err(AutomationError::validation(format!(
                    "delay seconds must be non-negative, got {}",
                    delay.seconds
                )));
            }
            if delay.seconds > MAX_DELAY_SECONDS {
                return Err(AutomationError::validation(format!(
                    "delay of {} seconds exceeds the {} second limit",
                    delay.seconds, MAX_DELAY_SECONDS
                )));
            }
        }
        Ok(())
    }

    /// Every trigger of the schedule, fulfillment triggers first.
    pub fn all_triggers(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.iter().chain(
            self.delay
                .iter()
                .flat_map(|d| d.cancellation_triggers.iter()),
        )
    }
}

/// Execution bookkeeping state of a persisted schedule.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Accumulating trigger progress.
    #[default]
    Idle,
    /// Fulfilled and waiting on delay conditions.
    Delayed,
    /// Handed to the executor; not yet confirmed.
    Dispatching,
}

/// A persisted schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Identifier assigned at insert
    pub id: String,
    /// Immutable definition
    pub info: ScheduleInfo,
    /// Number of fulfillments so far
    pub execution_count: u32,
    /// Current execution state
    pub execution_state: ExecutionState,
    /// Epoch millis at which the delay's time condition elapses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delayed_execution_timestamp: Option<i64>,
}

impl Schedule {
    /// Whether the schedule is waiting on delay conditions.
    pub fn is_delayed(&self) -> bool {
        self.execution_state == ExecutionState::Delayed
    }

    /// Whether the schedule has used up its executions.
    pub fn is_limit_reached(&self) -> bool {
        self.execution_count >= self.info.limit
    }

    /// Whether the window has opened at `now_millis`.
    pub fn has_started(&self, now_millis: i64) -> bool {
        self.info.start.map_or(true, |start| now_millis >= start)
    }

    /// Whether the window has closed at `now_millis`.
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.info.end.is_some_and(|end| now_millis > end)
    }

    /// Group name, if any.
    pub fn group(&self) -> Option<&str> {
        self.info.group.as_deref()
    }
}

/// Persisted progress of one trigger bound to a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEntry {
    /// Row identifier
    pub id: i64,
    /// Event category
    pub trigger_type: TriggerType,
    /// Goal copied from the trigger
    pub goal: f64,
    /// Predicate copied from the trigger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Value>,
    /// Owning schedule
    pub schedule_id: String,
    /// Whether this entry cancels the schedule's pending delay
    pub is_cancellation: bool,
    /// Accumulated value
    pub progress: f64,
}
