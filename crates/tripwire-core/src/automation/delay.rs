//! Delay scheduling for fulfilled schedules.
//!
//! A delayed schedule waits on up to four independent conditions: elapsed
//! time, app state, current screen and current region. Time is tracked by a
//! tokio timer that only enqueues [`Command::DelayElapsed`] on the engine
//! queue; the other conditions are checked against an [`AppStateSnapshot`]
//! built from the engine's own event stream.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::automation::engine::Command;
use crate::automation::types::{AppState, Schedule, ScheduleDelay};
use crate::events::{AutomationEvent, BoundaryEvent};

/// App state as observed through automation events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppStateSnapshot {
    /// Whether the app is in the foreground
    pub foreground: bool,
    /// Last viewed screen
    pub screen: Option<String>,
    /// Regions currently inside
    pub regions: HashSet<String>,
}

impl AppStateSnapshot {
    /// Fold an event into the snapshot.
    pub fn observe(&mut self, event: &AutomationEvent) {
        match event {
            AutomationEvent::Foreground => self.foreground = true,
            AutomationEvent::Background => self.foreground = false,
            AutomationEvent::ScreenView { screen } => self.screen = Some(screen.clone()),
            AutomationEvent::Region(region) => match region.boundary_event {
                BoundaryEvent::Enter => {
                    self.regions.insert(region.region_id.clone());
                }
                BoundaryEvent::Exit => {
                    self.regions.remove(&region.region_id);
                }
            },
            AutomationEvent::Custom(_) | AutomationEvent::AppInit => {}
        }
    }

    /// Whether every non-time condition of the delay currently holds.
    pub fn satisfies(&self, delay: &ScheduleDelay) -> bool {
        let state_ok = match delay.app_state {
            AppState::Any => true,
            AppState::Foreground => self.foreground,
            AppState::Background => !self.foreground,
        };
        let screen_ok = delay
            .screen
            .as_ref()
            .map_or(true, |screen| self.screen.as_ref() == Some(screen));
        let region_ok = delay
            .region_id
            .as_ref()
            .map_or(true, |region| self.regions.contains(region));

        state_ok && screen_ok && region_ok
    }
}

struct PendingDelay {
    schedule: Schedule,
    time_elapsed: bool,
    timer: Option<JoinHandle<()>>,
}

/// Holds delayed schedules until their conditions are met.
pub(crate) struct DelayScheduler {
    pending: BTreeMap<String, PendingDelay>,
    snapshot: AppStateSnapshot,
    queue: mpsc::UnboundedSender<Command>,
}

impl DelayScheduler {
    pub(crate) fn new(queue: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            pending: BTreeMap::new(),
            snapshot: AppStateSnapshot::default(),
            queue,
        }
    }

    /// Start waiting on a delayed schedule.
    ///
    /// The time condition is measured against the persisted timestamp, so a
    /// schedule restored after a restart only waits for the remaining time.
    pub fn arm(&mut self, schedule: Schedule, now_millis: i64) {
        self.cancel(&schedule.id);

        let due = schedule.delayed_execution_timestamp.unwrap_or(now_millis);
        let remaining = due.saturating_sub(now_millis);
        let timer = if remaining > 0 {
            let queue = self.queue.clone();
            let id = schedule.id.clone();
            Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(remaining as u64)).await;
                let _ = queue.send(Command::DelayElapsed(id));
            }))
        } else {
            None
        };

        tracing::debug!(schedule_id = %schedule.id, remaining_ms = remaining.max(0), "Armed delay");
        self.pending.insert(
            schedule.id.clone(),
            PendingDelay {
                schedule,
                time_elapsed: timer.is_none(),
                timer,
            },
        );
    }

    /// Record that a schedule's timer fired.
    pub fn time_elapsed(&mut self, schedule_id: &str) {
        if let Some(pending) = self.pending.get_mut(schedule_id) {
            pending.time_elapsed = true;
            pending.timer = None;
        }
    }

    /// Stop waiting on a schedule. Unknown ids are ignored.
    pub fn cancel(&mut self, schedule_id: &str) -> bool {
        match self.pending.remove(schedule_id) {
            Some(pending) => {
                if let Some(timer) = pending.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Fold an event into the app state snapshot.
    pub fn observe(&mut self, event: &AutomationEvent) {
        self.snapshot.observe(event);
    }

    /// Remove and return every schedule whose conditions all hold.
    pub fn take_ready(&mut self) -> Vec<Schedule> {
        let ready: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, pending)| {
                pending.time_elapsed
                    && pending
                        .schedule
                        .info
                        .delay
                        .as_ref()
                        .map_or(true, |delay| self.snapshot.satisfies(delay))
            })
            .map(|(id, _)| id.clone())
            .collect();

        ready
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|pending| pending.schedule)
            .collect()
    }

    pub fn is_pending(&self, schedule_id: &str) -> bool {
        self.pending.contains_key(schedule_id)
    }

    /// Abort every timer and forget all pending schedules.
    pub fn clear(&mut self) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
        }
    }
}

impl Drop for DelayScheduler {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::types::{ExecutionState, ScheduleInfo, Trigger};

    fn delayed(id: &str, delay: ScheduleDelay, due: i64) -> Schedule {
        Schedule {
            id: id.to_string(),
            info: ScheduleInfo::new()
                .with_trigger(Trigger::foreground(1.0))
                .with_delay(delay),
            execution_count: 1,
            execution_state: ExecutionState::Delayed,
            delayed_execution_timestamp: Some(due),
        }
    }

    #[test]
    fn test_snapshot_conditions_are_independent() {
        let mut snapshot = AppStateSnapshot::default();
        let delay = ScheduleDelay::seconds(0.0)
            .with_app_state(AppState::Foreground)
            .with_screen("home")
            .with_region("store");

        snapshot.observe(&AutomationEvent::Foreground);
        snapshot.observe(&AutomationEvent::screen("home"));
        assert!(!snapshot.satisfies(&delay));

        snapshot.observe(&AutomationEvent::region_enter("store", "gps"));
        assert!(snapshot.satisfies(&delay));

        snapshot.observe(&AutomationEvent::region_exit("store", "gps"));
        assert!(!snapshot.satisfies(&delay));

        let background = ScheduleDelay::seconds(0.0).with_app_state(AppState::Background);
        assert!(!snapshot.satisfies(&background));
        snapshot.observe(&AutomationEvent::Background);
        assert!(snapshot.satisfies(&background));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_enqueues_delay_elapsed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut delays = DelayScheduler::new(tx);

        delays.arm(delayed("a", ScheduleDelay::seconds(1.0), 1_000), 0);
        assert!(delays.take_ready().is_empty());

        match rx.recv().await {
            Some(Command::DelayElapsed(id)) => {
                assert_eq!(id, "a");
                delays.time_elapsed(&id);
            }
            _ => panic!("expected delay elapsed"),
        }

        let ready = delays.take_ready();
        assert_eq!(ready.len(), 1);
        assert!(!delays.is_pending("a"));
    }

    #[tokio::test]
    async fn test_past_timestamp_is_immediately_elapsed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut delays = DelayScheduler::new(tx);

        let delay = ScheduleDelay::seconds(5.0).with_app_state(AppState::Foreground);
        delays.arm(delayed("a", delay, 500), 1_000);

        // Time is done but the app is still in the background
        assert!(delays.take_ready().is_empty());
        delays.observe(&AutomationEvent::Foreground);
        assert_eq!(delays.take_ready().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_is_noop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut delays = DelayScheduler::new(tx);

        delays.arm(delayed("a", ScheduleDelay::seconds(10.0), 10_000), 0);
        assert!(!delays.cancel("missing"));
        assert!(delays.cancel("a"));
        assert!(delays.take_ready().is_empty());
    }
}
