//! Schedule and trigger storage.
//!
//! Schedules and their trigger entries live in two tables. All progress and
//! execution bookkeeping produced by one event pass is written through
//! [`AutomationStore::update_lists`] inside a single transaction.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::automation::types::{
    ExecutionState, Schedule, ScheduleInfo, TriggerEntry, TriggerType,
};
use crate::error::{AutomationError, AutomationResult, ErrorCode};

/// One named bookkeeping operation over a list of ids.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    /// Add `by` to the progress of each trigger
    IncrementTriggers { by: f64, ids: Vec<i64> },
    /// Set the progress of each trigger to zero
    ResetTriggers { ids: Vec<i64> },
    /// Set progress to `max(progress + by - goal, 0)` for each trigger
    CarryOverTriggers { by: f64, ids: Vec<i64> },
    /// Zero every cancellation trigger of each schedule
    ResetCancellationTriggers { schedule_ids: Vec<String> },
    /// Delete each schedule and its triggers
    DeleteSchedules { schedule_ids: Vec<String> },
    /// Add one to each schedule's execution count
    IncrementExecutionCount { schedule_ids: Vec<String> },
    /// Take back one execution from each schedule, never below zero
    DecrementExecutionCount { schedule_ids: Vec<String> },
    /// Set the execution state of each schedule
    SetExecutionState {
        state: ExecutionState,
        schedule_ids: Vec<String>,
    },
    /// Set or clear the delayed execution timestamp of each schedule
    SetDelayTimestamp {
        at: Option<i64>,
        schedule_ids: Vec<String>,
    },
}

impl UpdateOp {
    /// Operation name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            UpdateOp::IncrementTriggers { .. } => "increment_triggers",
            UpdateOp::ResetTriggers { .. } => "reset_triggers",
            UpdateOp::CarryOverTriggers { .. } => "carry_over_triggers",
            UpdateOp::ResetCancellationTriggers { .. } => "reset_cancellation_triggers",
            UpdateOp::DeleteSchedules { .. } => "delete_schedules",
            UpdateOp::IncrementExecutionCount { .. } => "increment_execution_count",
            UpdateOp::DecrementExecutionCount { .. } => "decrement_execution_count",
            UpdateOp::SetExecutionState { .. } => "set_execution_state",
            UpdateOp::SetDelayTimestamp { .. } => "set_delay_timestamp",
        }
    }

    /// Whether the operation touches no ids.
    pub fn is_empty(&self) -> bool {
        match self {
            UpdateOp::IncrementTriggers { ids, .. }
            | UpdateOp::ResetTriggers { ids }
            | UpdateOp::CarryOverTriggers { ids, .. } => ids.is_empty(),
            UpdateOp::ResetCancellationTriggers { schedule_ids }
            | UpdateOp::DeleteSchedules { schedule_ids }
            | UpdateOp::IncrementExecutionCount { schedule_ids }
            | UpdateOp::DecrementExecutionCount { schedule_ids }
            | UpdateOp::SetExecutionState { schedule_ids, .. }
            | UpdateOp::SetDelayTimestamp { schedule_ids, .. } => schedule_ids.is_empty(),
        }
    }
}

/// Ordered batch of operations applied in one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreUpdate {
    ops: Vec<UpdateOp>,
}

impl StoreUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation. Operations with no ids are dropped.
    pub fn push(&mut self, op: UpdateOp) {
        if !op.is_empty() {
            self.ops.push(op);
        }
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Names of the contained operations, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.ops.iter().map(UpdateOp::name).collect()
    }
}

/// Trait for automation storage operations
#[cfg_attr(test, mockall::automock)]
pub trait AutomationStore: Send + Sync {
    /// Insert schedules and their trigger entries atomically.
    ///
    /// Returned schedules are in input order.
    fn insert_schedules(&self, infos: &[ScheduleInfo]) -> AutomationResult<Vec<Schedule>>;

    /// Get a schedule by ID
    fn get_schedule(&self, id: &str) -> AutomationResult<Option<Schedule>>;

    /// Get the schedules with the given IDs; missing ids are skipped
    fn get_schedules(&self, ids: &[String]) -> AutomationResult<Vec<Schedule>>;

    /// Get every schedule in a group
    fn get_schedules_by_group(&self, group: &str) -> AutomationResult<Vec<Schedule>>;

    /// Get schedules waiting on a delay
    fn get_delayed_schedules(&self) -> AutomationResult<Vec<Schedule>>;

    /// Get schedules handed to the executor but never confirmed
    fn get_dispatching_schedules(&self) -> AutomationResult<Vec<Schedule>>;

    /// Get triggers of a type that can currently advance.
    ///
    /// Fulfillment triggers of idle schedules and cancellation triggers of
    /// delayed schedules.
    fn get_active_triggers(&self, trigger_type: TriggerType) -> AutomationResult<Vec<TriggerEntry>>;

    /// Get every trigger entry of the given schedules
    fn get_triggers_for_schedules(&self, ids: &[String]) -> AutomationResult<Vec<TriggerEntry>>;

    /// Count persisted schedules
    fn schedule_count(&self) -> AutomationResult<usize>;

    /// Delete schedules and their triggers, returning how many existed
    fn delete_schedules(&self, ids: &[String]) -> AutomationResult<usize>;

    /// Delete a group, returning the deleted schedule IDs
    fn delete_group(&self, group: &str) -> AutomationResult<Vec<String>>;

    /// Apply a batch of bookkeeping operations in one transaction
    fn update_lists(&self, update: &StoreUpdate) -> AutomationResult<()>;
}

const SCHEDULE_COLUMNS: &str =
    "id, info, execution_count, execution_state, delayed_execution_timestamp";

const TRIGGER_COLUMNS: &str =
    "t.id, t.trigger_type, t.goal, t.predicate, t.schedule_id, t.is_cancellation, t.progress";

/// SQLite-backed automation store
pub struct SqliteAutomationStore {
    conn: Mutex<Connection>,
}

impl SqliteAutomationStore {
    /// Create a new store at the given path
    pub fn new(path: impl AsRef<Path>) -> AutomationResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| AutomationError::Database {
            message: format!("failed to open {}: {}", path.display(), e),
            code: ErrorCode::DbConnectionFailed,
            source: Some(Box::new(e)),
        })?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> AutomationResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> AutomationResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AutomationError::Internal("automation store lock poisoned".to_string()))
    }

    fn init_schema(&self) -> AutomationResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                info TEXT NOT NULL,
                group_name TEXT,
                execution_count INTEGER NOT NULL DEFAULT 0,
                execution_state TEXT NOT NULL DEFAULT 'idle',
                delayed_execution_timestamp INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_schedules_group ON schedules(group_name);
            CREATE INDEX IF NOT EXISTS idx_schedules_state ON schedules(execution_state);

            CREATE TABLE IF NOT EXISTS triggers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                schedule_id TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                goal REAL NOT NULL,
                predicate TEXT,
                is_cancellation INTEGER NOT NULL DEFAULT 0,
                progress REAL NOT NULL DEFAULT 0,
                FOREIGN KEY (schedule_id) REFERENCES schedules(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_triggers_type ON triggers(trigger_type);
            CREATE INDEX IF NOT EXISTS idx_triggers_schedule ON triggers(schedule_id);
        "#,
        )?;
        Ok(())
    }

    fn row_to_schedule(row: &rusqlite::Row<'_>) -> AutomationResult<Schedule> {
        let id: String = row.get(0)?;
        let info: String = row.get(1)?;
        let execution_count: u32 = row.get(2)?;
        let execution_state: String = row.get(3)?;
        let delayed_execution_timestamp: Option<i64> = row.get(4)?;

        Ok(Schedule {
            id,
            info: serde_json::from_str(&info)?,
            execution_count,
            execution_state: ExecutionState::from_str(&execution_state)
                .map_err(|e| AutomationError::parse(e.to_string()))?,
            delayed_execution_timestamp,
        })
    }

    fn row_to_trigger(row: &rusqlite::Row<'_>) -> AutomationResult<TriggerEntry> {
        let id: i64 = row.get(0)?;
        let trigger_type: String = row.get(1)?;
        let goal: f64 = row.get(2)?;
        let predicate: Option<String> = row.get(3)?;
        let schedule_id: String = row.get(4)?;
        let is_cancellation: i32 = row.get(5)?;
        let progress: f64 = row.get(6)?;

        Ok(TriggerEntry {
            id,
            trigger_type: TriggerType::from_str(&trigger_type)
                .map_err(|e| AutomationError::parse(e.to_string()))?,
            goal,
            predicate: predicate.map(|p| serde_json::from_str(&p)).transpose()?,
            schedule_id,
            is_cancellation: is_cancellation != 0,
            progress,
        })
    }

    fn query_schedules(
        conn: &Connection,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> AutomationResult<Vec<Schedule>> {
        let sql = format!(
            "SELECT {} FROM schedules {} ORDER BY rowid",
            SCHEDULE_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let results = stmt.query_map(params, |row| Ok(Self::row_to_schedule(row)))?;

        results
            .map(|r| r.map_err(|e| e.into()).and_then(|inner| inner))
            .collect()
    }

    fn query_triggers(
        conn: &Connection,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> AutomationResult<Vec<TriggerEntry>> {
        let sql = format!(
            "SELECT {} FROM triggers t JOIN schedules s ON s.id = t.schedule_id {} ORDER BY t.id",
            TRIGGER_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let results = stmt.query_map(params, |row| Ok(Self::row_to_trigger(row)))?;

        results
            .map(|r| r.map_err(|e| e.into()).and_then(|inner| inner))
            .collect()
    }

    fn delete_in(tx: &Transaction<'_>, ids: &[String]) -> AutomationResult<usize> {
        let mut delete_triggers = tx.prepare_cached("DELETE FROM triggers WHERE schedule_id = ?1")?;
        let mut delete_schedule = tx.prepare_cached("DELETE FROM schedules WHERE id = ?1")?;
        let mut deleted = 0;
        for id in ids {
            delete_triggers.execute(params![id])?;
            deleted += delete_schedule.execute(params![id])?;
        }
        Ok(deleted)
    }

    fn apply_op(tx: &Transaction<'_>, op: &UpdateOp) -> AutomationResult<()> {
        match op {
            UpdateOp::IncrementTriggers { by, ids } => {
                let mut stmt =
                    tx.prepare_cached("UPDATE triggers SET progress = progress + ?1 WHERE id = ?2")?;
                for id in ids {
                    stmt.execute(params![by, id])?;
                }
            }
            UpdateOp::ResetTriggers { ids } => {
                let mut stmt = tx.prepare_cached("UPDATE triggers SET progress = 0 WHERE id = ?1")?;
                for id in ids {
                    stmt.execute(params![id])?;
                }
            }
            UpdateOp::CarryOverTriggers { by, ids } => {
                let mut stmt = tx.prepare_cached(
                    "UPDATE triggers SET progress = MAX(progress + ?1 - goal, 0) WHERE id = ?2",
                )?;
                for id in ids {
                    stmt.execute(params![by, id])?;
                }
            }
            UpdateOp::ResetCancellationTriggers { schedule_ids } => {
                let mut stmt = tx.prepare_cached(
                    "UPDATE triggers SET progress = 0 WHERE schedule_id = ?1 AND is_cancellation = 1",
                )?;
                for id in schedule_ids {
                    stmt.execute(params![id])?;
                }
            }
            UpdateOp::DeleteSchedules { schedule_ids } => {
                Self::delete_in(tx, schedule_ids)?;
            }
            UpdateOp::IncrementExecutionCount { schedule_ids } => {
                let mut stmt = tx.prepare_cached(
                    "UPDATE schedules SET execution_count = execution_count + 1 WHERE id = ?1",
                )?;
                for id in schedule_ids {
                    stmt.execute(params![id])?;
                }
            }
            UpdateOp::DecrementExecutionCount { schedule_ids } => {
                let mut stmt = tx.prepare_cached(
                    "UPDATE schedules SET execution_count = MAX(execution_count - 1, 0) WHERE id = ?1",
                )?;
                for id in schedule_ids {
                    stmt.execute(params![id])?;
                }
            }
            UpdateOp::SetExecutionState {
                state,
                schedule_ids,
            } => {
                let mut stmt =
                    tx.prepare_cached("UPDATE schedules SET execution_state = ?1 WHERE id = ?2")?;
                let state: &'static str = state.into();
                for id in schedule_ids {
                    stmt.execute(params![state, id])?;
                }
            }
            UpdateOp::SetDelayTimestamp { at, schedule_ids } => {
                let mut stmt = tx.prepare_cached(
                    "UPDATE schedules SET delayed_execution_timestamp = ?1 WHERE id = ?2",
                )?;
                for id in schedule_ids {
                    stmt.execute(params![at, id])?;
                }
            }
        }
        Ok(())
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl AutomationStore for SqliteAutomationStore {
    fn insert_schedules(&self, infos: &[ScheduleInfo]) -> AutomationResult<Vec<Schedule>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let created_at = chrono::Utc::now().to_rfc3339();
        let mut schedules = Vec::with_capacity(infos.len());

        {
            let mut insert_schedule = tx.prepare_cached(
                r#"INSERT INTO schedules (id, info, group_name, created_at)
                   VALUES (?1, ?2, ?3, ?4)"#,
            )?;
            let mut insert_trigger = tx.prepare_cached(
                r#"INSERT INTO triggers (schedule_id, trigger_type, goal, predicate, is_cancellation)
                   VALUES (?1, ?2, ?3, ?4, ?5)"#,
            )?;

            for info in infos {
                let id = Uuid::new_v4().to_string();
                insert_schedule.execute(params![
                    id,
                    serde_json::to_string(info)?,
                    info.group,
                    created_at,
                ])?;

                for trigger in info.all_triggers() {
                    let predicate = trigger
                        .predicate
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?;
                    insert_trigger.execute(params![
                        id,
                        trigger.trigger_type.as_str(),
                        trigger.goal,
                        predicate,
                        trigger.is_cancellation as i32,
                    ])?;
                }

                schedules.push(Schedule {
                    id,
                    info: info.clone(),
                    execution_count: 0,
                    execution_state: ExecutionState::Idle,
                    delayed_execution_timestamp: None,
                });
            }
        }

        tx.commit()?;
        Ok(schedules)
    }

    fn get_schedule(&self, id: &str) -> AutomationResult<Option<Schedule>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM schedules WHERE id = ?1", SCHEDULE_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;

        stmt.query_row(params![id], |row| Ok(Self::row_to_schedule(row)))
            .optional()?
            .transpose()
    }

    fn get_schedules(&self, ids: &[String]) -> AutomationResult<Vec<Schedule>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let filter = format!("WHERE id IN ({})", placeholders(ids.len()));
        Self::query_schedules(&conn, &filter, params_from_iter(ids.iter()))
    }

    fn get_schedules_by_group(&self, group: &str) -> AutomationResult<Vec<Schedule>> {
        let conn = self.conn()?;
        Self::query_schedules(&conn, "WHERE group_name = ?1", params![group])
    }

    fn get_delayed_schedules(&self) -> AutomationResult<Vec<Schedule>> {
        let conn = self.conn()?;
        Self::query_schedules(&conn, "WHERE execution_state = 'delayed'", params![])
    }

    fn get_dispatching_schedules(&self) -> AutomationResult<Vec<Schedule>> {
        let conn = self.conn()?;
        Self::query_schedules(&conn, "WHERE execution_state = 'dispatching'", params![])
    }

    fn get_active_triggers(&self, trigger_type: TriggerType) -> AutomationResult<Vec<TriggerEntry>> {
        let conn = self.conn()?;
        Self::query_triggers(
            &conn,
            r#"WHERE t.trigger_type = ?1
               AND ((t.is_cancellation = 0 AND s.execution_state = 'idle')
                 OR (t.is_cancellation = 1 AND s.execution_state = 'delayed'))"#,
            params![trigger_type.as_str()],
        )
    }

    fn get_triggers_for_schedules(&self, ids: &[String]) -> AutomationResult<Vec<TriggerEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let filter = format!("WHERE t.schedule_id IN ({})", placeholders(ids.len()));
        Self::query_triggers(&conn, &filter, params_from_iter(ids.iter()))
    }

    fn schedule_count(&self) -> AutomationResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM schedules", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn delete_schedules(&self, ids: &[String]) -> AutomationResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let deleted = Self::delete_in(&tx, ids)?;
        tx.commit()?;
        Ok(deleted)
    }

    fn delete_group(&self, group: &str) -> AutomationResult<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare("SELECT id FROM schedules WHERE group_name = ?1")?;
            let rows = stmt.query_map(params![group], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        Self::delete_in(&tx, &ids)?;
        tx.commit()?;
        Ok(ids)
    }

    fn update_lists(&self, update: &StoreUpdate) -> AutomationResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for op in update.ops() {
            Self::apply_op(&tx, op)?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::types::{ScheduleDelay, Trigger};

    fn info(group: &str) -> ScheduleInfo {
        ScheduleInfo::new()
            .with_trigger(Trigger::custom_event_count("name", 2.0))
            .with_trigger(Trigger::foreground(1.0))
            .with_action("test_action", "action_value")
            .with_group(group)
            .with_delay(
                ScheduleDelay::seconds(1.0).with_cancellation_trigger(Trigger::background(1.0)),
            )
    }

    #[test]
    fn test_insert_and_get() {
        let store = SqliteAutomationStore::in_memory().unwrap();
        let inserted = store.insert_schedules(&[info("a"), info("b")]).unwrap();

        assert_eq!(inserted.len(), 2);
        assert_eq!(inserted[0].group(), Some("a"));
        assert_eq!(store.schedule_count().unwrap(), 2);

        let fetched = store.get_schedule(&inserted[0].id).unwrap().unwrap();
        assert_eq!(fetched, inserted[0]);
        assert!(store.get_schedule("missing").unwrap().is_none());

        let triggers = store
            .get_triggers_for_schedules(&[inserted[0].id.clone()])
            .unwrap();
        assert_eq!(triggers.len(), 3);
        assert_eq!(triggers.iter().filter(|t| t.is_cancellation).count(), 1);
        assert!(triggers.iter().all(|t| t.progress == 0.0));
    }

    #[test]
    fn test_active_triggers_follow_execution_state() {
        let store = SqliteAutomationStore::in_memory().unwrap();
        let schedule = store.insert_schedules(&[info("a")]).unwrap().remove(0);

        assert_eq!(store.get_active_triggers(TriggerType::Foreground).unwrap().len(), 1);
        assert!(store.get_active_triggers(TriggerType::Background).unwrap().is_empty());

        let mut update = StoreUpdate::new();
        update.push(UpdateOp::SetExecutionState {
            state: ExecutionState::Delayed,
            schedule_ids: vec![schedule.id.clone()],
        });
        update.push(UpdateOp::SetDelayTimestamp {
            at: Some(1_000),
            schedule_ids: vec![schedule.id.clone()],
        });
        store.update_lists(&update).unwrap();

        assert!(store.get_active_triggers(TriggerType::Foreground).unwrap().is_empty());
        assert_eq!(store.get_active_triggers(TriggerType::Background).unwrap().len(), 1);

        let delayed = store.get_delayed_schedules().unwrap();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].delayed_execution_timestamp, Some(1_000));
        assert!(delayed[0].is_delayed());
    }

    #[test]
    fn test_progress_operations() {
        let store = SqliteAutomationStore::in_memory().unwrap();
        let schedule = store.insert_schedules(&[info("a")]).unwrap().remove(0);
        let count_id = store
            .get_active_triggers(TriggerType::CustomEventCount)
            .unwrap()[0]
            .id;

        let mut update = StoreUpdate::new();
        update.push(UpdateOp::IncrementTriggers {
            by: 3.0,
            ids: vec![count_id],
        });
        store.update_lists(&update).unwrap();

        let mut update = StoreUpdate::new();
        update.push(UpdateOp::CarryOverTriggers {
            by: 0.0,
            ids: vec![count_id],
        });
        update.push(UpdateOp::IncrementExecutionCount {
            schedule_ids: vec![schedule.id.clone()],
        });
        store.update_lists(&update).unwrap();

        let entry = store
            .get_active_triggers(TriggerType::CustomEventCount)
            .unwrap()
            .remove(0);
        assert_eq!(entry.progress, 1.0);
        assert_eq!(
            store.get_schedule(&schedule.id).unwrap().unwrap().execution_count,
            1
        );

        let mut update = StoreUpdate::new();
        update.push(UpdateOp::ResetTriggers { ids: vec![count_id] });
        store.update_lists(&update).unwrap();
        let entry = store
            .get_active_triggers(TriggerType::CustomEventCount)
            .unwrap()
            .remove(0);
        assert_eq!(entry.progress, 0.0);
    }

    #[test]
    fn test_decrement_execution_count_floors_at_zero() {
        let store = SqliteAutomationStore::in_memory().unwrap();
        let schedule = store.insert_schedules(&[info("a")]).unwrap().remove(0);
        let ids = vec![schedule.id.clone()];

        let mut update = StoreUpdate::new();
        update.push(UpdateOp::IncrementExecutionCount {
            schedule_ids: ids.clone(),
        });
        update.push(UpdateOp::DecrementExecutionCount {
            schedule_ids: ids.clone(),
        });
        update.push(UpdateOp::DecrementExecutionCount { schedule_ids: ids });
        assert_eq!(
            update.names(),
            vec![
                "increment_execution_count",
                "decrement_execution_count",
                "decrement_execution_count"
            ]
        );
        store.update_lists(&update).unwrap();

        let stored = store.get_schedule(&schedule.id).unwrap().unwrap();
        assert_eq!(stored.execution_count, 0);
    }

    #[test]
    fn test_failed_batch_rolls_back() {
        let store = SqliteAutomationStore::in_memory().unwrap();
        let schedule = store.insert_schedules(&[info("a")]).unwrap().remove(0);
        let count_id = store
            .get_active_triggers(TriggerType::CustomEventCount)
            .unwrap()[0]
            .id;

        store
            .conn()
            .unwrap()
            .execute_batch(
                r#"CREATE TRIGGER fail_count BEFORE UPDATE OF execution_count ON schedules
                   BEGIN SELECT RAISE(ABORT, 'boom'); END;"#,
            )
            .unwrap();

        let mut update = StoreUpdate::new();
        update.push(UpdateOp::IncrementTriggers {
            by: 1.0,
            ids: vec![count_id],
        });
        update.push(UpdateOp::IncrementExecutionCount {
            schedule_ids: vec![schedule.id.clone()],
        });
        assert!(store.update_lists(&update).is_err());

        let entry = store
            .get_active_triggers(TriggerType::CustomEventCount)
            .unwrap()
            .remove(0);
        assert_eq!(entry.progress, 0.0);
    }

    #[test]
    fn test_delete_cascades() {
        let store = SqliteAutomationStore::in_memory().unwrap();
        let schedules = store
            .insert_schedules(&[info("a"), info("a"), info("b")])
            .unwrap();

        assert_eq!(store.get_schedules_by_group("a").unwrap().len(), 2);

        let deleted = store.delete_group("a").unwrap();
        assert_eq!(deleted.len(), 2);
        assert_eq!(store.schedule_count().unwrap(), 1);

        let removed = store
            .delete_schedules(&[schedules[2].id.clone(), "missing".to_string()])
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store
            .get_triggers_for_schedules(&[schedules[2].id.clone()])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_empty_update_is_noop() {
        let store = SqliteAutomationStore::in_memory().unwrap();
        let mut update = StoreUpdate::new();
        update.push(UpdateOp::DeleteSchedules {
            schedule_ids: vec![],
        });
        assert!(update.is_empty());
        store.update_lists(&update).unwrap();
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("automation.db");

        let id = {
            let store = SqliteAutomationStore::new(&path).unwrap();
            store.insert_schedules(&[info("a")]).unwrap().remove(0).id
        };

        let store = SqliteAutomationStore::new(&path).unwrap();
        let schedule = store.get_schedule(&id).unwrap().unwrap();
        assert_eq!(schedule.info.limit, 1);
        assert_eq!(store.get_triggers_for_schedules(&[id]).unwrap().len(), 3);
    }
}
