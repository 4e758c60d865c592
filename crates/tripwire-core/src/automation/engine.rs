//! Automation engine.
//!
//! All evaluation and mutation happens on a single worker task. Callers and
//! the event bus sink talk to it through an unbounded command queue, so
//! the order of arrival is the order of processing. Delay timers enqueue onto
//! the same queue and never race a progress update.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::automation::clock::{Clock, TokioClock};
use crate::automation::delay::DelayScheduler;
use crate::automation::executor::ActionExecutor;
use crate::automation::predicate::PredicateCache;
use crate::automation::store::{AutomationStore, StoreUpdate, UpdateOp};
use crate::automation::types::{
    ExecutionState, ProgressPolicy, Schedule, ScheduleDelay, ScheduleInfo, TriggerEntry,
};
use crate::config::EngineConfig;
use crate::error::{AutomationError, AutomationResult};
use crate::events::{AutomationEvent, EventBus, EventSink, SinkId};

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const TORN_DOWN: u8 = 2;

type Reply<T> = oneshot::Sender<AutomationResult<T>>;

/// Reply channel for schedule inserts.
pub(crate) enum ScheduleReply {
    One(Reply<Schedule>),
    Many(Reply<Vec<Schedule>>),
}

impl ScheduleReply {
    fn send(self, result: AutomationResult<Vec<Schedule>>) {
        match self {
            ScheduleReply::One(reply) => {
                let single = result.and_then(|mut schedules| {
                    schedules
                        .pop()
                        .ok_or_else(|| AutomationError::Internal("no schedule inserted".to_string()))
                });
                let _ = reply.send(single);
            }
            ScheduleReply::Many(reply) => {
                let _ = reply.send(result);
            }
        }
    }
}

/// Work items processed by the engine worker.
pub(crate) enum Command {
    Schedule {
        infos: Vec<ScheduleInfo>,
        reply: ScheduleReply,
    },
    Cancel {
        ids: Vec<String>,
        reply: Reply<usize>,
    },
    CancelGroup {
        group: String,
        reply: Reply<usize>,
    },
    GetSchedule {
        id: String,
        reply: Reply<Option<Schedule>>,
    },
    GetGroup {
        group: String,
        reply: Reply<Vec<Schedule>>,
    },
    Event {
        event: AutomationEvent,
        reply: Option<Reply<Vec<String>>>,
    },
    DelayElapsed(String),
    SetPaused(bool),
    Flush(Reply<()>),
    Shutdown,
}

impl Command {
    /// Resolve the command's caller with `Cancelled`.
    fn cancel(self) {
        match self {
            Command::Schedule { reply, .. } => reply.send(Err(AutomationError::Cancelled)),
            Command::Cancel { reply, .. } | Command::CancelGroup { reply, .. } => {
                let _ = reply.send(Err(AutomationError::Cancelled));
            }
            Command::GetSchedule { reply, .. } => {
                let _ = reply.send(Err(AutomationError::Cancelled));
            }
            Command::GetGroup { reply, .. } => {
                let _ = reply.send(Err(AutomationError::Cancelled));
            }
            Command::Event {
                reply: Some(reply), ..
            } => {
                let _ = reply.send(Err(AutomationError::Cancelled));
            }
            Command::Flush(reply) => {
                let _ = reply.send(Err(AutomationError::Cancelled));
            }
            Command::Event { reply: None, .. }
            | Command::DelayElapsed(_)
            | Command::SetPaused(_)
            | Command::Shutdown => {}
        }
    }
}

/// Handle to a result the engine will produce later.
pub struct PendingResult<T> {
    receiver: oneshot::Receiver<AutomationResult<T>>,
}

impl<T> PendingResult<T> {
    /// Wait for the result.
    pub async fn wait(self) -> AutomationResult<T> {
        self.receiver.await.unwrap_or(Err(AutomationError::Cancelled))
    }

    /// Block the current thread until the result is ready.
    ///
    /// Must not be called from within an async context.
    pub fn blocking_wait(self) -> AutomationResult<T> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(AutomationError::Cancelled))
    }

    /// Take the result if it is already available.
    pub fn try_take(&mut self) -> Option<AutomationResult<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(AutomationError::Cancelled)),
        }
    }
}

/// Feeds bus events straight into the worker queue.
struct QueueSink {
    queue: mpsc::UnboundedSender<Command>,
}

impl EventSink for QueueSink {
    fn deliver(&self, event: &AutomationEvent) -> bool {
        self.queue
            .send(Command::Event {
                event: event.clone(),
                reply: None,
            })
            .is_ok()
    }
}

#[derive(Default)]
struct Tasks {
    worker: Option<JoinHandle<()>>,
    sink: Option<SinkId>,
}

/// The automation engine.
///
/// Created idle; [`Automation::start`] spawns the worker and attaches to
/// the event bus, [`Automation::tear_down`] stops both. Bus events enter the
/// same queue as direct calls, in emit order, and are never dropped.
pub struct Automation {
    store: Arc<dyn AutomationStore>,
    executor: Arc<dyn ActionExecutor>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    state: Arc<AtomicU8>,
    paused: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<Command>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    tasks: Mutex<Tasks>,
}

impl Automation {
    /// Create an engine over a store, executor and event bus.
    pub fn new(
        store: Arc<dyn AutomationStore>,
        executor: Arc<dyn ActionExecutor>,
        bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            store,
            executor,
            bus,
            clock: Arc::new(TokioClock::new()),
            paused: Arc::new(AtomicBool::new(config.start_paused)),
            config,
            state: Arc::new(AtomicU8::new(CREATED)),
            sender,
            receiver: Mutex::new(Some(receiver)),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Builder method to replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start the engine.
    ///
    /// Attaches to the event bus, restores delayed schedules with their
    /// remaining time and re-dispatches schedules that never confirmed.
    /// Starting a running engine is a no-op.
    pub async fn start(&self) -> AutomationResult<()> {
        match self
            .state
            .compare_exchange(CREATED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {}
            Err(RUNNING) => return Ok(()),
            Err(_) => return Err(AutomationError::TornDown),
        }

        let receiver = self
            .receiver
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| AutomationError::Internal("command queue unavailable".to_string()))?;

        let worker = Worker {
            store: self.store.clone(),
            executor: self.executor.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            delays: DelayScheduler::new(self.sender.clone()),
            predicates: PredicateCache::new(),
            paused: self.paused.load(Ordering::SeqCst),
            has_schedules: false,
            recovered: Vec::new(),
            receiver,
            state: self.state.clone(),
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let worker = tokio::spawn(worker.run(ready_tx));

        let sink = self.bus.attach(Arc::new(QueueSink {
            queue: self.sender.clone(),
        }));

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.worker = Some(worker);
            tasks.sink = Some(sink);
        }

        info!(paused = self.is_paused(), "Automation engine started");
        ready_rx.await.unwrap_or(Err(AutomationError::Cancelled))
    }

    /// Stop the engine.
    ///
    /// Detaches from the bus, aborts delay timers and resolves every
    /// request still queued with [`AutomationError::Cancelled`]. Later calls
    /// fail with [`AutomationError::TornDown`].
    pub async fn tear_down(&self) {
        if self.state.swap(TORN_DOWN, Ordering::SeqCst) == TORN_DOWN {
            return;
        }

        let (worker, sink) = match self.tasks.lock() {
            Ok(mut tasks) => (tasks.worker.take(), tasks.sink.take()),
            Err(_) => (None, None),
        };

        if let Some(sink) = sink {
            self.bus.detach(sink);
        }
        let _ = self.sender.send(Command::Shutdown);
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Automation worker ended abnormally");
            }
        }

        info!("Automation engine torn down");
    }

    /// Whether the engine is started and not torn down.
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    /// The bus the engine listens to.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Insert a schedule and wait for it to be durable.
    pub async fn schedule(&self, info: ScheduleInfo) -> AutomationResult<Schedule> {
        self.schedule_async(info)?.wait().await
    }

    /// Insert several schedules atomically. Results are in input order.
    pub async fn schedule_all(&self, infos: Vec<ScheduleInfo>) -> AutomationResult<Vec<Schedule>> {
        for info in &infos {
            info.validate()?;
        }
        let (reply, receiver) = oneshot::channel();
        self.send(Command::Schedule {
            infos,
            reply: ScheduleReply::Many(reply),
        })?;
        PendingResult { receiver }.wait().await
    }

    /// Queue a schedule insert and return a handle to its result.
    pub fn schedule_async(&self, info: ScheduleInfo) -> AutomationResult<PendingResult<Schedule>> {
        info.validate()?;
        let (reply, receiver) = oneshot::channel();
        self.send(Command::Schedule {
            infos: vec![info],
            reply: ScheduleReply::One(reply),
        })?;
        Ok(PendingResult { receiver })
    }

    /// Insert a schedule from a non-async thread.
    pub fn schedule_blocking(&self, info: ScheduleInfo) -> AutomationResult<Schedule> {
        self.schedule_async(info)?.blocking_wait()
    }

    /// Cancel a schedule. Returns whether it existed.
    pub async fn cancel_schedule(&self, id: impl Into<String>) -> AutomationResult<bool> {
        Ok(self.cancel_schedules(vec![id.into()]).await? > 0)
    }

    /// Cancel schedules, returning how many existed. Missing ids are ignored.
    pub async fn cancel_schedules(&self, ids: Vec<String>) -> AutomationResult<usize> {
        self.request(|reply| Command::Cancel { ids, reply })?.wait().await
    }

    /// Cancel every schedule in a group, returning how many were removed.
    pub async fn cancel_group(&self, group: impl Into<String>) -> AutomationResult<usize> {
        let group = group.into();
        self.request(|reply| Command::CancelGroup { group, reply })?
            .wait()
            .await
    }

    /// Get a schedule by ID.
    pub async fn get_schedule(&self, id: impl Into<String>) -> AutomationResult<Option<Schedule>> {
        let id = id.into();
        self.request(|reply| Command::GetSchedule { id, reply })?
            .wait()
            .await
    }

    /// Get every schedule in a group.
    pub async fn get_schedules_by_group(
        &self,
        group: impl Into<String>,
    ) -> AutomationResult<Vec<Schedule>> {
        let group = group.into();
        self.request(|reply| Command::GetGroup { group, reply })?
            .wait()
            .await
    }

    /// Queue an event for evaluation.
    pub fn track(&self, event: impl Into<AutomationEvent>) -> AutomationResult<()> {
        self.send(Command::Event {
            event: event.into(),
            reply: None,
        })
    }

    /// Evaluate an event and wait for its dispatches.
    ///
    /// Returns the ids of schedules whose actions ran while handling the
    /// event, or the first store or executor error.
    pub async fn track_and_wait(
        &self,
        event: impl Into<AutomationEvent>,
    ) -> AutomationResult<Vec<String>> {
        let event = event.into();
        self.request(|reply| Command::Event {
            event,
            reply: Some(reply),
        })?
        .wait()
        .await
    }

    /// Wait until every previously queued command has been processed.
    pub async fn flush(&self) -> AutomationResult<()> {
        self.request(Command::Flush)?.wait().await
    }

    /// Pause or resume event processing.
    ///
    /// While paused, events still update the app state snapshot but advance
    /// no triggers, and ready delayed schedules are held until resumed.
    pub fn set_paused(&self, paused: bool) -> AutomationResult<()> {
        match self.state.load(Ordering::SeqCst) {
            TORN_DOWN => Err(AutomationError::TornDown),
            RUNNING => {
                self.paused.store(paused, Ordering::SeqCst);
                self.sender
                    .send(Command::SetPaused(paused))
                    .map_err(|_| AutomationError::TornDown)
            }
            _ => {
                self.paused.store(paused, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> AutomationResult<()> {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => Ok(()),
            CREATED => Err(AutomationError::NotStarted),
            _ => Err(AutomationError::TornDown),
        }
    }

    fn send(&self, command: Command) -> AutomationResult<()> {
        self.ensure_running()?;
        self.sender
            .send(command)
            .map_err(|_| AutomationError::TornDown)
    }

    fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> AutomationResult<PendingResult<T>> {
        let (reply, receiver) = oneshot::channel();
        self.send(make(reply))?;
        Ok(PendingResult { receiver })
    }
}

impl Drop for Automation {
    fn drop(&mut self) {
        self.state.store(TORN_DOWN, Ordering::SeqCst);
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(sink) = tasks.sink.take() {
                self.bus.detach(sink);
            }
        }
        let _ = self.sender.send(Command::Shutdown);
    }
}

/// Schedules reached by one event pass, split by outcome.
#[derive(Default)]
struct Plan {
    fired: Vec<Schedule>,
    deleted: Vec<String>,
    cancelled: Vec<String>,
}

/// Groups trigger ids by the amount they change by.
#[derive(Default)]
struct AmountGroups(BTreeMap<u64, (f64, Vec<i64>)>);

impl AmountGroups {
    fn add(&mut self, by: f64, id: i64) {
        self.0.entry(by.to_bits()).or_insert((by, Vec::new())).1.push(id);
    }

    fn into_ops(self, op: impl Fn(f64, Vec<i64>) -> UpdateOp) -> impl Iterator<Item = UpdateOp> {
        self.0.into_values().map(move |(by, ids)| op(by, ids))
    }
}

struct Worker {
    store: Arc<dyn AutomationStore>,
    executor: Arc<dyn ActionExecutor>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    delays: DelayScheduler,
    predicates: PredicateCache,
    paused: bool,
    has_schedules: bool,
    recovered: Vec<Schedule>,
    receiver: mpsc::UnboundedReceiver<Command>,
    state: Arc<AtomicU8>,
}

impl Worker {
    async fn run(mut self, ready: oneshot::Sender<AutomationResult<()>>) {
        let recovered = self.recover().await;
        if let Err(e) = &recovered {
            error!(error = %e, "Failed to restore automation state");
        }
        let _ = ready.send(recovered);

        while let Some(command) = self.receiver.recv().await {
            if matches!(command, Command::Shutdown)
                || self.state.load(Ordering::SeqCst) == TORN_DOWN
            {
                self.shutdown(command);
                break;
            }
            self.handle(command).await;
        }
    }

    async fn recover(&mut self) -> AutomationResult<()> {
        let count = self.store.schedule_count()?;
        self.has_schedules = count > 0;

        let now = self.clock.now_millis();
        let delayed = self.store.get_delayed_schedules()?;
        let dispatching = self.store.get_dispatching_schedules()?;
        info!(
            schedules = count,
            delayed = delayed.len(),
            dispatching = dispatching.len(),
            "Restoring automation state"
        );

        for schedule in delayed {
            self.delays.arm(schedule, now);
        }
        self.recovered = dispatching;
        self.dispatch_ready().await;
        Ok(())
    }

    fn shutdown(&mut self, first: Command) {
        first.cancel();
        self.delays.clear();
        self.receiver.close();

        let mut drained = 0;
        while let Ok(command) = self.receiver.try_recv() {
            command.cancel();
            drained += 1;
        }
        info!(drained, "Automation worker stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Schedule { infos, reply } => {
                let result = self.store.insert_schedules(&infos);
                match &result {
                    Ok(schedules) => {
                        self.has_schedules |= !schedules.is_empty();
                        for schedule in schedules {
                            info!(schedule_id = %schedule.id, group = ?schedule.group(), "Schedule created");
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to insert schedules"),
                }
                reply.send(result);
            }
            Command::Cancel { ids, reply } => {
                let result = self.store.delete_schedules(&ids).map(|deleted| {
                    for id in &ids {
                        self.delays.cancel(id);
                    }
                    self.predicates.forget_schedules(&ids);
                    deleted
                });
                if matches!(result, Ok(n) if n > 0) {
                    info!(count = ids.len(), "Schedules cancelled");
                    self.refresh_has_schedules();
                }
                let _ = reply.send(result);
            }
            Command::CancelGroup { group, reply } => {
                let result = self.store.delete_group(&group).map(|ids| {
                    for id in &ids {
                        self.delays.cancel(id);
                    }
                    self.predicates.forget_schedules(&ids);
                    ids.len()
                });
                if matches!(result, Ok(n) if n > 0) {
                    info!(group = %group, "Schedule group cancelled");
                    self.refresh_has_schedules();
                }
                let _ = reply.send(result);
            }
            Command::GetSchedule { id, reply } => {
                let _ = reply.send(self.store.get_schedule(&id));
            }
            Command::GetGroup { group, reply } => {
                let _ = reply.send(self.store.get_schedules_by_group(&group));
            }
            Command::Event { event, reply } => {
                let result = self.process_event(&event).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::DelayElapsed(id) => {
                if !self.delays.is_pending(&id) {
                    debug!(schedule_id = %id, "Ignoring timer for a settled schedule");
                    return;
                }
                debug!(schedule_id = %id, "Delay elapsed");
                self.delays.time_elapsed(&id);
                self.dispatch_ready().await;
            }
            Command::SetPaused(paused) => {
                if self.paused != paused {
                    self.paused = paused;
                    info!(paused, "Automation pause state changed");
                    self.dispatch_ready().await;
                }
            }
            Command::Flush(reply) => {
                let _ = reply.send(Ok(()));
            }
            Command::Shutdown => {}
        }
    }

    fn refresh_has_schedules(&mut self) {
        match self.store.schedule_count() {
            Ok(count) => self.has_schedules = count > 0,
            Err(e) => warn!(error = %e, "Failed to count schedules"),
        }
    }

    async fn process_event(&mut self, event: &AutomationEvent) -> AutomationResult<Vec<String>> {
        self.delays.observe(event);
        if self.paused {
            debug!(event_type = event.event_type(), "Automation paused; skipping event");
            return Ok(Vec::new());
        }

        let mut dispatched = Vec::new();
        let mut first_error = None;

        if self.has_schedules {
            match self.evaluate(event) {
                Ok(fired) => {
                    for schedule in fired {
                        match self.dispatch(schedule).await {
                            Ok(id) => dispatched.push(id),
                            Err(e) => {
                                first_error.get_or_insert(e);
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(
                        event_type = event.event_type(),
                        error = %e,
                        "Failed to apply trigger updates"
                    );
                    first_error = Some(e);
                }
            }
        } else {
            debug!(event_type = event.event_type(), "No schedules; skipping trigger evaluation");
        }

        let (ready, error) = self.dispatch_ready().await;
        dispatched.extend(ready);
        if let Some(e) = error {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(dispatched),
        }
    }

    /// Advance triggers for one event and persist the outcome in one batch.
    ///
    /// Returns the schedules to dispatch right away; delayed ones are armed.
    fn evaluate(&mut self, event: &AutomationEvent) -> AutomationResult<Vec<Schedule>> {
        let now = self.clock.now_millis();

        let mut entries = Vec::new();
        for trigger_type in event.trigger_types() {
            entries.extend(self.store.get_active_triggers(*trigger_type)?);
        }
        if entries.is_empty() {
            debug!(event_type = event.event_type(), "No active triggers");
            return Ok(Vec::new());
        }

        let mut increments: HashMap<i64, f64> = HashMap::new();
        let mut fulfilled = BTreeSet::new();
        let mut cancelling = BTreeSet::new();
        for entry in &entries {
            let result = self.predicates.evaluate(event, entry);
            if !result.matches {
                continue;
            }
            increments.insert(entry.id, result.value);
            if entry.progress + result.value >= entry.goal {
                if entry.is_cancellation {
                    cancelling.insert(entry.schedule_id.clone());
                } else {
                    fulfilled.insert(entry.schedule_id.clone());
                }
            }
        }
        if increments.is_empty() {
            debug!(event_type = event.event_type(), "No triggers matched");
            return Ok(Vec::new());
        }

        // A schedule fires only once every one of its triggers is at goal
        let candidates: Vec<String> = fulfilled.iter().cloned().collect();
        let mut schedule_triggers: HashMap<String, Vec<TriggerEntry>> = HashMap::new();
        for entry in self.store.get_triggers_for_schedules(&candidates)? {
            if !entry.is_cancellation {
                schedule_triggers
                    .entry(entry.schedule_id.clone())
                    .or_default()
                    .push(entry);
            }
        }
        fulfilled.retain(|id| {
            schedule_triggers.get(id).is_some_and(|triggers| {
                triggers.iter().all(|t| {
                    t.progress + increments.get(&t.id).copied().unwrap_or(0.0) >= t.goal
                })
            })
        });

        let lookup: Vec<String> = fulfilled.iter().chain(cancelling.iter()).cloned().collect();
        let schedules: HashMap<String, Schedule> = self
            .store
            .get_schedules(&lookup)?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        let plan = self.plan(&fulfilled, &cancelling, &schedules, now);
        let update = self.build_update(&entries, &increments, &schedule_triggers, &plan, now);

        debug!(
            event_type = event.event_type(),
            matched = increments.len(),
            ops = ?update.names(),
            "Applying trigger updates"
        );
        self.store.update_lists(&update)?;

        for id in &plan.cancelled {
            self.delays.cancel(id);
            info!(schedule_id = %id, "Delayed schedule cancelled by trigger");
        }
        if !plan.deleted.is_empty() {
            self.predicates.forget_schedules(&plan.deleted);
            self.refresh_has_schedules();
        }

        let mut immediate = Vec::new();
        for mut schedule in plan.fired {
            schedule.execution_count += 1;
            match schedule.info.delay.as_ref().map(ScheduleDelay::millis) {
                Some(millis) => {
                    schedule.execution_state = ExecutionState::Delayed;
                    schedule.delayed_execution_timestamp = Some(now.saturating_add(millis));
                    info!(schedule_id = %schedule.id, delay_ms = millis, "Schedule fulfilled; waiting on delay");
                    self.delays.arm(schedule, now);
                }
                None => {
                    schedule.execution_state = ExecutionState::Dispatching;
                    immediate.push(schedule);
                }
            }
        }
        Ok(immediate)
    }

    fn plan(
        &self,
        fulfilled: &BTreeSet<String>,
        cancelling: &BTreeSet<String>,
        schedules: &HashMap<String, Schedule>,
        now: i64,
    ) -> Plan {
        let mut plan = Plan::default();

        for id in fulfilled {
            let Some(schedule) = schedules.get(id) else {
                continue;
            };
            if !schedule.has_started(now) {
                debug!(schedule_id = %id, "Schedule fulfilled before its start; keeping progress");
                continue;
            }
            if schedule.is_expired(now) {
                info!(schedule_id = %id, "Schedule expired; deleting");
                plan.deleted.push(id.clone());
                continue;
            }
            if schedule.is_limit_reached() {
                info!(schedule_id = %id, "Schedule limit reached; deleting");
                plan.deleted.push(id.clone());
                continue;
            }
            plan.fired.push(schedule.clone());
        }

        for id in cancelling {
            if schedules.get(id).is_some_and(Schedule::is_delayed) {
                plan.cancelled.push(id.clone());
            }
        }

        plan
    }

    fn build_update(
        &self,
        entries: &[TriggerEntry],
        increments: &HashMap<i64, f64>,
        schedule_triggers: &HashMap<String, Vec<TriggerEntry>>,
        plan: &Plan,
        now: i64,
    ) -> StoreUpdate {
        let fired: HashSet<&str> = plan.fired.iter().map(|s| s.id.as_str()).collect();
        let deleted: HashSet<&str> = plan.deleted.iter().map(String::as_str).collect();
        let cancelled: HashSet<&str> = plan.cancelled.iter().map(String::as_str).collect();

        let mut update = StoreUpdate::new();

        let mut increment = AmountGroups::default();
        for entry in entries {
            let Some(&by) = increments.get(&entry.id) else {
                continue;
            };
            let schedule_id = entry.schedule_id.as_str();
            let settled = if entry.is_cancellation {
                cancelled.contains(schedule_id)
            } else {
                fired.contains(schedule_id)
            };
            if settled || deleted.contains(schedule_id) {
                continue;
            }
            increment.add(by, entry.id);
        }
        for op in increment.into_ops(|by, ids| UpdateOp::IncrementTriggers { by, ids }) {
            update.push(op);
        }

        let mut reset = Vec::new();
        let mut carry_over = AmountGroups::default();
        for schedule in &plan.fired {
            for trigger in schedule_triggers.get(&schedule.id).into_iter().flatten() {
                match self.config.policy_for(trigger.trigger_type) {
                    ProgressPolicy::Reset => reset.push(trigger.id),
                    ProgressPolicy::CarryOver => {
                        let by = increments.get(&trigger.id).copied().unwrap_or(0.0);
                        carry_over.add(by, trigger.id);
                    }
                }
            }
        }
        update.push(UpdateOp::ResetTriggers { ids: reset });
        for op in carry_over.into_ops(|by, ids| UpdateOp::CarryOverTriggers { by, ids }) {
            update.push(op);
        }

        let fired_ids: Vec<String> = plan.fired.iter().map(|s| s.id.clone()).collect();
        update.push(UpdateOp::IncrementExecutionCount {
            schedule_ids: fired_ids,
        });

        let (delayed, immediate): (Vec<&Schedule>, Vec<&Schedule>) =
            plan.fired.iter().partition(|s| s.info.delay.is_some());
        update.push(UpdateOp::SetExecutionState {
            state: ExecutionState::Dispatching,
            schedule_ids: immediate.iter().map(|s| s.id.clone()).collect(),
        });
        update.push(UpdateOp::SetExecutionState {
            state: ExecutionState::Delayed,
            schedule_ids: delayed.iter().map(|s| s.id.clone()).collect(),
        });
        for schedule in &delayed {
            let millis = schedule.info.delay.as_ref().map_or(0, ScheduleDelay::millis);
            update.push(UpdateOp::SetDelayTimestamp {
                at: Some(now.saturating_add(millis)),
                schedule_ids: vec![schedule.id.clone()],
            });
        }

        update.push(UpdateOp::ResetCancellationTriggers {
            schedule_ids: delayed
                .iter()
                .map(|s| s.id.clone())
                .chain(plan.cancelled.iter().cloned())
                .collect(),
        });
        // A discarded delay gives back the execution it was counted against
        update.push(UpdateOp::DecrementExecutionCount {
            schedule_ids: plan.cancelled.clone(),
        });
        update.push(UpdateOp::SetExecutionState {
            state: ExecutionState::Idle,
            schedule_ids: plan.cancelled.clone(),
        });
        update.push(UpdateOp::SetDelayTimestamp {
            at: None,
            schedule_ids: plan.cancelled.clone(),
        });
        update.push(UpdateOp::DeleteSchedules {
            schedule_ids: plan.deleted.clone(),
        });

        update
    }

    /// Dispatch recovered schedules and delayed schedules whose conditions hold.
    async fn dispatch_ready(&mut self) -> (Vec<String>, Option<AutomationError>) {
        let mut dispatched = Vec::new();
        let mut first_error = None;
        if self.paused {
            return (dispatched, first_error);
        }

        let mut ready = std::mem::take(&mut self.recovered);
        let now = self.clock.now_millis();
        for mut schedule in self.delays.take_ready() {
            let mut update = StoreUpdate::new();
            update.push(UpdateOp::SetExecutionState {
                state: ExecutionState::Dispatching,
                schedule_ids: vec![schedule.id.clone()],
            });
            update.push(UpdateOp::SetDelayTimestamp {
                at: None,
                schedule_ids: vec![schedule.id.clone()],
            });

            match self.store.update_lists(&update) {
                Ok(()) => {
                    schedule.execution_state = ExecutionState::Dispatching;
                    schedule.delayed_execution_timestamp = None;
                    ready.push(schedule);
                }
                Err(e) => {
                    error!(schedule_id = %schedule.id, error = %e, "Failed to mark delayed schedule dispatching");
                    self.delays.arm(schedule, now);
                    first_error.get_or_insert(e);
                }
            }
        }

        for schedule in ready {
            match self.dispatch(schedule).await {
                Ok(id) => dispatched.push(id),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        (dispatched, first_error)
    }

    /// Run a schedule's actions and settle its bookkeeping.
    ///
    /// On executor failure the schedule stays dispatching and is retried on
    /// the next start.
    async fn dispatch(&mut self, schedule: Schedule) -> AutomationResult<String> {
        info!(
            schedule_id = %schedule.id,
            execution_count = schedule.execution_count,
            limit = schedule.info.limit,
            "Dispatching schedule"
        );

        if let Err(e) = self.executor.execute(&schedule).await {
            error!(schedule_id = %schedule.id, error = %e, "Schedule dispatch failed");
            return Err(e);
        }

        let finished = schedule.execution_count >= schedule.info.limit;
        let mut update = StoreUpdate::new();
        if finished {
            update.push(UpdateOp::DeleteSchedules {
                schedule_ids: vec![schedule.id.clone()],
            });
        } else {
            update.push(UpdateOp::SetExecutionState {
                state: ExecutionState::Idle,
                schedule_ids: vec![schedule.id.clone()],
            });
        }
        if let Err(e) = self.store.update_lists(&update) {
            error!(schedule_id = %schedule.id, error = %e, "Failed to settle dispatched schedule");
            return Err(e);
        }

        if finished {
            info!(schedule_id = %schedule.id, "Schedule finished its last execution");
            self.predicates.forget_schedules(std::slice::from_ref(&schedule.id));
            self.refresh_has_schedules();
        }
        Ok(schedule.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::executor::ChannelExecutor;
    use crate::automation::store::{MockAutomationStore, SqliteAutomationStore};
    use crate::automation::types::{Trigger, TriggerType};
    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    fn config() -> EngineConfig {
        EngineConfig::builder().in_memory().build()
    }

    fn quiet_store() -> MockAutomationStore {
        let mut store = MockAutomationStore::new();
        store.expect_get_delayed_schedules().returning(|| Ok(Vec::new()));
        store
            .expect_get_dispatching_schedules()
            .returning(|| Ok(Vec::new()));
        store
    }

    fn engine(store: impl AutomationStore + 'static) -> (Automation, mpsc::UnboundedReceiver<Schedule>) {
        let (executor, rx) = ChannelExecutor::new();
        let automation = Automation::new(
            Arc::new(store),
            Arc::new(executor),
            EventBus::new(),
            config(),
        );
        (automation, rx)
    }

    #[tokio::test]
    async fn test_no_trigger_reads_without_schedules() {
        let mut store = quiet_store();
        store.expect_schedule_count().returning(|| Ok(0));
        store.expect_get_active_triggers().times(0);
        store.expect_update_lists().times(0);

        let (automation, _rx) = engine(store);
        automation.start().await.unwrap();

        let dispatched = automation
            .track_and_wait(AutomationEvent::Foreground)
            .await
            .unwrap();
        assert!(dispatched.is_empty());
        automation.tear_down().await;
    }

    #[tokio::test]
    async fn test_unmatched_event_writes_nothing() {
        let mut store = quiet_store();
        store.expect_schedule_count().returning(|| Ok(1));
        store
            .expect_get_active_triggers()
            .withf(|t| *t == TriggerType::CustomEventCount)
            .returning(|t| {
                Ok(vec![TriggerEntry {
                    id: 1,
                    trigger_type: t,
                    goal: 1.0,
                    predicate: Trigger::custom_event_count("name", 1.0).predicate,
                    schedule_id: "s".to_string(),
                    is_cancellation: false,
                    progress: 0.0,
                }])
            });
        store
            .expect_get_active_triggers()
            .withf(|t| *t == TriggerType::CustomEventValue)
            .returning(|_| Ok(Vec::new()));
        store.expect_update_lists().times(0);

        let (automation, _rx) = engine(store);
        automation.start().await.unwrap();

        let dispatched = automation
            .track_and_wait(AutomationEvent::custom("other"))
            .await
            .unwrap();
        assert!(dispatched.is_empty());
        automation.tear_down().await;
    }

    #[tokio::test]
    async fn test_failed_batch_dispatches_nothing() {
        let mut store = quiet_store();
        store.expect_schedule_count().returning(|| Ok(1));
        store.expect_get_active_triggers().returning(|t| {
            Ok(vec![TriggerEntry {
                id: 1,
                trigger_type: t,
                goal: 1.0,
                predicate: None,
                schedule_id: "s".to_string(),
                is_cancellation: false,
                progress: 0.0,
            }])
        });
        store.expect_get_triggers_for_schedules().returning(|_| {
            Ok(vec![TriggerEntry {
                id: 1,
                trigger_type: TriggerType::Foreground,
                goal: 1.0,
                predicate: None,
                schedule_id: "s".to_string(),
                is_cancellation: false,
                progress: 0.0,
            }])
        });
        store.expect_get_schedules().returning(|_| {
            Ok(vec![Schedule {
                id: "s".to_string(),
                info: ScheduleInfo::new().with_trigger(Trigger::foreground(1.0)),
                execution_count: 0,
                execution_state: ExecutionState::Idle,
                delayed_execution_timestamp: None,
            }])
        });
        store
            .expect_update_lists()
            .times(1)
            .returning(|_| Err(AutomationError::database("disk full")));

        let (automation, mut rx) = engine(store);
        automation.start().await.unwrap();

        let err = automation
            .track_and_wait(AutomationEvent::Foreground)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(rx.try_recv().is_err());
        automation.tear_down().await;
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let (automation, _rx) = engine(SqliteAutomationStore::in_memory().unwrap());
        let info = ScheduleInfo::new().with_trigger(Trigger::foreground(1.0));

        assert!(matches!(
            automation.schedule(info.clone()).await,
            Err(AutomationError::NotStarted)
        ));
        assert!(matches!(
            automation.track(AutomationEvent::Foreground),
            Err(AutomationError::NotStarted)
        ));

        automation.start().await.unwrap();
        automation.start().await.unwrap();
        assert!(automation.is_running());

        automation.tear_down().await;
        assert!(matches!(
            automation.schedule(info).await,
            Err(AutomationError::TornDown)
        ));
        assert!(matches!(automation.flush().await, Err(AutomationError::TornDown)));
        assert!(matches!(automation.start().await, Err(AutomationError::TornDown)));
    }

    struct GatedExecutor {
        gate: Arc<Semaphore>,
        entered: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl ActionExecutor for GatedExecutor {
        async fn execute(&self, _schedule: &Schedule) -> AutomationResult<()> {
            self.entered.notify_one();
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| AutomationError::Internal(e.to_string()))?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_queued_requests_cancelled_on_tear_down() {
        let gate = Arc::new(Semaphore::new(0));
        let entered = Arc::new(tokio::sync::Notify::new());
        let automation = Arc::new(Automation::new(
            Arc::new(SqliteAutomationStore::in_memory().unwrap()),
            Arc::new(GatedExecutor {
                gate: gate.clone(),
                entered: entered.clone(),
            }),
            EventBus::new(),
            config(),
        ));
        automation.start().await.unwrap();
        automation
            .schedule(ScheduleInfo::new().with_trigger(Trigger::foreground(1.0)))
            .await
            .unwrap();

        // Worker blocks inside the executor
        automation.track(AutomationEvent::Foreground).unwrap();
        entered.notified().await;

        let queued = automation
            .schedule_async(ScheduleInfo::new().with_trigger(Trigger::background(1.0)))
            .unwrap();

        let tear_down = tokio::spawn({
            let automation = automation.clone();
            async move { automation.tear_down().await }
        });
        while automation.is_running() {
            tokio::task::yield_now().await;
        }
        gate.add_permits(1);
        tear_down.await.unwrap();

        assert!(matches!(queued.wait().await, Err(AutomationError::Cancelled)));
    }
}
