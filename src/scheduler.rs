// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::Bytes;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};

use codec::{TimeDuration, Timestamp};

use crate::energy::{
    op_type, EnergyBudget, EnergyEvent, EnergyEventKind, EnergyEventManager, EnergyTracker,
};
use crate::error::{Error, ErrorKind};
use crate::time_utils::ScheduleAt;

/// Past instants older than this slack are rejected at schedule time.
const PAST_SLACK: TimeDuration = TimeDuration::from_secs(5);

/// Lifecycle state of one scheduled call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScheduleStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A reducer invocation handed from the scheduler to the session loop.
///
/// The responder resolves once the matching transaction update arrives,
/// or fails when the session drops the call.
pub struct ScheduledInvoke {
    pub reducer: String,
    pub args: Bytes,
    pub responder: oneshot::Sender<Result<(), Error>>,
}

/// Outcome of one fire, handed to the execution callback.
#[derive(Clone, Debug)]
pub struct ScheduleResult {
    pub schedule_id: String,
    pub execution_count: u64,
    pub duration: TimeDuration,
    pub error: Option<String>,
}

type ExecutionCallback = Arc<dyn Fn(&ScheduleResult) + Send + Sync>;

/// Read-only snapshot of one scheduled call.
#[derive(Clone, Debug)]
pub struct ScheduleInfo {
    pub schedule_id: String,
    pub reducer: String,
    pub schedule_at: ScheduleAt,
    pub status: ScheduleStatus,
    pub execution_count: u64,
    pub next_fire: Option<Timestamp>,
    pub last_error: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Aggregate counters over all scheduled calls.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_executions: u64,
}

struct ScheduledCall {
    reducer: String,
    args: Bytes,
    schedule_at: ScheduleAt,
    status: ScheduleStatus,
    execution_count: u64,
    next_fire: Timestamp,
    last_error: Option<String>,
    metadata: HashMap<String, String>,

    /// Set when cancel arrives while the call is running; checked at
    /// completion to suppress re-arming.
    cancel_requested: bool,

    /// Bumped on every reschedule and re-arm; stale heap entries are
    /// recognized and dropped by generation mismatch.
    generation: u64,
}

#[derive(Clone, Eq, Ord, PartialEq, PartialOrd)]
struct HeapKey {
    fire_micros: i64,
    seq: u64,
    schedule_id: String,
    generation: u64,
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<Reverse<HeapKey>>,
    by_id: HashMap<String, ScheduledCall>,
    next_seq: u64,
    next_auto_id: u64,
}

/// Energy accounting hooks consulted before every fire.
#[derive(Clone, Default)]
pub struct SchedulerEnergy {
    pub tracker: Option<Arc<EnergyTracker>>,
    pub budget: Option<Arc<EnergyBudget>>,
    pub events: Option<Arc<EnergyEventManager>>,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    notify: Notify,
    shutdown: AtomicBool,
    invoker: mpsc::UnboundedSender<ScheduledInvoke>,
    in_flight: Arc<Semaphore>,
    energy: SchedulerEnergy,
    on_execution: Mutex<Option<ExecutionCallback>>,
    on_error: Mutex<Option<ExecutionCallback>>,
}

/// Fires reducer invocations at absolute timestamps or on recurring
/// intervals.
///
/// Entries live in a min-heap keyed by next fire time with insertion
/// order breaking ties. A single cooperative worker drains the heap; the
/// `max_concurrent` bound limits in-flight invocations, with further
/// fires deferred rather than dropped. Cancelling a running entry only
/// prevents re-arming.
#[derive(Clone)]
pub struct ReducerScheduler {
    shared: Arc<SchedulerShared>,
}

impl ReducerScheduler {
    /// Create a scheduler that hands invocations to `invoker`.
    #[must_use]
    pub fn new(
        invoker: mpsc::UnboundedSender<ScheduledInvoke>,
        max_concurrent: usize,
        energy: SchedulerEnergy,
    ) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                state: Mutex::new(SchedulerState::default()),
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
                invoker,
                in_flight: Arc::new(Semaphore::new(max_concurrent.max(1))),
                energy,
                on_execution: Mutex::new(None),
                on_error: Mutex::new(None),
            }),
        }
    }

    /// Install a callback fired after every successful execution.
    pub fn set_on_execution(&self, callback: impl Fn(&ScheduleResult) + Send + Sync + 'static) {
        *lock(&self.shared.on_execution) = Some(Arc::new(callback));
    }

    /// Install a callback fired after every failed execution.
    pub fn set_on_error(&self, callback: impl Fn(&ScheduleResult) + Send + Sync + 'static) {
        *lock(&self.shared.on_error) = Some(Arc::new(callback));
    }

    /// Register a new scheduled call and wake the worker.
    ///
    /// # Errors
    ///
    /// Returns error for an instant in the past beyond a small slack, a
    /// non-positive interval, or a caller-supplied id already in use.
    pub fn schedule(
        &self,
        reducer: &str,
        args: Bytes,
        schedule_at: ScheduleAt,
        schedule_id: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<String, Error> {
        schedule_at.validate()?;
        let now = Timestamp::now();
        if let ScheduleAt::Time(at) = schedule_at {
            if at < now - PAST_SLACK {
                return Err(Error::from_string(
                    ErrorKind::SchedulerError,
                    format!("Schedule time {at} is in the past"),
                ));
            }
        }

        let mut state = lock(&self.shared.state);
        let schedule_id = match schedule_id {
            Some(id) => {
                if state.by_id.contains_key(&id) {
                    return Err(Error::from_string(
                        ErrorKind::SchedulerError,
                        format!("Schedule id '{id}' already exists"),
                    ));
                }
                id
            }
            None => {
                state.next_auto_id += 1;
                format!("schedule-{}", state.next_auto_id)
            }
        };

        let next_fire = schedule_at.to_timestamp_from(now);
        state.by_id.insert(
            schedule_id.clone(),
            ScheduledCall {
                reducer: reducer.to_string(),
                args,
                schedule_at,
                status: ScheduleStatus::Pending,
                execution_count: 0,
                next_fire,
                last_error: None,
                metadata,
                cancel_requested: false,
                generation: 0,
            },
        );
        Self::push_entry(&mut state, &schedule_id, next_fire, 0);
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(schedule_id)
    }

    /// Move an existing entry to a new schedule.
    ///
    /// # Errors
    ///
    /// Returns error for unknown ids, finished entries or an invalid
    /// schedule.
    pub fn reschedule(&self, schedule_id: &str, schedule_at: ScheduleAt) -> Result<(), Error> {
        schedule_at.validate()?;
        let now = Timestamp::now();
        let mut state = lock(&self.shared.state);
        let Some(call) = state.by_id.get_mut(schedule_id) else {
            return Err(Error::from_string(
                ErrorKind::SchedulerError,
                format!("Unknown schedule id '{schedule_id}'"),
            ));
        };
        if matches!(
            call.status,
            ScheduleStatus::Completed | ScheduleStatus::Cancelled
        ) {
            return Err(Error::from_string(
                ErrorKind::SchedulerError,
                format!("Schedule '{schedule_id}' already finished"),
            ));
        }
        call.schedule_at = schedule_at;
        call.next_fire = schedule_at.to_timestamp_from(now);
        call.generation += 1;
        call.status = ScheduleStatus::Pending;
        let (next_fire, generation) = (call.next_fire, call.generation);
        Self::push_entry(&mut state, schedule_id, next_fire, generation);
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Cancel an entry. Idempotent; a running fire is not aborted, it
    /// only stops re-arming.
    pub fn cancel(&self, schedule_id: &str) {
        let mut state = lock(&self.shared.state);
        if let Some(call) = state.by_id.get_mut(schedule_id) {
            if call.status == ScheduleStatus::Running {
                // The in-flight fire is not aborted; completion sees the
                // flag and skips re-arming.
                call.cancel_requested = true;
            } else {
                call.status = ScheduleStatus::Cancelled;
            }
            // Invalidate any queued heap entry.
            call.generation += 1;
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Snapshot all entries.
    #[must_use]
    pub fn list(&self) -> Vec<ScheduleInfo> {
        let state = lock(&self.shared.state);
        let mut entries: Vec<ScheduleInfo> = state
            .by_id
            .iter()
            .map(|(id, call)| ScheduleInfo {
                schedule_id: id.clone(),
                reducer: call.reducer.clone(),
                schedule_at: call.schedule_at,
                status: call.status,
                execution_count: call.execution_count,
                next_fire: (call.status == ScheduleStatus::Pending).then_some(call.next_fire),
                last_error: call.last_error.clone(),
                metadata: call.metadata.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.schedule_id.cmp(&b.schedule_id));
        entries
    }

    /// Snapshot one entry.
    #[must_use]
    pub fn info(&self, schedule_id: &str) -> Option<ScheduleInfo> {
        self.list()
            .into_iter()
            .find(|info| info.schedule_id == schedule_id)
    }

    /// Earliest pending fire time, if any.
    #[must_use]
    pub fn next_fire_time(&self) -> Option<Timestamp> {
        let state = lock(&self.shared.state);
        state
            .by_id
            .values()
            .filter(|call| call.status == ScheduleStatus::Pending)
            .map(|call| call.next_fire)
            .min()
    }

    /// Aggregate counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let state = lock(&self.shared.state);
        let mut stats = SchedulerStats::default();
        for call in state.by_id.values() {
            match call.status {
                ScheduleStatus::Pending => stats.pending += 1,
                ScheduleStatus::Running => stats.running += 1,
                ScheduleStatus::Completed => stats.completed += 1,
                ScheduleStatus::Failed => stats.failed += 1,
                ScheduleStatus::Cancelled => stats.cancelled += 1,
            }
            stats.total_executions += call.execution_count;
        }
        stats
    }

    /// Run the cooperative worker until [`ReducerScheduler::stop`].
    ///
    /// The worker wakes at the next fire time or on any schedule
    /// mutation, fires due entries in non-decreasing fire-time order and
    /// re-arms intervals after each execution.
    pub async fn run_worker(&self) {
        loop {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let due = self.pop_due_entry();
            match due {
                NextAction::Fire(key) => self.fire(key).await,
                NextAction::WaitUntil(fire) => {
                    let wait = fire.saturating_since(Timestamp::now());
                    let sleep = tokio::time::sleep(
                        wait.to_std().unwrap_or(std::time::Duration::ZERO),
                    );
                    tokio::select! {
                        () = sleep => {}
                        () = self.shared.notify.notified() => {}
                    }
                }
                NextAction::Idle => {
                    self.shared.notify.notified().await;
                }
            }
        }
    }

    /// Stop the worker and prevent further fires.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    fn push_entry(state: &mut SchedulerState, schedule_id: &str, fire: Timestamp, generation: u64) {
        state.next_seq += 1;
        let seq = state.next_seq;
        state.heap.push(Reverse(HeapKey {
            fire_micros: fire.micros(),
            seq,
            schedule_id: schedule_id.to_string(),
            generation,
        }));
    }

    /// Pop the earliest live heap entry that is due, skipping stale and
    /// cancelled entries.
    fn pop_due_entry(&self) -> NextAction {
        let mut state = lock(&self.shared.state);
        let now = Timestamp::now();
        loop {
            let Some(Reverse(key)) = state.heap.peek().cloned() else {
                return NextAction::Idle;
            };
            let live = state.by_id.get(&key.schedule_id).map_or(false, |call| {
                call.generation == key.generation && call.status == ScheduleStatus::Pending
            });
            if !live {
                state.heap.pop();
                continue;
            }
            if key.fire_micros > now.micros() {
                return NextAction::WaitUntil(Timestamp::from_micros(key.fire_micros));
            }
            state.heap.pop();
            return NextAction::Fire(key);
        }
    }

    async fn fire(&self, key: HeapKey) {
        // The concurrency bound defers due fires instead of dropping
        // them; the permit travels into the completion task.
        let Ok(permit) = Arc::clone(&self.shared.in_flight).acquire_owned().await else {
            return;
        };
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let fire_data = {
            let mut state = lock(&self.shared.state);
            let Some(call) = state.by_id.get_mut(&key.schedule_id) else {
                return;
            };
            if call.generation != key.generation || call.status != ScheduleStatus::Pending {
                return;
            }

            let cost = self
                .shared
                .energy
                .tracker
                .as_ref()
                .map(|tracker| tracker.predict_cost(op_type::CALL_REDUCER, &call.reducer));
            let reservation = format!("{}#{}", key.schedule_id, call.execution_count);
            if let (Some(budget), Some(cost)) = (&self.shared.energy.budget, cost) {
                if !budget.reserve(&reservation, cost) {
                    call.status = ScheduleStatus::Failed;
                    call.last_error = Some("budget-exceeded".to_string());
                    Self::rearm_if_interval(call);
                    let next = (call.status == ScheduleStatus::Pending)
                        .then(|| (call.next_fire, call.generation));
                    if let Some((fire, generation)) = next {
                        let id = key.schedule_id.clone();
                        Self::push_entry(&mut state, &id, fire, generation);
                    }
                    drop(state);
                    self.emit_deferred(&key.schedule_id, cost);
                    return;
                }
            }

            call.status = ScheduleStatus::Running;
            (
                call.reducer.clone(),
                call.args.clone(),
                reservation,
                cost,
            )
        };
        let (reducer, args, reservation, cost) = fire_data;

        let (responder, response) = oneshot::channel();
        let sent = self
            .shared
            .invoker
            .send(ScheduledInvoke {
                reducer: reducer.clone(),
                args,
                responder,
            })
            .is_ok();

        let shared = Arc::clone(&self.shared);
        let schedule_id = key.schedule_id;
        tokio::spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            let result = if sent {
                match response.await {
                    Ok(result) => result,
                    Err(_) => Err(Error::terminated()),
                }
            } else {
                Err(Error::terminated())
            };
            let duration = TimeDuration::from_std(started.elapsed());
            complete_fire(&shared, &schedule_id, &reducer, &reservation, cost, result, duration);
            shared.notify.notify_waiters();
        });
    }

    fn emit_deferred(&self, schedule_id: &str, cost: u64) {
        log::warn!("Schedule '{schedule_id}' deferred: energy budget exhausted");
        if let Some(events) = &self.shared.energy.events {
            events.emit(&EnergyEvent {
                kind: EnergyEventKind::OperationDeferred,
                timestamp: Timestamp::now(),
                current_energy: cost,
                detail: format!("schedule '{schedule_id}' refused by budget"),
            });
        }
    }

    fn rearm_if_interval(call: &mut ScheduledCall) {
        if let ScheduleAt::Interval(interval) = call.schedule_at {
            call.status = ScheduleStatus::Pending;
            call.next_fire = Timestamp::now() + interval;
            call.generation += 1;
        }
    }
}

enum NextAction {
    Fire(HeapKey),
    WaitUntil(Timestamp),
    Idle,
}

fn complete_fire(
    shared: &Arc<SchedulerShared>,
    schedule_id: &str,
    reducer: &str,
    reservation: &str,
    cost: Option<u64>,
    result: Result<(), Error>,
    duration: TimeDuration,
) {
    let outcome = {
        let mut state = lock(&shared.state);
        let Some(call) = state.by_id.get_mut(schedule_id) else {
            return;
        };
        call.execution_count += 1;
        let execution_count = call.execution_count;
        match &result {
            Ok(()) => {
                call.last_error = None;
                call.status = match call.schedule_at {
                    ScheduleAt::Time(_) => ScheduleStatus::Completed,
                    // Intervals re-arm after each execution.
                    ScheduleAt::Interval(_) => ScheduleStatus::Pending,
                };
            }
            Err(err) => {
                call.last_error = Some(err.to_string());
                call.status = match call.schedule_at {
                    ScheduleAt::Time(_) => ScheduleStatus::Failed,
                    // Intervals re-arm after failures by default.
                    ScheduleAt::Interval(_) => ScheduleStatus::Pending,
                };
            }
        }
        if call.cancel_requested {
            call.status = ScheduleStatus::Cancelled;
        }
        let rearm = if call.status == ScheduleStatus::Pending {
            if let ScheduleAt::Interval(interval) = call.schedule_at {
                call.next_fire = Timestamp::now() + interval;
                call.generation += 1;
                Some((call.next_fire, call.generation))
            } else {
                None
            }
        } else {
            None
        };
        if let Some((fire, generation)) = rearm {
            ReducerScheduler::push_entry(&mut state, schedule_id, fire, generation);
        }
        ScheduleResult {
            schedule_id: schedule_id.to_string(),
            execution_count,
            duration,
            error: result.as_ref().err().map(ToString::to_string),
        }
    };

    if let (Some(budget), Some(cost)) = (&shared.energy.budget, cost) {
        budget.consume(cost, Some(reservation));
    }
    if let Some(tracker) = &shared.energy.tracker {
        tracker.track_operation(
            op_type::CALL_REDUCER,
            reducer,
            cost.unwrap_or(0),
            outcome.error.is_none(),
        );
    }

    let callback = if outcome.error.is_none() {
        lock(&shared.on_execution).clone()
    } else {
        lock(&shared.on_error).clone()
    };
    if let Some(callback) = callback {
        callback(&outcome);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Answer every scheduled invocation with `result`.
    fn auto_responder(
        mut rx: mpsc::UnboundedReceiver<ScheduledInvoke>,
        fail: bool,
    ) -> tokio::task::JoinHandle<usize> {
        tokio::spawn(async move {
            let mut count = 0;
            while let Some(invoke) = rx.recv().await {
                count += 1;
                let result = if fail {
                    Err(Error::new(ErrorKind::Connection, "gone"))
                } else {
                    Ok(())
                };
                let _ = invoke.responder.send(result);
            }
            count
        })
    }

    fn scheduler() -> (ReducerScheduler, mpsc::UnboundedReceiver<ScheduledInvoke>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ReducerScheduler::new(tx, 1, SchedulerEnergy::default()),
            rx,
        )
    }

    #[test]
    fn test_validation() {
        let (scheduler, _rx) = scheduler();
        let past = ScheduleAt::Time(Timestamp::epoch());
        assert!(scheduler
            .schedule("tick", Bytes::new(), past, None, HashMap::new())
            .is_err());
        assert!(scheduler
            .schedule(
                "tick",
                Bytes::new(),
                ScheduleAt::Interval(TimeDuration::zero()),
                None,
                HashMap::new()
            )
            .is_err());

        let ok = scheduler
            .schedule(
                "tick",
                Bytes::new(),
                ScheduleAt::Interval(TimeDuration::from_secs(1)),
                Some("job".to_string()),
                HashMap::new(),
            )
            .unwrap();
        assert_eq!(ok, "job");
        // Duplicate caller-supplied ids are refused.
        assert!(scheduler
            .schedule(
                "tick",
                Bytes::new(),
                ScheduleAt::Interval(TimeDuration::from_secs(1)),
                Some("job".to_string()),
                HashMap::new()
            )
            .is_err());
    }

    #[tokio::test]
    async fn test_earlier_schedule_fires_first() {
        let (scheduler, rx) = scheduler();
        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let order_clone = Arc::clone(&order);
        scheduler.set_on_execution(move |result| {
            order_clone.lock().unwrap().push(result.schedule_id.clone());
        });
        let _responder = auto_responder(rx, false);

        let now = Timestamp::now();
        scheduler
            .schedule(
                "later",
                Bytes::new(),
                ScheduleAt::Time(now + TimeDuration::from_millis(80)),
                Some("b".to_string()),
                HashMap::new(),
            )
            .unwrap();
        scheduler
            .schedule(
                "sooner",
                Bytes::new(),
                ScheduleAt::Time(now + TimeDuration::from_millis(20)),
                Some("a".to_string()),
                HashMap::new(),
            )
            .unwrap();

        let worker_handle = scheduler.clone();
        let worker = tokio::spawn(async move { worker_handle.run_worker().await });
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        scheduler.stop();
        let _ = worker.await;

        assert_eq!(*order.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
        let stats = scheduler.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.total_executions, 2);
    }

    #[tokio::test]
    async fn test_interval_rearms_and_cancel_stops() {
        let (scheduler, rx) = scheduler();
        let fires = Arc::new(AtomicUsize::new(0));
        let fires_clone = Arc::clone(&fires);
        scheduler.set_on_execution(move |_| {
            fires_clone.fetch_add(1, Ordering::SeqCst);
        });
        let _responder = auto_responder(rx, false);

        scheduler
            .schedule(
                "tick",
                Bytes::new(),
                ScheduleAt::Interval(TimeDuration::from_millis(50)),
                Some("tick".to_string()),
                HashMap::new(),
            )
            .unwrap();

        let worker_handle = scheduler.clone();
        let worker = tokio::spawn(async move { worker_handle.run_worker().await });

        tokio::time::sleep(std::time::Duration::from_millis(180)).await;
        scheduler.cancel("tick");
        let after_cancel = fires.load(Ordering::SeqCst);
        assert!(after_cancel >= 2, "expected repeated fires, saw {after_cancel}");

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert_eq!(fires.load(Ordering::SeqCst), after_cancel);
        assert_eq!(
            scheduler.info("tick").unwrap().status,
            ScheduleStatus::Cancelled
        );

        scheduler.stop();
        let _ = worker.await;
    }

    #[tokio::test]
    async fn test_cancel_pending_prevents_fire() {
        let (scheduler, rx) = scheduler();
        let fires = Arc::new(AtomicUsize::new(0));
        let fires_clone = Arc::clone(&fires);
        scheduler.set_on_execution(move |_| {
            fires_clone.fetch_add(1, Ordering::SeqCst);
        });
        let _responder = auto_responder(rx, false);

        scheduler
            .schedule(
                "once",
                Bytes::new(),
                ScheduleAt::Time(Timestamp::now() + TimeDuration::from_millis(60)),
                Some("once".to_string()),
                HashMap::new(),
            )
            .unwrap();
        scheduler.cancel("once");

        let worker_handle = scheduler.clone();
        let worker = tokio::spawn(async move { worker_handle.run_worker().await });
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        scheduler.stop();
        let _ = worker.await;

        assert_eq!(fires.load(Ordering::SeqCst), 0);
        // Cancelling again is a no-op.
        scheduler.cancel("once");
        assert_eq!(
            scheduler.info("once").unwrap().status,
            ScheduleStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_budget_refusal_marks_failed_and_emits_event() {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = Arc::new(EnergyEventManager::new());
        let energy = SchedulerEnergy {
            tracker: Some(Arc::new(EnergyTracker::new(1000, 1000))),
            // A zero budget refuses every reservation.
            budget: Some(Arc::new(EnergyBudget::new(
                0,
                TimeDuration::from_secs(3600),
            ))),
            events: Some(Arc::clone(&events)),
        };
        let scheduler = ReducerScheduler::new(tx, 1, energy);
        let _responder = auto_responder(rx, false);

        scheduler
            .schedule(
                "expensive",
                Bytes::new(),
                ScheduleAt::Time(Timestamp::now() + TimeDuration::from_millis(10)),
                Some("expensive".to_string()),
                HashMap::new(),
            )
            .unwrap();

        let worker_handle = scheduler.clone();
        let worker = tokio::spawn(async move { worker_handle.run_worker().await });
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        scheduler.stop();
        let _ = worker.await;

        let info = scheduler.info("expensive").unwrap();
        assert_eq!(info.status, ScheduleStatus::Failed);
        assert_eq!(info.last_error.as_deref(), Some("budget-exceeded"));
        assert_eq!(
            events
                .history(Some(EnergyEventKind::OperationDeferred))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_failure_keeps_interval_alive() {
        let (scheduler, rx) = scheduler();
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = Arc::clone(&errors);
        scheduler.set_on_error(move |result| {
            assert!(result.error.is_some());
            errors_clone.fetch_add(1, Ordering::SeqCst);
        });
        let _responder = auto_responder(rx, true);

        scheduler
            .schedule(
                "flaky",
                Bytes::new(),
                ScheduleAt::Interval(TimeDuration::from_millis(40)),
                Some("flaky".to_string()),
                HashMap::new(),
            )
            .unwrap();

        let worker_handle = scheduler.clone();
        let worker = tokio::spawn(async move { worker_handle.run_worker().await });
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        scheduler.stop();
        let _ = worker.await;

        assert!(errors.load(Ordering::SeqCst) >= 2);
        // Still pending for the next tick despite the failures.
        assert_eq!(
            scheduler.info("flaky").unwrap().status,
            ScheduleStatus::Pending
        );
    }
}
