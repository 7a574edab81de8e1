// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use codec::{TimeDuration, Timestamp};

/// Operation categories used for cost prediction defaults.
pub mod op_type {
    pub const CALL_REDUCER: &str = "call_reducer";
    pub const QUERY: &str = "query";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const ONE_OFF_QUERY: &str = "one_off_query";
    pub const GENERIC: &str = "generic";
}

const USAGE_HISTORY_CAP: usize = 1000;
const EVENT_HISTORY_CAP: usize = 500;

/// One recorded energy-consuming operation.
#[derive(Clone, Debug)]
pub struct EnergyOperation {
    pub operation_type: String,
    pub operation_name: String,
    pub energy_cost: u64,
    pub timestamp: Timestamp,
    pub success: bool,
}

/// Kinds of energy events delivered to listeners.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EnergyEventKind {
    /// Level crossed the low-water threshold downward.
    Low,

    /// Level reached zero.
    Exhausted,

    /// Level crossed the low-water threshold upward again.
    Replenished,

    /// A reservation or consume was refused.
    OperationDeferred,

    /// A budget check refused an operation.
    BudgetExceeded,

    /// The measured efficiency score changed materially.
    EfficiencyChanged,
}

/// Event payload handed to listeners.
#[derive(Clone, Debug)]
pub struct EnergyEvent {
    pub kind: EnergyEventKind,
    pub timestamp: Timestamp,
    pub current_energy: u64,
    pub detail: String,
}

type EnergyListener = Arc<dyn Fn(&EnergyEvent) + Send + Sync>;

/// Tracks the current energy level and usage patterns.
///
/// Replenishment is applied lazily: every query first credits
/// `floor(elapsed_seconds * rate)` up to the maximum.
pub struct EnergyTracker {
    inner: Mutex<TrackerInner>,
}

struct TrackerInner {
    current: u64,
    max: u64,
    replenish_rate: u64,
    last_replenish: Timestamp,
    history: VecDeque<EnergyOperation>,
}

impl EnergyTracker {
    #[must_use]
    pub fn new(initial: u64, max: u64) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                current: initial.min(max),
                max,
                replenish_rate: 10,
                last_replenish: Timestamp::now(),
                history: VecDeque::with_capacity(64),
            }),
        }
    }

    /// Current level after lazy replenishment.
    #[must_use]
    pub fn current(&self) -> u64 {
        let mut inner = self.lock();
        Self::replenish(&mut inner);
        inner.current
    }

    #[must_use]
    pub fn max(&self) -> u64 {
        self.lock().max
    }

    #[must_use]
    pub fn replenish_rate(&self) -> u64 {
        self.lock().replenish_rate
    }

    /// Set the replenishment rate in quanta per second.
    pub fn set_replenish_rate(&self, rate: u64) {
        let mut inner = self.lock();
        Self::replenish(&mut inner);
        inner.replenish_rate = rate;
    }

    /// Consume `amount` quanta for `operation`.
    ///
    /// Returns false and records the refused operation if the level is
    /// insufficient after replenishment.
    pub fn consume(&self, amount: u64, operation: &str) -> bool {
        let mut inner = self.lock();
        Self::replenish(&mut inner);
        let ok = inner.current >= amount;
        if ok {
            inner.current -= amount;
        }
        Self::record(
            &mut inner,
            EnergyOperation {
                operation_type: op_type::GENERIC.to_string(),
                operation_name: operation.to_string(),
                energy_cost: amount,
                timestamp: Timestamp::now(),
                success: ok,
            },
        );
        ok
    }

    /// Record an operation without touching the level.
    pub fn track_operation(
        &self,
        operation_type: &str,
        operation_name: &str,
        energy_cost: u64,
        success: bool,
    ) {
        let mut inner = self.lock();
        Self::record(
            &mut inner,
            EnergyOperation {
                operation_type: operation_type.to_string(),
                operation_name: operation_name.to_string(),
                energy_cost,
                timestamp: Timestamp::now(),
                success,
            },
        );
    }

    /// Predict the cost of an operation from the history median, or the
    /// per-type default when no history exists.
    #[must_use]
    pub fn predict_cost(&self, operation_type: &str, operation_name: &str) -> u64 {
        let inner = self.lock();
        let mut costs: Vec<u64> = inner
            .history
            .iter()
            .filter(|op| {
                op.operation_type == operation_type && op.operation_name == operation_name
            })
            .map(|op| op.energy_cost)
            .collect();
        if costs.is_empty() {
            return default_cost(operation_type);
        }
        costs.sort_unstable();
        costs[costs.len() / 2]
    }

    /// Snapshot of the recorded operations, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<EnergyOperation> {
        self.lock().history.iter().cloned().collect()
    }

    fn replenish(inner: &mut TrackerInner) {
        let now = Timestamp::now();
        let elapsed = now.saturating_since(inner.last_replenish);
        let credits = (elapsed.micros() as u64 / 1_000_000) * inner.replenish_rate;
        if credits > 0 {
            inner.current = inner.max.min(inner.current.saturating_add(credits));
            inner.last_replenish = now;
        }
    }

    fn record(inner: &mut TrackerInner, op: EnergyOperation) {
        if inner.history.len() >= USAGE_HISTORY_CAP {
            inner.history.pop_front();
        }
        inner.history.push_back(op);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn default_cost(operation_type: &str) -> u64 {
    match operation_type {
        op_type::CALL_REDUCER => 50,
        op_type::QUERY => 25,
        op_type::SUBSCRIPTION => 30,
        op_type::ONE_OFF_QUERY => 20,
        _ => 10,
    }
}

/// Utilization snapshot of an [`EnergyBudget`].
#[derive(Clone, Copy, Debug)]
pub struct BudgetUtilization {
    pub budget: u64,
    pub used: u64,
    pub reserved: u64,
    pub remaining: u64,
    pub active_reservations: usize,
}

/// Enforces a per-period energy quota with reservations.
///
/// Invariant: `used + reserved <= budget`. When the period elapses, used
/// and reserved reset to zero and all reservations are dropped.
pub struct EnergyBudget {
    inner: Mutex<BudgetInner>,
}

struct BudgetInner {
    budget: u64,
    used: u64,
    reserved: u64,
    reservations: HashMap<String, u64>,
    period: TimeDuration,
    period_start: Timestamp,
}

impl EnergyBudget {
    #[must_use]
    pub fn new(budget: u64, period: TimeDuration) -> Self {
        Self {
            inner: Mutex::new(BudgetInner {
                budget,
                used: 0,
                reserved: 0,
                reservations: HashMap::new(),
                period,
                period_start: Timestamp::now(),
            }),
        }
    }

    /// Replace the quota and period, keeping current usage.
    pub fn set_budget(&self, budget: u64, period: TimeDuration) {
        let mut inner = self.lock();
        inner.budget = budget;
        inner.period = period;
    }

    /// Returns true if `estimated_cost` fits the remaining budget.
    #[must_use]
    pub fn can_execute(&self, estimated_cost: u64) -> bool {
        let mut inner = self.lock();
        Self::rollover(&mut inner);
        inner.used + inner.reserved + estimated_cost <= inner.budget
    }

    /// Reserve `amount` under `reservation_id`.
    ///
    /// Returns false if no room remains or the id is already taken.
    pub fn reserve(&self, reservation_id: &str, amount: u64) -> bool {
        let mut inner = self.lock();
        Self::rollover(&mut inner);
        if inner.reservations.contains_key(reservation_id) {
            return false;
        }
        if inner.used + inner.reserved + amount > inner.budget {
            return false;
        }
        inner
            .reservations
            .insert(reservation_id.to_string(), amount);
        inner.reserved += amount;
        true
    }

    /// Return a reservation to the free budget.
    ///
    /// Returns false if the id is unknown.
    pub fn release(&self, reservation_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.reservations.remove(reservation_id) {
            Some(amount) => {
                inner.reserved = inner.reserved.saturating_sub(amount);
                true
            }
            None => false,
        }
    }

    /// Consume `amount`, optionally against a named reservation.
    ///
    /// Consuming against a reservation releases it in full; the consumed
    /// amount may differ from the reserved one.
    pub fn consume(&self, amount: u64, reservation_id: Option<&str>) -> bool {
        let mut inner = self.lock();
        Self::rollover(&mut inner);
        if let Some(id) = reservation_id {
            if let Some(reserved) = inner.reservations.remove(id) {
                inner.reserved = inner.reserved.saturating_sub(reserved);
                inner.used += amount;
                return true;
            }
        }
        if inner.used + amount <= inner.budget - inner.reserved {
            inner.used += amount;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn utilization(&self) -> BudgetUtilization {
        let mut inner = self.lock();
        Self::rollover(&mut inner);
        BudgetUtilization {
            budget: inner.budget,
            used: inner.used,
            reserved: inner.reserved,
            remaining: inner
                .budget
                .saturating_sub(inner.used)
                .saturating_sub(inner.reserved),
            active_reservations: inner.reservations.len(),
        }
    }

    /// Drop all state for session teardown.
    pub fn clear_reservations(&self) {
        let mut inner = self.lock();
        inner.reservations.clear();
        inner.reserved = 0;
    }

    fn rollover(inner: &mut BudgetInner) {
        let now = Timestamp::now();
        if now.saturating_since(inner.period_start) >= inner.period {
            inner.used = 0;
            inner.reserved = 0;
            inner.reservations.clear();
            inner.period_start = now;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BudgetInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Dispatches energy events to registered listeners.
///
/// Delivery is best effort; listeners run on the emitting thread and a
/// bounded history of recent events is retained.
#[derive(Default)]
pub struct EnergyEventManager {
    inner: Mutex<EventInner>,
}

#[derive(Default)]
struct EventInner {
    listeners: HashMap<EnergyEventKind, Vec<EnergyListener>>,
    history: VecDeque<EnergyEvent>,
}

impl EnergyEventManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one event kind.
    pub fn register(
        &self,
        kind: EnergyEventKind,
        listener: impl Fn(&EnergyEvent) + Send + Sync + 'static,
    ) {
        let mut inner = self.lock();
        inner
            .listeners
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    /// Emit an event to every listener of its kind.
    pub fn emit(&self, event: &EnergyEvent) {
        let listeners = {
            let mut inner = self.lock();
            if inner.history.len() >= EVENT_HISTORY_CAP {
                inner.history.pop_front();
            }
            inner.history.push_back(event.clone());
            inner
                .listeners
                .get(&event.kind)
                .cloned()
                .unwrap_or_default()
        };
        // Listeners run outside the lock so they may re-enter the
        // manager.
        for listener in listeners {
            listener(event);
        }
    }

    /// Recent events, optionally filtered by kind.
    #[must_use]
    pub fn history(&self, kind: Option<EnergyEventKind>) -> Vec<EnergyEvent> {
        let inner = self.lock();
        inner
            .history
            .iter()
            .filter(|event| kind.map_or(true, |k| event.kind == k))
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EventInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
