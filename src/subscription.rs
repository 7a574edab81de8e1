// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use codec::{QueryId, Timestamp};

use crate::server_message::{DatabaseUpdate, TableUpdate};

/// Lifecycle state of a subscription.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscriptionStatus {
    /// Sent, awaiting the server's apply acknowledgment.
    Pending,

    /// Live; updates flow to the callbacks.
    Applied,

    /// The server reported an error for this subscription.
    Errored,

    /// Locally unsubscribed.
    Cancelled,
}

type AppliedCallback = Arc<dyn Fn(QueryId) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(QueryId, &str) + Send + Sync>;
type UpdateCallback = Arc<dyn Fn(QueryId, &TableUpdate) + Send + Sync>;
type EndCallback = Arc<dyn Fn(QueryId) + Send + Sync>;

/// Optional user callbacks attached to one subscription.
#[derive(Clone, Default)]
pub struct SubscriptionCallbacks {
    pub on_applied: Option<AppliedCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_update: Option<UpdateCallback>,
    pub on_end: Option<EndCallback>,
}

impl SubscriptionCallbacks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_on_applied(mut self, f: impl Fn(QueryId) + Send + Sync + 'static) -> Self {
        self.on_applied = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_on_error(mut self, f: impl Fn(QueryId, &str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_on_update(
        mut self,
        f: impl Fn(QueryId, &TableUpdate) + Send + Sync + 'static,
    ) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_on_end(mut self, f: impl Fn(QueryId) + Send + Sync + 'static) -> Self {
        self.on_end = Some(Arc::new(f));
        self
    }
}

/// Read-only snapshot of one subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionInfo {
    pub query_id: QueryId,
    pub queries: Vec<String>,
    pub multi: bool,
    pub status: SubscriptionStatus,
    pub durable: bool,
    pub created_at: Timestamp,
    pub applied_at: Option<Timestamp>,
}

struct SubscriptionRecord {
    query_id: QueryId,
    queries: Vec<String>,
    multi: bool,
    status: SubscriptionStatus,
    durable: bool,
    created_at: Timestamp,
    applied_at: Option<Timestamp>,

    /// Updates that arrived before the apply acknowledgment, replayed in
    /// arrival order once Applied.
    buffered: Vec<TableUpdate>,

    callbacks: SubscriptionCallbacks,
}

/// A subscription to replay after reconnect, under a fresh request id but
/// the original query id.
#[derive(Clone, Debug)]
pub struct ReplayEntry {
    pub query_id: QueryId,
    pub queries: Vec<String>,
    pub multi: bool,
}

/// Owns every subscription of one session.
///
/// Mints query ids (monotonic, never reused), indexes records by query id
/// and by the request id awaiting acknowledgment, buffers pre-apply
/// updates, and replays durable subscriptions after a reconnect.
///
/// User callbacks are never invoked while the internal lock is held.
#[derive(Default)]
pub struct SubscriptionManager {
    inner: Mutex<ManagerInner>,
}

#[derive(Default)]
struct ManagerInner {
    next_query_id: u32,
    by_query_id: HashMap<u32, SubscriptionRecord>,
    by_request_id: HashMap<u32, u32>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the next query id.
    #[must_use]
    pub fn mint_query_id(&self) -> QueryId {
        let mut inner = self.lock();
        inner.next_query_id += 1;
        QueryId::new(inner.next_query_id)
    }

    /// Record a new pending subscription under `query_id`.
    pub fn register(
        &self,
        query_id: QueryId,
        request_id: u32,
        queries: Vec<String>,
        multi: bool,
        durable: bool,
        callbacks: SubscriptionCallbacks,
    ) {
        let mut inner = self.lock();
        inner.by_request_id.insert(request_id, query_id.id());
        inner.by_query_id.insert(
            query_id.id(),
            SubscriptionRecord {
                query_id,
                queries,
                multi,
                status: SubscriptionStatus::Pending,
                durable,
                created_at: Timestamp::now(),
                applied_at: None,
                buffered: Vec::new(),
                callbacks,
            },
        );
    }

    /// Handle an apply acknowledgment for `query_id`.
    ///
    /// Fires the applied callback at most once and then replays any
    /// buffered updates in arrival order.
    pub fn handle_applied(&self, query_id: QueryId, request_id: u32) {
        let (callbacks, buffered) = {
            let mut inner = self.lock();
            inner.by_request_id.remove(&request_id);
            let Some(record) = inner.by_query_id.get_mut(&query_id.id()) else {
                log::warn!("Apply ack for unknown subscription: {query_id}");
                return;
            };
            if record.status != SubscriptionStatus::Pending {
                // A late or duplicate ack must not re-fire callbacks.
                return;
            }
            record.status = SubscriptionStatus::Applied;
            record.applied_at = Some(Timestamp::now());
            (record.callbacks.clone(), std::mem::take(&mut record.buffered))
        };
        if let Some(on_applied) = &callbacks.on_applied {
            on_applied(query_id);
        }
        if let Some(on_update) = &callbacks.on_update {
            for update in &buffered {
                on_update(query_id, update);
            }
        }
    }

    /// Handle a subscription error.
    ///
    /// Without a query id the error broadcasts to every pending
    /// subscription.
    pub fn handle_error(&self, query_id: Option<u32>, error: &str) {
        let targets: Vec<(QueryId, SubscriptionCallbacks)> = {
            let mut inner = self.lock();
            let ids: Vec<u32> = match query_id {
                Some(id) => vec![id],
                None => inner
                    .by_query_id
                    .values()
                    .filter(|record| record.status == SubscriptionStatus::Pending)
                    .map(|record| record.query_id.id())
                    .collect(),
            };
            ids.iter()
                .filter_map(|id| {
                    inner.by_query_id.get_mut(id).and_then(|record| {
                        if matches!(
                            record.status,
                            SubscriptionStatus::Errored | SubscriptionStatus::Cancelled
                        ) {
                            None
                        } else {
                            record.status = SubscriptionStatus::Errored;
                            Some((record.query_id, record.callbacks.clone()))
                        }
                    })
                })
                .collect()
        };
        for (query_id, callbacks) in targets {
            if let Some(on_error) = &callbacks.on_error {
                on_error(query_id, error);
            }
        }
    }

    /// Mark a subscription cancelled before the unsubscribe frame goes
    /// out. Cancellation is idempotent.
    pub fn mark_cancelled(&self, query_id: QueryId, request_id: u32) {
        let mut inner = self.lock();
        inner.by_request_id.insert(request_id, query_id.id());
        if let Some(record) = inner.by_query_id.get_mut(&query_id.id()) {
            record.status = SubscriptionStatus::Cancelled;
        }
    }

    /// Release bookkeeping after the server acknowledged an
    /// unsubscribe; fires the terminal end callback.
    pub fn handle_unsubscribe_applied(&self, query_id: QueryId, request_id: u32) {
        let callbacks = {
            let mut inner = self.lock();
            inner.by_request_id.remove(&request_id);
            inner
                .by_query_id
                .remove(&query_id.id())
                .map(|record| record.callbacks)
        };
        if let Some(callbacks) = callbacks {
            if let Some(on_end) = &callbacks.on_end {
                on_end(query_id);
            }
        }
    }

    /// Route a transaction's table updates to the subscriptions whose
    /// queries reference each table.
    ///
    /// Updates for pending subscriptions are buffered and replayed once
    /// the apply acknowledgment arrives.
    pub fn route_update(&self, update: &DatabaseUpdate) {
        for table in &update.tables {
            let listeners: Vec<(QueryId, SubscriptionCallbacks)> = {
                let mut inner = self.lock();
                let mut live = Vec::new();
                for record in inner.by_query_id.values_mut() {
                    let references = record
                        .queries
                        .iter()
                        .any(|query| query_references_table(query, &table.table_name));
                    if !references {
                        continue;
                    }
                    match record.status {
                        SubscriptionStatus::Applied => {
                            live.push((record.query_id, record.callbacks.clone()));
                        }
                        SubscriptionStatus::Pending => {
                            record.buffered.push(table.clone());
                        }
                        SubscriptionStatus::Errored | SubscriptionStatus::Cancelled => {}
                    }
                }
                live
            };
            for (query_id, callbacks) in listeners {
                if let Some(on_update) = &callbacks.on_update {
                    on_update(query_id, table);
                }
            }
        }
    }

    /// Reset durable subscriptions to pending and return what to
    /// re-send. Errored and cancelled subscriptions stay dead.
    #[must_use]
    pub fn replay_entries(&self) -> Vec<ReplayEntry> {
        let mut inner = self.lock();
        inner.by_request_id.clear();
        let mut entries: Vec<ReplayEntry> = inner
            .by_query_id
            .values_mut()
            .filter(|record| {
                record.durable
                    && matches!(
                        record.status,
                        SubscriptionStatus::Applied | SubscriptionStatus::Pending
                    )
            })
            .map(|record| {
                record.status = SubscriptionStatus::Pending;
                record.applied_at = None;
                ReplayEntry {
                    query_id: record.query_id,
                    queries: record.queries.clone(),
                    multi: record.multi,
                }
            })
            .collect();
        entries.sort_by_key(|entry| entry.query_id.id());
        entries
    }

    /// Bind a replayed subscription to its fresh request id.
    pub fn rebind_request(&self, query_id: QueryId, request_id: u32) {
        let mut inner = self.lock();
        inner.by_request_id.insert(request_id, query_id.id());
    }

    /// Snapshot one subscription.
    #[must_use]
    pub fn info(&self, query_id: QueryId) -> Option<SubscriptionInfo> {
        let inner = self.lock();
        inner.by_query_id.get(&query_id.id()).map(|record| SubscriptionInfo {
            query_id: record.query_id,
            queries: record.queries.clone(),
            multi: record.multi,
            status: record.status,
            durable: record.durable,
            created_at: record.created_at,
            applied_at: record.applied_at,
        })
    }

    /// Query id owning `request_id`, if any.
    #[must_use]
    pub fn query_for_request(&self, request_id: u32) -> Option<QueryId> {
        let inner = self.lock();
        inner.by_request_id.get(&request_id).map(|id| QueryId::new(*id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().by_query_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().by_query_id.is_empty()
    }

    /// Drop all records on session close, firing terminal end
    /// callbacks for subscriptions that were still alive.
    pub fn clear(&self) {
        let ended: Vec<(QueryId, SubscriptionCallbacks)> = {
            let mut inner = self.lock();
            inner.by_request_id.clear();
            inner
                .by_query_id
                .drain()
                .filter(|(_, record)| {
                    matches!(
                        record.status,
                        SubscriptionStatus::Applied | SubscriptionStatus::Pending
                    )
                })
                .map(|(_, record)| (record.query_id, record.callbacks))
                .collect()
        };
        for (query_id, callbacks) in ended {
            if let Some(on_end) = &callbacks.on_end {
                on_end(query_id);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Returns true if `query` reads from `table_name`.
///
/// Works on the SQL text level: the table name must appear as a bare
/// word, which covers FROM and JOIN clauses alike.
fn query_references_table(query: &str, table_name: &str) -> bool {
    if table_name.is_empty() {
        return false;
    }
    let lowered_table = table_name.to_lowercase();
    query
        .to_lowercase()
        .split(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
        .any(|word| word == lowered_table)
}
