// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};

use codec::{ConnectionId, Identity, QueryId};

use crate::client_message::{normalize_query, CallReducerFlags, ClientMessage};
use crate::compress::{compress_frame, decompress_frame, CompressionAlgorithm, CompressionMetrics};
use crate::connect_options::ConnectOptions;
use crate::diagnostics::ConnectionDiagnostics;
use crate::energy::{
    op_type, EnergyBudget, EnergyEvent, EnergyEventKind, EnergyEventManager, EnergyTracker,
};
use crate::error::{Error, ErrorKind};
use crate::scheduler::{ReducerScheduler, ScheduledInvoke, SchedulerEnergy};
use crate::server_message::{OneOffTable, ServerMessage, UpdateStatus};
use crate::status::SessionState;
use crate::stream::Stream;
use crate::subscription::{SubscriptionCallbacks, SubscriptionInfo, SubscriptionManager};

type ConnectCallback = Arc<dyn Fn(Identity, ConnectionId) + Send + Sync>;
type DisconnectCallback = Arc<dyn Fn(Option<&Error>) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;
type TransactionCallback = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// Session-level user callbacks.
///
/// Callbacks run on the session's dispatch task, after every internal
/// lock has been released. Long work inside a callback delays frame
/// dispatch for this session.
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    pub on_connect: Option<ConnectCallback>,
    pub on_disconnect: Option<DisconnectCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_transaction: Option<TransactionCallback>,
}

type PendingSlot = oneshot::Sender<Result<ServerMessage, Error>>;

struct CoreState {
    state: SessionState,
    identity: Option<Identity>,
    connection_id: Option<ConnectionId>,
    issued_token: Option<String>,
    next_request_id: u32,
    pending: HashMap<u32, PendingSlot>,
    one_off: HashMap<u128, PendingSlot>,
    outbound_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    negotiated: CompressionAlgorithm,
    reconnect_attempts: u32,
}

struct SessionCore {
    options: ConnectOptions,
    state: Mutex<CoreState>,
    state_watch: watch::Sender<SessionState>,
    callbacks: Mutex<SessionCallbacks>,
    subscriptions: SubscriptionManager,
    scheduler: ReducerScheduler,
    energy_tracker: Arc<EnergyTracker>,
    energy_budget: Arc<EnergyBudget>,
    energy_events: Arc<EnergyEventManager>,
    diagnostics: ConnectionDiagnostics,
    compression_metrics: Mutex<CompressionMetrics>,
    workers_started: AtomicBool,
    energy_low: AtomicBool,
    invoke_rx: Mutex<Option<mpsc::UnboundedReceiver<ScheduledInvoke>>>,
}

/// Fraction of the maximum level treated as the low-energy threshold.
const ENERGY_LOW_FRACTION: u64 = 5;

/// Protocol engine owning one logical connection to the server.
///
/// The session serializes outbound frames, dispatches inbound frames on
/// a single task, and correlates request ids, query ids and one-off
/// message ids with their completions. Handles are cheap to clone and
/// safe to share across tasks.
#[derive(Clone)]
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    /// Create a disconnected session from options.
    #[must_use]
    pub fn new(options: ConnectOptions) -> Self {
        let energy_tracker = Arc::new(EnergyTracker::new(1000, 1000));
        let energy_budget = Arc::new(EnergyBudget::new(
            options.energy_budget(),
            options.energy_budget_period(),
        ));
        let energy_events = Arc::new(EnergyEventManager::new());
        let (invoke_tx, invoke_rx) = mpsc::unbounded_channel();
        let scheduler = ReducerScheduler::new(
            invoke_tx,
            1,
            SchedulerEnergy {
                tracker: Some(Arc::clone(&energy_tracker)),
                budget: Some(Arc::clone(&energy_budget)),
                events: Some(Arc::clone(&energy_events)),
            },
        );
        let (state_watch, _state_rx) = watch::channel(SessionState::Disconnected);
        Self {
            core: Arc::new(SessionCore {
                options,
                state: Mutex::new(CoreState {
                    state: SessionState::Disconnected,
                    identity: None,
                    connection_id: None,
                    issued_token: None,
                    next_request_id: 1,
                    pending: HashMap::new(),
                    one_off: HashMap::new(),
                    outbound_tx: None,
                    negotiated: CompressionAlgorithm::None,
                    reconnect_attempts: 0,
                }),
                state_watch,
                callbacks: Mutex::new(SessionCallbacks::default()),
                subscriptions: SubscriptionManager::new(),
                scheduler,
                energy_tracker,
                energy_budget,
                energy_events,
                diagnostics: ConnectionDiagnostics::default(),
                compression_metrics: Mutex::new(CompressionMetrics::default()),
                workers_started: AtomicBool::new(false),
                energy_low: AtomicBool::new(false),
                invoke_rx: Mutex::new(Some(invoke_rx)),
            }),
        }
    }

    /// Install the session-level callbacks. Call before connecting.
    pub fn set_callbacks(&self, callbacks: SessionCallbacks) {
        *lock(&self.core.callbacks) = callbacks;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        lock(&self.core.state).state
    }

    /// Identity assigned by the server, once connected.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        lock(&self.core.state).identity
    }

    /// Connection id assigned by the server, once connected.
    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        lock(&self.core.state).connection_id
    }

    /// Token issued by the server during the handshake.
    #[must_use]
    pub fn issued_token(&self) -> Option<String> {
        lock(&self.core.state).issued_token.clone()
    }

    /// The scheduler owned by this session.
    #[must_use]
    pub fn scheduler(&self) -> &ReducerScheduler {
        &self.core.scheduler
    }

    /// The energy tracker owned by this session.
    #[must_use]
    pub fn energy_tracker(&self) -> &Arc<EnergyTracker> {
        &self.core.energy_tracker
    }

    /// The energy budget owned by this session.
    #[must_use]
    pub fn energy_budget(&self) -> &Arc<EnergyBudget> {
        &self.core.energy_budget
    }

    /// The energy event manager owned by this session.
    #[must_use]
    pub fn energy_events(&self) -> &Arc<EnergyEventManager> {
        &self.core.energy_events
    }

    /// Compression counters for this session.
    #[must_use]
    pub fn compression_metrics(&self) -> CompressionMetrics {
        *lock(&self.core.compression_metrics)
    }

    /// Snapshot a subscription by query id.
    #[must_use]
    pub fn subscription_info(&self, query_id: QueryId) -> Option<SubscriptionInfo> {
        self.core.subscriptions.info(query_id)
    }

    /// Connect and complete the identity handshake.
    ///
    /// Runs the optional preflight probe, dials the subscribe endpoint
    /// under the configured retry policy, then waits until the server's
    /// identity assignment frame arrives. The session is not usable for
    /// outbound calls before that frame.
    ///
    /// # Errors
    ///
    /// Returns one of the typed connection errors, refined by the
    /// diagnostics probe where possible.
    pub async fn connect(&self) -> Result<(), Error> {
        {
            let mut core = lock(&self.core.state);
            if core.state == SessionState::Closed {
                return Err(Error::terminated());
            }
            if !core.state.can_transition_to(SessionState::Connecting) {
                return Err(Error::new(
                    ErrorKind::Connection,
                    "Session is already connecting or connected",
                ));
            }
            core.state = SessionState::Connecting;
        }
        let _ = self.core.state_watch.send(SessionState::Connecting);

        if self.core.options.preflight() {
            let report = self.core.diagnostics.run_preflight(&self.core.options).await;
            if !report.server_reachable() {
                self.set_state(SessionState::Disconnected);
                return Err(Error::from_string(
                    ErrorKind::ServerNotAvailable,
                    format!("Server {} is unreachable", self.core.options.host()),
                )
                .with_hint("Is the server running? Check the host and port"));
            }
        }

        let options = self.core.options.clone();
        let policy = options.retry_policy().clone();
        let connect_result = policy
            .execute_with_retry(|| {
                let options = options.clone();
                async move { Stream::connect(&options).await }
            })
            .await;
        let stream = match connect_result {
            Ok(stream) => stream,
            Err(error) => {
                self.set_state(SessionState::Disconnected);
                let existence = self
                    .core
                    .diagnostics
                    .check_database_exists(&self.core.options)
                    .await;
                return Err(self.core.diagnostics.refine_handshake_error(
                    error,
                    existence,
                    self.core.options.database(),
                ));
            }
        };

        self.start_workers();
        self.attach_stream(stream);
        let connected = self.await_connected().await;
        if connected.is_err() {
            // Tear the half-open transport down so a later connect
            // starts clean.
            let mut core = lock(&self.core.state);
            if core.state == SessionState::Connecting {
                core.state = SessionState::Disconnected;
                core.outbound_tx = None;
            }
        }
        connected
    }

    /// Explicitly disconnect. Terminal: the session never reconnects.
    ///
    /// All pending awaits complete with a connection-terminated error,
    /// the scheduler stops, energy reservations are released and the
    /// subscription indexes are cleared.
    pub async fn disconnect(&self) {
        let pending = {
            let mut core = lock(&self.core.state);
            if core.state == SessionState::Closed {
                return;
            }
            core.state = SessionState::Closed;
            core.outbound_tx = None;
            drain_pending(&mut core)
        };
        let _ = self.core.state_watch.send(SessionState::Closed);
        fail_pending(pending);

        self.core.scheduler.stop();
        self.core.energy_budget.clear_reservations();
        self.core.subscriptions.clear();

        let callbacks = lock(&self.core.callbacks).clone();
        if let Some(on_disconnect) = &callbacks.on_disconnect {
            on_disconnect(None);
        }
        log::info!("Session closed");
    }

    /// Invoke a server-side reducer.
    ///
    /// Returns the request id; await the matching transaction update via
    /// [`Session::call_reducer_async`] instead when the result matters.
    ///
    /// # Errors
    ///
    /// Fails with not-connected before the handshake completes, or
    /// out-of-energy when the budget refuses the predicted cost.
    pub fn call_reducer(
        &self,
        reducer: &str,
        args: Bytes,
        flags: CallReducerFlags,
    ) -> Result<u32, Error> {
        let (request_id, _slot) = self.send_reducer_call(reducer, args, flags)?;
        Ok(request_id)
    }

    /// Invoke a reducer and await its transaction update.
    ///
    /// The session enforces no timeout of its own; wrap the future in
    /// `tokio::time::timeout` when one is needed.
    ///
    /// # Errors
    ///
    /// Fails like [`Session::call_reducer`], with a failed or refused
    /// transaction surfaced as a typed error.
    pub async fn call_reducer_async(
        &self,
        reducer: &str,
        args: Bytes,
        flags: CallReducerFlags,
    ) -> Result<ServerMessage, Error> {
        let (_request_id, slot) = self.send_reducer_call(reducer, args, flags)?;
        let message = slot.await.map_err(|_| Error::terminated())??;
        if let ServerMessage::TransactionUpdate {
            status: UpdateStatus::Failed(reason),
            ..
        } = &message
        {
            return Err(Error::from_string(
                ErrorKind::Connection,
                format!("Reducer '{reducer}' failed: {reason}"),
            ));
        }
        if let ServerMessage::TransactionUpdate {
            status: UpdateStatus::OutOfEnergy,
            ..
        } = &message
        {
            return Err(Error::from_string(
                ErrorKind::EnergyExhausted,
                format!("Reducer '{reducer}' was refused: out of energy"),
            ));
        }
        Ok(message)
    }

    /// Register a single-query subscription.
    ///
    /// Bare table names are rewritten to `SELECT * FROM <name>` before
    /// encoding, on both wire protocols.
    ///
    /// # Errors
    ///
    /// Fails with not-connected before the handshake completes.
    pub fn subscribe_single(
        &self,
        query: &str,
        callbacks: SubscriptionCallbacks,
    ) -> Result<QueryId, Error> {
        let query = normalize_query(query);
        let query_id = self.core.subscriptions.mint_query_id();
        self.send_with_request_id(|request_id| {
            self.core.subscriptions.register(
                query_id,
                request_id,
                vec![query.clone()],
                false,
                true,
                callbacks.clone(),
            );
            ClientMessage::SubscribeSingle {
                query: query.clone(),
                request_id,
                query_id,
            }
        })?;
        self.core
            .energy_tracker
            .track_operation(op_type::SUBSCRIPTION, &query, 0, true);
        Ok(query_id)
    }

    /// Register a multi-query subscription under one query id.
    ///
    /// # Errors
    ///
    /// Fails with not-connected before the handshake completes.
    pub fn subscribe_multi(
        &self,
        queries: &[&str],
        callbacks: SubscriptionCallbacks,
    ) -> Result<QueryId, Error> {
        let queries: Vec<String> = queries.iter().map(|query| normalize_query(query)).collect();
        let query_id = self.core.subscriptions.mint_query_id();
        self.send_with_request_id(|request_id| {
            self.core.subscriptions.register(
                query_id,
                request_id,
                queries.clone(),
                true,
                true,
                callbacks.clone(),
            );
            ClientMessage::SubscribeMulti {
                query_strings: queries.clone(),
                request_id,
                query_id,
            }
        })?;
        Ok(query_id)
    }

    /// Remove a subscription. The server acknowledgment only releases
    /// local bookkeeping; the subscription is cancelled immediately.
    ///
    /// # Errors
    ///
    /// Fails with not-connected before the handshake completes, or on an
    /// unknown query id.
    pub fn unsubscribe(&self, query_id: QueryId) -> Result<u32, Error> {
        let info = self
            .core
            .subscriptions
            .info(query_id)
            .ok_or_else(|| Error::from_string(
                ErrorKind::SubscriptionError,
                format!("Unknown subscription: {query_id}"),
            ))?;
        self.send_with_request_id(|request_id| {
            self.core.subscriptions.mark_cancelled(query_id, request_id);
            if info.multi {
                ClientMessage::UnsubscribeMulti {
                    request_id,
                    query_id,
                }
            } else {
                ClientMessage::Unsubscribe {
                    request_id,
                    query_id,
                }
            }
        })
    }

    /// Submit a one-off query and await its result rows.
    ///
    /// # Errors
    ///
    /// Fails with not-connected before the handshake completes, or with
    /// the error string the server attached to the response.
    pub async fn one_off_query(&self, query: &str) -> Result<Vec<OneOffTable>, Error> {
        let query = normalize_query(query);
        let message_id: u128 = rand::random();
        let (slot_tx, slot_rx) = oneshot::channel();
        {
            let mut core = lock(&self.core.state);
            ensure_connected(&core)?;
            core.one_off.insert(message_id, slot_tx);
            let message = ClientMessage::OneOffQuery {
                message_id: message_id.to_le_bytes(),
                query_string: query.clone(),
            };
            if let Err(error) = encode_and_send(&mut core, &self.core, &message) {
                core.one_off.remove(&message_id);
                return Err(error);
            }
        }
        self.core
            .energy_tracker
            .track_operation(op_type::ONE_OFF_QUERY, &query, 0, true);

        let message = slot_rx.await.map_err(|_| Error::terminated())??;
        let ServerMessage::OneOffQueryResponse { error, tables, .. } = message else {
            return Err(Error::new(
                ErrorKind::DecodeError,
                "Unexpected response to one-off query",
            ));
        };
        match error {
            Some(reason) => Err(Error::from_string(
                ErrorKind::Connection,
                format!("One-off query failed: {reason}"),
            )),
            None => Ok(tables),
        }
    }

    fn send_reducer_call(
        &self,
        reducer: &str,
        args: Bytes,
        flags: CallReducerFlags,
    ) -> Result<(u32, oneshot::Receiver<Result<ServerMessage, Error>>), Error> {
        ensure_connected(&lock(&self.core.state))?;
        let required = self
            .core
            .energy_tracker
            .predict_cost(op_type::CALL_REDUCER, reducer);
        if !self.core.energy_budget.consume(required, None) {
            let available = self.core.energy_budget.utilization().remaining;
            self.core.energy_events.emit(&EnergyEvent {
                kind: EnergyEventKind::BudgetExceeded,
                timestamp: codec::Timestamp::now(),
                current_energy: available,
                detail: format!("reducer '{reducer}' refused, required {required}"),
            });
            return Err(Error::out_of_energy(required, available));
        }
        self.core
            .energy_tracker
            .consume(required, reducer);
        emit_level_events(&self.core);

        let (slot_tx, slot_rx) = oneshot::channel();
        let request_id = {
            let mut core = lock(&self.core.state);
            ensure_connected(&core)?;
            let request_id = mint_request_id(&mut core);
            let message = ClientMessage::CallReducer {
                reducer: reducer.to_string(),
                args,
                request_id,
                flags,
            };
            core.pending.insert(request_id, slot_tx);
            if let Err(error) = encode_and_send(&mut core, &self.core, &message) {
                core.pending.remove(&request_id);
                return Err(error);
            }
            request_id
        };
        Ok((request_id, slot_rx))
    }

    /// Allocate a request id, encode, and hand the frame to the
    /// transport as one atomic unit.
    fn send_with_request_id(
        &self,
        build: impl Fn(u32) -> ClientMessage,
    ) -> Result<u32, Error> {
        let mut core = lock(&self.core.state);
        ensure_connected(&core)?;
        let request_id = mint_request_id(&mut core);
        let message = build(request_id);
        encode_and_send(&mut core, &self.core, &message)?;
        Ok(request_id)
    }

    fn set_state(&self, state: SessionState) {
        lock(&self.core.state).state = state;
        let _ = self.core.state_watch.send(state);
    }

    /// Spawn the scheduler worker and its reducer-invoke pump once.
    fn start_workers(&self) {
        if self.core.workers_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = self.core.scheduler.clone();
        tokio::spawn(async move { scheduler.run_worker().await });

        if let Some(mut invoke_rx) = lock(&self.core.invoke_rx).take() {
            let session = self.clone();
            tokio::spawn(async move {
                while let Some(invoke) = invoke_rx.recv().await {
                    let session = session.clone();
                    tokio::spawn(async move {
                        let result = session
                            .call_reducer_async(
                                &invoke.reducer,
                                invoke.args,
                                CallReducerFlags::FullUpdate,
                            )
                            .await
                            .map(drop);
                        let _ = invoke.responder.send(result);
                    });
                }
            });
        }
    }

    /// Install a fresh transport and spawn its event loop.
    fn attach_stream(&self, stream: Stream) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        {
            let mut core = lock(&self.core.state);
            core.outbound_tx = Some(outbound_tx);
            core.negotiated = stream.negotiated_compression();
        }
        let core = Arc::clone(&self.core);
        tokio::spawn(run_loop(core, stream, outbound_rx));
    }

    /// Wait until the identity handshake finishes or fails.
    async fn await_connected(&self) -> Result<(), Error> {
        let mut state_rx = self.core.state_watch.subscribe();
        let deadline = tokio::time::Instant::now() + self.core.options.connect_timeout();
        loop {
            match *state_rx.borrow() {
                SessionState::Connected => return Ok(()),
                SessionState::Closed => return Err(Error::terminated()),
                SessionState::Disconnected => {
                    return Err(Error::new(
                        ErrorKind::Connection,
                        "Transport dropped before the identity handshake completed",
                    ));
                }
                SessionState::Connecting | SessionState::Reconnecting => {}
            }
            match tokio::time::timeout_at(deadline, state_rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_closed)) => return Err(Error::terminated()),
                Err(_elapsed) => {
                    return Err(Error::new(
                        ErrorKind::ConnectionTimeout,
                        "Timed out waiting for the identity handshake",
                    ));
                }
            }
        }
    }
}

fn ensure_connected(core: &CoreState) -> Result<(), Error> {
    match core.state {
        SessionState::Connected => Ok(()),
        SessionState::Closed => Err(Error::terminated()),
        _ => Err(Error::not_connected()),
    }
}

fn mint_request_id(core: &mut CoreState) -> u32 {
    let request_id = core.next_request_id;
    // Request ids are strictly monotonic and never reused within a
    // session lifetime.
    core.next_request_id += 1;
    request_id
}

fn encode_and_send(
    core: &mut CoreState,
    session: &SessionCore,
    message: &ClientMessage,
) -> Result<(), Error> {
    let payload = message.encode(session.options.protocol())?;
    let frame = {
        let mut metrics = lock(&session.compression_metrics);
        compress_frame(
            core.negotiated,
            session.options.compression(),
            &payload,
            &mut metrics,
        )?
    };
    let Some(outbound_tx) = &core.outbound_tx else {
        return Err(Error::not_connected());
    };
    outbound_tx
        .send(frame)
        .map_err(|_| Error::terminated())
}

/// Emit level-crossing energy events after a consume or replenishment.
fn emit_level_events(core: &Arc<SessionCore>) {
    let current = core.energy_tracker.current();
    let threshold = core.energy_tracker.max() / ENERGY_LOW_FRACTION;
    let was_low = core.energy_low.load(Ordering::SeqCst);
    if current == 0 {
        core.energy_low.store(true, Ordering::SeqCst);
        core.energy_events.emit(&EnergyEvent {
            kind: EnergyEventKind::Exhausted,
            timestamp: codec::Timestamp::now(),
            current_energy: 0,
            detail: "energy level reached zero".to_string(),
        });
    } else if current < threshold && !was_low {
        core.energy_low.store(true, Ordering::SeqCst);
        core.energy_events.emit(&EnergyEvent {
            kind: EnergyEventKind::Low,
            timestamp: codec::Timestamp::now(),
            current_energy: current,
            detail: format!("energy level {current} below threshold {threshold}"),
        });
    } else if current >= threshold && was_low {
        core.energy_low.store(false, Ordering::SeqCst);
        core.energy_events.emit(&EnergyEvent {
            kind: EnergyEventKind::Replenished,
            timestamp: codec::Timestamp::now(),
            current_energy: current,
            detail: format!("energy level {current} recovered above {threshold}"),
        });
    }
}

fn drain_pending(core: &mut CoreState) -> Vec<PendingSlot> {
    let mut slots: Vec<PendingSlot> = core.pending.drain().map(|(_, slot)| slot).collect();
    slots.extend(core.one_off.drain().map(|(_, slot)| slot));
    slots
}

fn fail_pending(slots: Vec<PendingSlot>) {
    for slot in slots {
        let _ = slot.send(Err(Error::terminated()));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Transport event loop: one per connection, owning the stream.
///
/// Inbound dispatch is single-threaded here, which provides the
/// per-session ordering guarantee.
async fn run_loop(
    core: Arc<SessionCore>,
    mut stream: Stream,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let error = loop {
        tokio::select! {
            inbound = stream.read_frame() => match inbound {
                Ok(Some(frame)) => {
                    if let Err(err) = dispatch_frame(&core, &frame) {
                        log::error!("Fatal frame error: {err}");
                        break Some(err);
                    }
                }
                Ok(None) => break None,
                Err(err) => break Some(err),
            },
            outbound = outbound_rx.recv() => match outbound {
                Some(frame) => {
                    if let Err(err) = stream.write_frame(frame).await {
                        break Some(err);
                    }
                }
                // The session dropped the sender: explicit close.
                None => {
                    stream.close().await;
                    break None;
                }
            },
        }
    };
    handle_transport_drop(&core, error);
}

/// Decompress, decode and route one inbound frame.
///
/// Codec and decompression failures are fatal: the byte stream is
/// unusable, so the caller drops the transport.
fn dispatch_frame(core: &Arc<SessionCore>, frame: &[u8]) -> Result<(), Error> {
    let payload = {
        let mut metrics = lock(&core.compression_metrics);
        decompress_frame(frame, &mut metrics)?
    };
    let message = ServerMessage::decode(&payload, core.options.protocol())?;
    dispatch_message(core, message);
    Ok(())
}

fn dispatch_message(core: &Arc<SessionCore>, message: ServerMessage) {
    match message {
        ServerMessage::IdentityToken {
            identity,
            token,
            connection_id,
        } => handle_identity_token(core, identity, token, connection_id),
        ServerMessage::SubscribeApplied {
            query_id,
            request_id,
            ..
        }
        | ServerMessage::SubscribeMultiApplied {
            query_id,
            request_id,
            ..
        } => {
            core.subscriptions.handle_applied(query_id, request_id);
        }
        ServerMessage::UnsubscribeApplied {
            query_id,
            request_id,
            ..
        }
        | ServerMessage::UnsubscribeMultiApplied {
            query_id,
            request_id,
            ..
        } => {
            core.subscriptions
                .handle_unsubscribe_applied(query_id, request_id);
        }
        ServerMessage::SubscriptionError {
            query_id, error, ..
        } => {
            log::warn!("Subscription error: {error}");
            core.subscriptions.handle_error(query_id, &error);
        }
        ServerMessage::OneOffQueryResponse { ref message_id, .. } => {
            let key = one_off_key(message_id);
            let slot = lock(&core.state).one_off.remove(&key);
            match slot {
                Some(slot) => {
                    let _ = slot.send(Ok(message));
                }
                None => log::warn!("One-off response for unknown message id"),
            }
        }
        ServerMessage::TransactionUpdate { .. } | ServerMessage::TransactionUpdateLight { .. } => {
            handle_transaction(core, message);
        }
        ServerMessage::InitialSubscription { request_id, .. } => {
            complete_pending(core, request_id, message);
        }
    }
}

fn handle_identity_token(
    core: &Arc<SessionCore>,
    identity: Identity,
    token: String,
    connection_id: ConnectionId,
) {
    let first_handshake = {
        let mut state = lock(&core.state);
        // Identity and connection id are assigned exactly once per
        // session instance and stay stable across reconnects.
        let first = state.identity.is_none();
        if first {
            state.identity = Some(identity);
            state.connection_id = Some(connection_id);
        }
        state.issued_token = Some(token);
        state.reconnect_attempts = 0;
        state.state = SessionState::Connected;
        first
    };
    let _ = core.state_watch.send(SessionState::Connected);
    log::info!("Identity handshake complete: {identity}");

    let callbacks = lock(&core.callbacks).clone();
    if let Some(on_connect) = &callbacks.on_connect {
        on_connect(identity, connection_id);
    }

    if first_handshake {
        return;
    }
    // Replay durable subscriptions under fresh request ids but the
    // original query ids.
    for entry in core.subscriptions.replay_entries() {
        let result = {
            let mut state = lock(&core.state);
            let request_id = mint_request_id(&mut state);
            core.subscriptions.rebind_request(entry.query_id, request_id);
            let message = if entry.multi {
                ClientMessage::SubscribeMulti {
                    query_strings: entry.queries.clone(),
                    request_id,
                    query_id: entry.query_id,
                }
            } else {
                ClientMessage::SubscribeSingle {
                    query: entry.queries.first().cloned().unwrap_or_default(),
                    request_id,
                    query_id: entry.query_id,
                }
            };
            encode_and_send(&mut state, core, &message)
        };
        if let Err(err) = result {
            log::error!("Failed to replay subscription {}: {err}", entry.query_id);
        }
    }
}

fn handle_transaction(core: &Arc<SessionCore>, message: ServerMessage) {
    let (request_id, update) = match &message {
        ServerMessage::TransactionUpdate {
            reducer_call,
            status,
            ..
        } => {
            let update = match status {
                UpdateStatus::Committed(update) => Some(update.clone()),
                UpdateStatus::Failed(_) | UpdateStatus::OutOfEnergy => None,
            };
            (reducer_call.request_id, update)
        }
        ServerMessage::TransactionUpdateLight {
            request_id, update, ..
        } => (*request_id, Some(update.clone())),
        _ => return,
    };

    if let ServerMessage::TransactionUpdate {
        energy_quanta_used, ..
    } = &message
    {
        core.energy_tracker.track_operation(
            op_type::CALL_REDUCER,
            "transaction",
            energy_quanta_used.quanta(),
            true,
        );
    }

    let callbacks = lock(&core.callbacks).clone();
    if let Some(on_transaction) = &callbacks.on_transaction {
        on_transaction(&message);
    }
    if let Some(update) = update {
        core.subscriptions.route_update(&update);
    }
    complete_pending(core, request_id, message);
}

fn complete_pending(core: &Arc<SessionCore>, request_id: u32, message: ServerMessage) {
    let slot = lock(&core.state).pending.remove(&request_id);
    if let Some(slot) = slot {
        let _ = slot.send(Ok(message));
    }
}

fn one_off_key(message_id: &[u8]) -> u128 {
    let mut bytes = [0_u8; 16];
    for (slot, value) in bytes.iter_mut().zip(message_id.iter()) {
        *slot = *value;
    }
    u128::from_le_bytes(bytes)
}

/// React to the transport going away: fail pending awaits, then either
/// begin reconnecting or settle in disconnected.
fn handle_transport_drop(core: &Arc<SessionCore>, error: Option<Error>) {
    let (pending, next_state) = {
        let mut state = lock(&core.state);
        if state.state == SessionState::Closed {
            // Explicit close already ran the teardown and callbacks.
            let pending = drain_pending(&mut state);
            drop(state);
            fail_pending(pending);
            return;
        }
        let reconnect = core.options.reconnect().enabled
            && error.as_ref().map_or(true, Error::allows_reconnect)
            && state.state == SessionState::Connected;
        let next = if reconnect {
            SessionState::Reconnecting
        } else {
            SessionState::Disconnected
        };
        state.state = next;
        state.outbound_tx = None;
        (drain_pending(&mut state), next)
    };
    fail_pending(pending);

    let callbacks = lock(&core.callbacks).clone();
    if let Some(err) = &error {
        log::warn!("Transport dropped: {err}");
        if let Some(on_error) = &callbacks.on_error {
            on_error(err);
        }
    }
    if let Some(on_disconnect) = &callbacks.on_disconnect {
        on_disconnect(error.as_ref());
    }

    let _ = core.state_watch.send(next_state);
    if next_state == SessionState::Reconnecting {
        let core = Arc::clone(core);
        tokio::spawn(async move { reconnect_loop(core).await });
    }
}

/// Exponential-backoff reconnection driven by the session's internal
/// policy; the attempt counter resets on each successful handshake.
async fn reconnect_loop(core: Arc<SessionCore>) {
    let config = *core.options.reconnect();
    loop {
        let attempt = {
            let mut state = lock(&core.state);
            if state.state != SessionState::Reconnecting {
                return;
            }
            state.reconnect_attempts += 1;
            state.reconnect_attempts
        };
        if attempt > config.max_attempts {
            log::error!("Reconnect abandoned after {} attempts", attempt - 1);
            {
                let mut state = lock(&core.state);
                if state.state == SessionState::Reconnecting {
                    state.state = SessionState::Disconnected;
                }
            }
            let _ = core.state_watch.send(SessionState::Disconnected);
            return;
        }

        let delay = config.delay_for_attempt(attempt);
        log::info!("Reconnect attempt {attempt} in {delay:?}");
        tokio::time::sleep(delay).await;

        {
            let mut state = lock(&core.state);
            if state.state != SessionState::Reconnecting {
                return;
            }
            state.state = SessionState::Connecting;
        }
        let _ = core.state_watch.send(SessionState::Connecting);

        match Stream::connect(&core.options).await {
            Ok(stream) => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                {
                    let mut state = lock(&core.state);
                    state.outbound_tx = Some(outbound_tx);
                    state.negotiated = stream.negotiated_compression();
                }
                tokio::spawn(run_loop(Arc::clone(&core), stream, outbound_rx));
                return;
            }
            Err(err) => {
                log::warn!("Reconnect attempt {attempt} failed: {err}");
                if !err.allows_reconnect() {
                    let mut state = lock(&core.state);
                    state.state = SessionState::Disconnected;
                    drop(state);
                    let _ = core.state_watch.send(SessionState::Disconnected);
                    return;
                }
                let mut state = lock(&core.state);
                if state.state == SessionState::Connecting {
                    state.state = SessionState::Reconnecting;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_message::test_encode;
    use crate::server_message::{DatabaseUpdate, ReducerCallInfo, TableUpdate};
    use codec::{EnergyQuanta, TimeDuration, Timestamp};
    use std::sync::atomic::AtomicUsize;

    impl Session {
        /// Install a loopback transport: outbound frames land in the
        /// returned receiver, inbound frames are fed via
        /// [`Session::test_feed`].
        fn test_attach(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            {
                let mut core = lock(&self.core.state);
                core.state = SessionState::Connecting;
                core.outbound_tx = Some(outbound_tx);
            }
            let _ = self.core.state_watch.send(SessionState::Connecting);
            outbound_rx
        }

        fn test_feed(&self, message: &ServerMessage) {
            let payload = test_encode::encode_bsatn(message);
            let mut frame = Vec::with_capacity(payload.len() + 1);
            frame.push(0);
            frame.extend_from_slice(&payload);
            dispatch_frame(&self.core, &frame).unwrap();
        }
    }

    fn identity_token() -> ServerMessage {
        ServerMessage::IdentityToken {
            identity: Identity::new([0xab; 32]),
            token: "issued".to_string(),
            connection_id: ConnectionId::new([0xcd; 16]),
        }
    }

    fn connected_session() -> (Session, mpsc::UnboundedReceiver<Vec<u8>>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let session = Session::new(ConnectOptions::new("demo"));
        let outbound = session.test_attach();
        session.test_feed(&identity_token());
        assert_eq!(session.state(), SessionState::Connected);
        (session, outbound)
    }

    fn transaction_for(request_id: u32) -> ServerMessage {
        ServerMessage::TransactionUpdate {
            status: UpdateStatus::Committed(DatabaseUpdate::default()),
            timestamp: Timestamp::now(),
            caller_identity: Identity::new([0xab; 32]),
            caller_connection_id: ConnectionId::new([0xcd; 16]),
            reducer_call: ReducerCallInfo {
                reducer_name: "create_user".to_string(),
                reducer_id: 1,
                args: Bytes::new(),
                request_id,
            },
            energy_quanta_used: EnergyQuanta::new(5),
            total_host_execution_duration: TimeDuration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_outbound_requires_handshake() {
        let session = Session::new(ConnectOptions::new("demo"));
        let _outbound = session.test_attach();
        // Transport is open but the identity frame has not arrived.
        let err = session
            .call_reducer("create_user", Bytes::new(), CallReducerFlags::FullUpdate)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);

        session.test_feed(&identity_token());
        assert!(session
            .call_reducer("create_user", Bytes::new(), CallReducerFlags::FullUpdate)
            .is_ok());
    }

    #[tokio::test]
    async fn test_request_ids_strictly_monotonic() {
        let (session, mut outbound) = connected_session();
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(
                session
                    .call_reducer("noop", Bytes::new(), CallReducerFlags::FullUpdate)
                    .unwrap(),
            );
        }
        assert_eq!(ids, vec![1, 2, 3, 4]);
        // One frame per call reached the transport, in commit order.
        let mut frames = 0;
        while outbound.try_recv().is_ok() {
            frames += 1;
        }
        assert_eq!(frames, 4);
    }

    #[tokio::test]
    async fn test_identity_set_exactly_once() {
        let (session, _outbound) = connected_session();
        let first = session.identity().unwrap();
        let different = ServerMessage::IdentityToken {
            identity: Identity::new([0x11; 32]),
            token: "other".to_string(),
            connection_id: ConnectionId::new([0x22; 16]),
        };
        session.test_feed(&different);
        assert_eq!(session.identity().unwrap(), first);
        assert_eq!(session.connection_id().unwrap(), ConnectionId::new([0xcd; 16]));
    }

    #[tokio::test]
    async fn test_call_reducer_async_resolves_with_matching_update() {
        let (session, _outbound) = connected_session();
        let call = session.call_reducer_async(
            "create_user",
            Bytes::from_static(b"{\"name\":\"Alice\"}"),
            CallReducerFlags::FullUpdate,
        );
        let feeder = {
            let session = session.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                session.test_feed(&transaction_for(1));
            })
        };
        let message = call.await.unwrap();
        let ServerMessage::TransactionUpdate { reducer_call, .. } = message else {
            panic!("expected transaction update");
        };
        assert_eq!(reducer_call.request_id, 1);
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_transaction_surfaces_as_error() {
        let (session, _outbound) = connected_session();
        let call = session.call_reducer_async(
            "create_user",
            Bytes::new(),
            CallReducerFlags::FullUpdate,
        );
        let failed = ServerMessage::TransactionUpdate {
            status: UpdateStatus::Failed("duplicate email".to_string()),
            timestamp: Timestamp::now(),
            caller_identity: Identity::zero(),
            caller_connection_id: ConnectionId::zero(),
            reducer_call: ReducerCallInfo {
                request_id: 1,
                ..ReducerCallInfo::default()
            },
            energy_quanta_used: EnergyQuanta::zero(),
            total_host_execution_duration: TimeDuration::zero(),
        };
        let session_clone = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            session_clone.test_feed(&failed);
        });
        let err = call.await.unwrap_err();
        assert!(err.message().contains("duplicate email"));
    }

    #[tokio::test]
    async fn test_close_fails_every_pending_await_once() {
        let (session, _outbound) = connected_session();
        let call_a = session.call_reducer_async(
            "a",
            Bytes::new(),
            CallReducerFlags::FullUpdate,
        );
        let call_b = session.call_reducer_async(
            "b",
            Bytes::new(),
            CallReducerFlags::FullUpdate,
        );
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            call_a.await.unwrap_err().kind(),
            ErrorKind::ConnectionTerminated
        );
        assert_eq!(
            call_b.await.unwrap_err().kind(),
            ErrorKind::ConnectionTerminated
        );
        // Further outbound calls fail terminally.
        let err = session
            .call_reducer("c", Bytes::new(), CallReducerFlags::FullUpdate)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionTerminated);
    }

    #[tokio::test]
    async fn test_subscribe_applied_fires_once() {
        let (session, _outbound) = connected_session();
        let applied = Arc::new(AtomicUsize::new(0));
        let applied_clone = Arc::clone(&applied);
        let query_id = session
            .subscribe_single(
                "SELECT * FROM users",
                SubscriptionCallbacks::new().with_on_applied(move |_| {
                    applied_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        session.test_feed(&ServerMessage::SubscribeApplied {
            request_id: 1,
            total_host_execution_duration_micros: 100,
            query_id,
            table_id: 7,
            table_name: "users".to_string(),
            table_rows: TableUpdate::default(),
        });
        assert_eq!(applied.load(Ordering::SeqCst), 1);
        let info = session.subscription_info(query_id).unwrap();
        assert_eq!(
            info.status,
            crate::subscription::SubscriptionStatus::Applied
        );
    }

    #[tokio::test]
    async fn test_bare_table_name_rewritten() {
        let (session, mut outbound) = connected_session();
        session
            .subscribe_single("users", SubscriptionCallbacks::new())
            .unwrap();
        let frame = outbound.try_recv().unwrap();
        // Envelope tag byte, then the BSATN payload with the rewritten
        // SQL embedded.
        let payload = &frame[1..];
        let needle = b"SELECT * FROM users";
        assert!(payload
            .windows(needle.len())
            .any(|window| window == needle));
    }

    #[tokio::test]
    async fn test_transaction_update_routed_to_subscriptions() {
        let (session, _outbound) = connected_session();
        let updates = Arc::new(AtomicUsize::new(0));
        let updates_clone = Arc::clone(&updates);
        let query_id = session
            .subscribe_single(
                "users",
                SubscriptionCallbacks::new().with_on_update(move |_, _| {
                    updates_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        session.test_feed(&ServerMessage::SubscribeApplied {
            request_id: 1,
            total_host_execution_duration_micros: 0,
            query_id,
            table_id: 7,
            table_name: "users".to_string(),
            table_rows: TableUpdate::default(),
        });

        let mut transaction = transaction_for(99);
        if let ServerMessage::TransactionUpdate { status, .. } = &mut transaction {
            *status = UpdateStatus::Committed(DatabaseUpdate {
                tables: vec![TableUpdate {
                    table_id: 7,
                    table_name: "users".to_string(),
                    num_rows: 1,
                    inserts: vec![Bytes::from_static(b"row")],
                    deletes: vec![],
                }],
            });
        }
        session.test_feed(&transaction);
        assert_eq!(updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_one_off_query_completes() {
        let (session, mut outbound) = connected_session();
        let query = session.one_off_query("users");
        tokio::pin!(query);

        // Nudge the future so the frame is on the wire.
        tokio::select! {
            _ = &mut query => panic!("must not resolve yet"),
            () = tokio::time::sleep(std::time::Duration::from_millis(5)) => {}
        }
        let frame = outbound.try_recv().unwrap();
        let payload = decompress_frame(&frame, &mut CompressionMetrics::default()).unwrap();
        // Extract the generated message id from the outbound frame.
        let mut reader = codec::Reader::new(&payload);
        let _variant = reader.read_sum_header().unwrap();
        let field_count = reader.read_product_header().unwrap();
        let mut message_id = Vec::new();
        for _ in 0..field_count {
            match reader.read_field_name().unwrap().as_str() {
                "message_id" => message_id = reader.read_byte_slice().unwrap().to_vec(),
                _ => reader.skip_value().unwrap(),
            }
        }
        assert_eq!(message_id.len(), 16);

        session.test_feed(&ServerMessage::OneOffQueryResponse {
            message_id: Bytes::from(message_id),
            error: None,
            tables: vec![OneOffTable {
                table_name: "users".to_string(),
                rows: vec![Bytes::from_static(b"row")],
            }],
            total_host_execution_duration: TimeDuration::from_micros(30),
        });
        let tables = query.await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].table_name, "users");
    }

    #[tokio::test]
    async fn test_subscription_error_broadcast() {
        let (session, _outbound) = connected_session();
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = Arc::clone(&errors);
        session
            .subscribe_single(
                "users",
                SubscriptionCallbacks::new().with_on_error(move |_, _| {
                    errors_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        session.test_feed(&ServerMessage::SubscriptionError {
            total_host_execution_duration_micros: 0,
            request_id: None,
            query_id: None,
            table_id: None,
            error: "backend restarting".to_string(),
        });
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compressed_inbound_frame() {
        let (session, _outbound) = connected_session();
        let call = session.call_reducer_async(
            "create_user",
            Bytes::new(),
            CallReducerFlags::FullUpdate,
        );

        // Compress the server frame above the threshold with gzip.
        let mut transaction = transaction_for(1);
        if let ServerMessage::TransactionUpdate { status, .. } = &mut transaction {
            *status = UpdateStatus::Committed(DatabaseUpdate {
                tables: vec![TableUpdate {
                    table_id: 1,
                    table_name: "users".to_string(),
                    num_rows: 64,
                    inserts: (0..64)
                        .map(|i| Bytes::from(vec![i as u8; 64]))
                        .collect(),
                    deletes: vec![],
                }],
            });
        }
        let payload = test_encode::encode_bsatn(&transaction);
        assert!(payload.len() > 1024);
        let frame = compress_frame(
            CompressionAlgorithm::Gzip,
            session.core.options.compression(),
            &payload,
            &mut lock(&session.core.compression_metrics),
        )
        .unwrap();
        assert_eq!(frame[0], 2);

        let session_clone = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            dispatch_frame(&session_clone.core, &frame).unwrap();
        });
        let message = call.await.unwrap();
        assert!(matches!(message, ServerMessage::TransactionUpdate { .. }));
        assert!(session.compression_metrics().messages_decompressed >= 1);
    }

    #[tokio::test]
    async fn test_out_of_energy_refuses_call() {
        let mut options = ConnectOptions::new("demo");
        options.set_energy_budget(10, TimeDuration::from_secs(3600));
        let session = Session::new(options);
        let _outbound = session.test_attach();
        session.test_feed(&identity_token());

        // Default predicted cost for a fresh reducer is 50, above the
        // 10-quanta budget.
        let err = session
            .call_reducer("expensive", Bytes::new(), CallReducerFlags::FullUpdate)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfEnergy);
        assert_eq!(
            session
                .energy_events()
                .history(Some(EnergyEventKind::BudgetExceeded))
                .len(),
            1
        );
    }
}
