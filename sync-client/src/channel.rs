//! RpcChannel - one multiplexed JSON-RPC connection.
//!
//! Many requests share a single transport. Requests go out in issuance order
//! and are matched to responses by id in any order; server notices are routed
//! to subscription callbacks.
//!
//! A supervisor task owns the connection lifecycle (see
//! [`walletsync_core::ChannelState`]): it connects, runs the configured
//! handshake, keeps a reader task alive while the channel is open, and
//! reconnects with backoff when the connection drops. Calls issued while the
//! channel is not open wait, in order, until it is.

use crate::config::ChannelConfig;
use crate::transport::{Transport, TransportError};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use walletsync_core::{
    Action, BackoffPolicy, ChannelState, Event, PendingError, PendingTable, Registration,
    SubscriptionRegistry,
};
use walletsync_types::{Inbound, Request, SubscribeParams, UnsubscribeParams};

/// RPC channel errors.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The connection went away before the call completed, or the channel
    /// was closed.
    #[error("channel closed: {0}")]
    Closed(String),

    /// No response within the call timeout.
    #[error("{method} timed out after {after:?}")]
    Timeout {
        /// Method that timed out.
        method: String,
        /// Timeout that elapsed.
        after: Duration,
    },

    /// The server answered with an error payload.
    #[error("remote error: {0}")]
    Remote(Value),

    /// Unsubscribe for a key that is not registered.
    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),

    /// Frame could not be built.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Too many requests in flight.
    #[error(transparent)]
    TooManyPending(#[from] PendingError),
}

/// Callback invoked with each notice payload of a subscription.
pub type NoticeCallback = Arc<dyn Fn(Value) + Send + Sync>;

type Reply = oneshot::Sender<Result<Value, RpcError>>;
type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

/// Handle to a multiplexed JSON-RPC connection.
///
/// Cheap to clone; all clones share one connection. The channel closes when
/// [`close`](Self::close) is called or the last handle is dropped.
pub struct RpcChannel<T: Transport + 'static> {
    shared: Arc<Shared<T>>,
    _owner: Arc<Owner<T>>,
}

impl<T: Transport + 'static> Clone for RpcChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _owner: self._owner.clone(),
        }
    }
}

impl<T: Transport + 'static> std::fmt::Debug for RpcChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("url", &self.shared.config.url)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

/// Closes the channel when the last handle goes away.
struct Owner<T: Transport + 'static>(Arc<Shared<T>>);

impl<T: Transport + 'static> Drop for Owner<T> {
    fn drop(&mut self) {
        // The supervisor sees Closed and shuts the transport down
        for action in self.0.apply(Event::CloseRequested) {
            if let Action::RejectPending { reason } = action {
                self.0.reject_pending(&reason);
            }
        }
    }
}

struct Shared<T> {
    transport: T,
    config: ChannelConfig,
    phase: watch::Sender<ChannelState>,
    pending: Mutex<PendingTable<Reply>>,
    subscriptions: Mutex<SubscriptionRegistry<NoticeCallback>>,
    /// Serializes request issuance; tokio's mutex is FIFO.
    send_gate: AsyncMutex<()>,
    consecutive_timeouts: AtomicU32,
    on_reconnect: Mutex<Option<ReconnectHook>>,
}

impl<T: Transport + 'static> RpcChannel<T> {
    /// Create a channel and start connecting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(transport: T, config: ChannelConfig) -> Self {
        let (phase, _) = watch::channel(ChannelState::Idle);
        let shared = Arc::new(Shared {
            transport,
            pending: Mutex::new(PendingTable::new(config.max_pending)),
            subscriptions: Mutex::new(SubscriptionRegistry::new()),
            config,
            phase,
            send_gate: AsyncMutex::new(()),
            consecutive_timeouts: AtomicU32::new(0),
            on_reconnect: Mutex::new(None),
        });

        let supervisor = Supervisor {
            backoff: shared.config.backoff(),
            shared: shared.clone(),
            reader: None,
        };
        tokio::spawn(supervisor.run());

        Self {
            _owner: Arc::new(Owner(shared.clone())),
            shared,
        }
    }

    /// Call `method` and wait for its result, using the configured timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let timeout = self.shared.config.request_timeout();
        self.call_with_timeout(method, params, timeout).await
    }

    /// Call `method` with an explicit timeout (`None` waits forever).
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let (id, reply) = {
            let _gate = self.shared.send_gate.lock().await;
            self.shared.wait_open().await?;
            self.shared.send_request(method, params).await?
        };
        self.shared.await_reply(method, id, reply, timeout).await
    }

    /// Subscribe to server notices for `key`.
    ///
    /// A key the server has already acknowledged keeps its id and callback;
    /// nothing is sent. A key that is registered but not yet acknowledged is
    /// subscribed again under its existing id, so the call only succeeds once
    /// the server accepts it. Otherwise the call goes out with params
    /// `{subscribeId, subscribeKey, params}`.
    pub async fn subscribe<F>(
        &self,
        method: &str,
        params: Value,
        key: &str,
        callback: F,
    ) -> Result<u64, RpcError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let registration = self.shared.subscriptions.lock().unwrap().register(
            key,
            method,
            params.clone(),
            Arc::new(callback) as NoticeCallback,
        );
        let id = match registration {
            Registration::Existing(id) => {
                let acknowledged = self
                    .shared
                    .subscriptions
                    .lock()
                    .unwrap()
                    .by_id(id)
                    .is_some_and(|sub| sub.acknowledged);
                if acknowledged {
                    tracing::debug!("Subscription '{}' already registered as {}", key, id);
                    return Ok(id);
                }
                tracing::debug!("Subscription '{}' ({}) not acknowledged, resending", key, id);
                id
            }
            Registration::New(id) => id,
        };

        let result = match wrap(SubscribeParams {
            subscribe_id: id,
            subscribe_key: key.to_string(),
            params,
        }) {
            Ok(wrapped) => self.call(method, wrapped).await,
            Err(e) => Err(e),
        };

        let mut subscriptions = self.shared.subscriptions.lock().unwrap();
        match result {
            Ok(_) => {
                subscriptions.acknowledge(id);
                Ok(id)
            }
            Err(e) => {
                if subscriptions.by_id(id).is_some_and(|sub| !sub.acknowledged) {
                    subscriptions.remove(id);
                }
                Err(e)
            }
        }
    }

    /// Cancel the subscription registered under `key`.
    ///
    /// The entry is dropped once the server acknowledges.
    pub async fn unsubscribe(
        &self,
        method: &str,
        params: Value,
        key: &str,
    ) -> Result<Value, RpcError> {
        let id = self
            .shared
            .subscriptions
            .lock()
            .unwrap()
            .by_key(key)
            .map(|sub| sub.id)
            .ok_or_else(|| RpcError::UnknownSubscription(key.to_string()))?;

        let wrapped = wrap(UnsubscribeParams {
            unsubscribe_id: id,
            subscribe_key: key.to_string(),
            params,
        })?;
        let result = self.call(method, wrapped).await?;
        self.shared.subscriptions.lock().unwrap().remove(id);
        Ok(result)
    }

    /// Close the channel.
    ///
    /// Live subscriptions are unsubscribed best-effort first; every request
    /// still in flight is rejected.
    pub async fn close(&self) {
        if self.is_open() {
            let live: Vec<(String, String, Value)> = self
                .shared
                .subscriptions
                .lock()
                .unwrap()
                .iter()
                .filter(|sub| sub.acknowledged)
                .map(|sub| (sub.method.clone(), sub.key.clone(), sub.params.clone()))
                .collect();
            for (method, key, params) in live {
                if let Err(e) = self.unsubscribe(&method, params, &key).await {
                    tracing::warn!("Failed to unsubscribe '{}' on close: {}", key, e);
                }
            }
        }

        {
            let subscriptions = self.shared.subscriptions.lock().unwrap();
            for sub in subscriptions.unacknowledged() {
                tracing::warn!("Subscription '{}' was never acknowledged", sub.key);
            }
            if !subscriptions.is_empty() {
                tracing::warn!(
                    "Closing with {} subscription(s) still registered",
                    subscriptions.len()
                );
            }
        }

        for action in self.shared.apply(Event::CloseRequested) {
            match action {
                Action::CloseTransport => {
                    self.shared.transport.close().await.ok();
                }
                Action::RejectPending { reason } => self.shared.reject_pending(&reason),
                _ => {}
            }
        }
        tracing::info!("Channel to {} closed", self.shared.config.url);
    }

    /// Register a hook run after every successful reconnect.
    pub fn on_reconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.on_reconnect.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.shared.phase.borrow().clone()
    }

    /// Check if calls are being released.
    pub fn is_open(&self) -> bool {
        self.shared.phase.borrow().is_open()
    }

    /// Wait until the channel is open.
    pub async fn wait_open(&self) -> Result<(), RpcError> {
        self.shared.wait_open().await
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Number of registered subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.lock().unwrap().len()
    }
}

impl<T: Transport + 'static> Shared<T> {
    /// Feed an event to the state machine.
    fn apply(&self, event: Event) -> Vec<Action> {
        let mut actions = Vec::new();
        self.phase.send_modify(|state| {
            let (next, produced) = std::mem::take(state).on_event(event);
            *state = next;
            actions = produced;
        });
        actions
    }

    fn is_closed(&self) -> bool {
        self.phase.borrow().is_closed()
    }

    async fn wait_open(&self) -> Result<(), RpcError> {
        let mut phase = self.phase.subscribe();
        let state = phase
            .wait_for(|state| state.is_open() || state.is_closed())
            .await
            .map_err(|_| RpcError::Closed("channel dropped".into()))?;
        if state.is_closed() {
            return Err(RpcError::Closed("channel closed".into()));
        }
        Ok(())
    }

    /// Record and transmit a request; the reply arrives on the receiver.
    async fn send_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(u64, oneshot::Receiver<Result<Value, RpcError>>), RpcError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.pending.lock().unwrap();
            let id = pending.allocate_id();
            pending.insert(id, method, tx)?;
            id
        };

        let request = Request {
            id,
            method: method.to_string(),
            params,
        };
        let sent = match request.to_bytes() {
            Ok(frame) => self.transport.send(&frame).await.map_err(RpcError::from),
            Err(e) => Err(RpcError::Serialization(e.to_string())),
        };
        if let Err(e) = sent {
            self.pending.lock().unwrap().complete(id);
            return Err(e);
        }

        tracing::debug!("Sent request {} ({})", id, method);
        Ok((id, rx))
    }

    async fn await_reply(
        &self,
        method: &str,
        id: u64,
        reply: oneshot::Receiver<Result<Value, RpcError>>,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let outcome = match timeout {
            Some(after) => match tokio::time::timeout(after, reply).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().unwrap().complete(id);
                    self.note_timeout().await;
                    return Err(RpcError::Timeout {
                        method: method.to_string(),
                        after,
                    });
                }
            },
            None => reply.await,
        };

        match outcome {
            Ok(result) => result,
            Err(_) => Err(RpcError::Closed("request abandoned".into())),
        }
    }

    /// Count a timeout; too many in a row means the connection is stuck.
    async fn note_timeout(&self) {
        let count = self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
        let limit = self.config.max_consecutive_timeouts;
        if limit > 0 && count >= limit {
            tracing::warn!("{} consecutive timeouts, forcing reconnect", count);
            self.consecutive_timeouts.store(0, Ordering::SeqCst);
            self.transport.close().await.ok();
        }
    }

    /// Reject every request in flight.
    fn reject_pending(&self, reason: &str) {
        let drained = self.pending.lock().unwrap().drain();
        if !drained.is_empty() {
            tracing::debug!("Rejecting {} pending request(s): {}", drained.len(), reason);
        }
        for entry in drained {
            let _ = entry.reply.send(Err(RpcError::Closed(reason.to_string())));
        }
    }

    /// Route one inbound frame.
    fn dispatch(&self, frame: &[u8]) {
        match Inbound::from_bytes(frame) {
            Ok(Inbound::Response(response)) => {
                self.consecutive_timeouts.store(0, Ordering::SeqCst);
                let entry = self.pending.lock().unwrap().complete(response.id);
                match entry {
                    Some(entry) => {
                        let _ = entry.reply.send(response.outcome.map_err(RpcError::Remote));
                    }
                    None => {
                        tracing::warn!("Dropping response for unknown request id {}", response.id)
                    }
                }
            }
            Ok(Inbound::Notice(notice)) => {
                let callback = self
                    .subscriptions
                    .lock()
                    .unwrap()
                    .by_id(notice.subscribe_id)
                    .map(|sub| sub.callback.clone());
                match callback {
                    Some(callback) => callback(notice.payload),
                    None => tracing::warn!(
                        "Dropping notice for unknown subscription {}",
                        notice.subscribe_id
                    ),
                }
            }
            Err(e) => tracing::warn!("Dropping malformed frame: {}", e),
        }
    }

    /// Call that bypasses the open gate, used during the handshake.
    async fn raw_call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let (id, reply) = self.send_request(method, params).await?;
        self.await_reply(method, id, reply, self.config.request_timeout())
            .await
    }

    /// Login call, then subscription replay when resuming.
    async fn handshake(&self, resumed: bool) -> Result<(), RpcError> {
        if let Some(method) = &self.config.handshake_method {
            self.raw_call(method, self.config.handshake_params.clone())
                .await?;
        }

        if !(resumed && self.config.replay_subscriptions) {
            return Ok(());
        }

        // Only subscriptions the previous connection acknowledged; calls
        // still queued will send their own subscribe
        let replay: Vec<(u64, String, String, Value)> = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            let live = subscriptions
                .iter()
                .filter(|sub| sub.acknowledged)
                .map(|sub| (sub.id, sub.key.clone(), sub.method.clone(), sub.params.clone()))
                .collect();
            subscriptions.reset_acknowledgements();
            live
        };

        for (id, key, method, params) in replay {
            let wrapped = wrap(SubscribeParams {
                subscribe_id: id,
                subscribe_key: key.clone(),
                params,
            })?;
            match self.raw_call(&method, wrapped).await {
                Ok(_) => {
                    self.subscriptions.lock().unwrap().acknowledge(id);
                }
                Err(RpcError::Remote(error)) => {
                    tracing::warn!(
                        "Server refused replayed subscription '{}', dropping it: {}",
                        key,
                        error
                    );
                    self.subscriptions.lock().unwrap().remove(id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn wrap<P: serde::Serialize>(params: P) -> Result<Value, RpcError> {
    serde_json::to_value(params).map_err(|e| RpcError::Serialization(e.to_string()))
}

/// Drives the connection lifecycle by executing state machine actions.
struct Supervisor<T> {
    shared: Arc<Shared<T>>,
    backoff: BackoffPolicy,
    reader: Option<JoinHandle<String>>,
}

impl<T: Transport + 'static> Supervisor<T> {
    async fn run(mut self) {
        let mut actions = self.shared.apply(Event::ConnectRequested);

        while !actions.is_empty() {
            let mut next = Vec::new();
            for action in actions {
                match action {
                    Action::Connect => next.extend(self.connect().await),
                    Action::StartHandshake { resumed } => {
                        next.extend(self.handshake(resumed).await)
                    }
                    Action::StartReconnectTimer { attempt } => {
                        next.extend(self.wait_reconnect(attempt).await)
                    }
                    Action::RejectPending { reason } => self.shared.reject_pending(&reason),
                    Action::CloseTransport => self.close_transport().await,
                    Action::CancelReconnect => {}
                }
            }
            actions = next;
        }

        // Closed (or nothing left to do): release the connection
        self.close_transport().await;
        tracing::debug!("Channel supervisor for {} stopped", self.shared.config.url);
    }

    async fn connect(&mut self) -> Vec<Action> {
        if self.shared.is_closed() {
            return vec![];
        }

        let url = &self.shared.config.url;
        match self.shared.transport.connect(url).await {
            Ok(()) => {
                tracing::info!("Connected to {}", url);
                self.reader = Some(tokio::spawn(read_loop(self.shared.clone())));
                self.shared.apply(Event::ConnectSucceeded)
            }
            Err(e) => {
                tracing::warn!("Failed to connect to {}: {}", url, e);
                self.shared.apply(Event::ConnectFailed {
                    error: e.to_string(),
                })
            }
        }
    }

    async fn handshake(&mut self, resumed: bool) -> Vec<Action> {
        match self.shared.handshake(resumed).await {
            Ok(()) => {
                let mut actions = self.shared.apply(Event::HandshakeCompleted);
                if !self.shared.phase.borrow().is_open() {
                    return actions;
                }
                self.shared.consecutive_timeouts.store(0, Ordering::SeqCst);
                if resumed {
                    tracing::info!("Reconnected to {}", self.shared.config.url);
                    let hook = self.shared.on_reconnect.lock().unwrap().clone();
                    if let Some(hook) = hook {
                        hook();
                    }
                }
                actions.extend(self.serve().await);
                actions
            }
            Err(e) => {
                tracing::warn!("Handshake with {} failed: {}", self.shared.config.url, e);
                self.shared.apply(Event::HandshakeFailed {
                    error: e.to_string(),
                })
            }
        }
    }

    /// Wait while open: until the reader stops or the owner closes.
    async fn serve(&mut self) -> Vec<Action> {
        let Some(reader) = self.reader.as_mut() else {
            return self.shared.apply(Event::Disconnected {
                reason: "reader not running".into(),
            });
        };

        let mut phase = self.shared.phase.subscribe();
        let ended = tokio::select! {
            reason = reader => Some(reason),
            _ = phase.wait_for(ChannelState::is_closed) => None,
        };

        match ended {
            Some(reason) => {
                self.reader = None;
                let reason = reason.unwrap_or_else(|e| e.to_string());
                tracing::warn!("Connection to {} lost: {}", self.shared.config.url, reason);
                self.shared.apply(Event::Disconnected { reason })
            }
            None => vec![],
        }
    }

    async fn wait_reconnect(&mut self, attempt: u32) -> Vec<Action> {
        let delay = self.backoff.delay(attempt);
        tracing::info!(
            "Reconnecting to {} in {:?} (attempt {})",
            self.shared.config.url,
            delay,
            attempt
        );

        let mut phase = self.shared.phase.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => self.shared.apply(Event::ReconnectTimer),
            _ = phase.wait_for(ChannelState::is_closed) => vec![],
        }
    }

    async fn close_transport(&mut self) {
        self.shared.transport.close().await.ok();
        if let Some(reader) = self.reader.take() {
            reader.await.ok();
        }
    }
}

/// Read frames until the connection ends; returns why it ended.
async fn read_loop<T: Transport + 'static>(shared: Arc<Shared<T>>) -> String {
    let reason = loop {
        match shared.transport.recv().await {
            Ok(frame) => shared.dispatch(&frame),
            Err(e) => break e.to_string(),
        }
    };
    shared.reject_pending(&reason);
    reason
}
