//! ConnectionManager: lifecycle of the live event channel.
//!
//! One background driver task per connection generation owns the transport
//! link. It rejoins channels, heartbeats, dispatches inbound events and
//! reconnects with backoff after an unexpected drop. Superseded drivers are
//! cancelled and can no longer change state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{ReconnectPolicy, SyncConfig};
use crate::error::SyncError;
use crate::events::{HandlerId, HandlerRegistry, Subscription};
use crate::models::{ChannelId, Credential};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::transport::{Connector, Link, TransportEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
        }
    }
}

/// Delivered to state-change handlers on every transition.
///
/// `error` is set when the transition was caused by a failure: a dropped or
/// unreachable transport (`connect_error`), a rejected credential, or
/// exhausted reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub error: Option<SyncError>,
}

pub type StateHandler = Arc<dyn Fn(&StateChange) + Send + Sync>;

type Listeners = Mutex<Vec<(HandlerId, StateHandler)>>;

enum LinkEnd {
    Cancelled,
    Dropped(SyncError),
    Fatal(SyncError),
}

struct Inner {
    state: ConnectionState,
    credential: Option<Credential>,
    /// Present only while a link is up.
    outbound: Option<mpsc::Sender<ClientEvent>>,
    /// Joined channels in join order; re-sent on every (re)connect.
    joined: Vec<ChannelId>,
    cancel: Option<CancellationToken>,
    generation: u64,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    heartbeat_interval: Duration,
    registry: Arc<HandlerRegistry>,
    inner: Mutex<Inner>,
    listeners: Arc<Listeners>,
    next_listener: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: &SyncConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            connector,
            policy: config.reconnect.clone(),
            heartbeat_interval: config.heartbeat_interval,
            registry: HandlerRegistry::new(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                credential: None,
                outbound: None,
                joined: Vec::new(),
                cancel: None,
                generation: 0,
            }),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(1),
            state_tx,
        })
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state.clone()
    }

    pub fn joined_channels(&self) -> Vec<ChannelId> {
        self.inner.lock().joined.clone()
    }

    /// Register a handler fired synchronously on every state transition.
    pub fn on_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(handler)));
        let listeners = Arc::downgrade(&self.listeners);
        Subscription::new(id, None, None, move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.lock().retain(|(lid, _)| *lid != id);
            }
        })
    }

    /// Connect with `credential`, or tear down when `None`.
    ///
    /// A no-op while already connected or connecting with the same
    /// credential. Resolves after the first attempt: `Err(Auth)` is final,
    /// `Err(Connection)` means the manager keeps retrying in the background.
    pub async fn connect(
        self: &Arc<Self>,
        credential: Option<Credential>,
    ) -> Result<(), SyncError> {
        let Some(credential) = credential else {
            info!("connect called without a credential, tearing down");
            self.disconnect();
            return Ok(());
        };

        let (generation, cancel, change) = {
            let mut inner = self.inner.lock();
            let same_credential = inner.credential.as_ref() == Some(&credential);
            if same_credential
                && matches!(
                    inner.state,
                    ConnectionState::Connected | ConnectionState::Connecting
                )
            {
                debug!(state = inner.state.name(), "already connecting or connected");
                return Ok(());
            }
            if let Some(previous) = inner.cancel.take() {
                previous.cancel();
            }
            inner.generation += 1;
            inner.credential = Some(credential.clone());
            let cancel = CancellationToken::new();
            inner.cancel = Some(cancel.clone());
            // Same critical section as the generation bump.
            let change = self.transition(&mut inner, ConnectionState::Connecting, None);
            (inner.generation, cancel, change)
        };
        if let Some(change) = change {
            self.publish(change);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.drive(generation, cancel, credential, ready_tx).await;
        });

        ready_rx.await.unwrap_or_else(|_| {
            Err(SyncError::Connection(
                "connection attempt superseded".to_string(),
            ))
        })
    }

    /// Stop the driver, close the transport and settle in `Disconnected`.
    /// Joined channels are kept so a later `connect` rejoins them.
    pub fn disconnect(&self) {
        let generation = {
            let mut inner = self.inner.lock();
            if let Some(cancel) = inner.cancel.take() {
                cancel.cancel();
            }
            inner.generation += 1;
            inner.outbound = None;
            inner.credential = None;
            inner.generation
        };
        self.set_state(Some(generation), ConnectionState::Disconnected, None);
    }

    /// Scoped teardown: release every handler and listener, forget joined
    /// channels, stop the heartbeat and close the transport.
    pub fn shutdown(&self) {
        self.registry.close();
        self.listeners.lock().clear();
        self.inner.lock().joined.clear();
        self.disconnect();
        info!("connection manager shut down");
    }

    /// Wait until `Connected`. Fails if the manager is, or settles in,
    /// `Disconnected`.
    pub async fn wait_connected(&self) -> Result<(), SyncError> {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => {
                    return Err(SyncError::Connection("not connected".to_string()));
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(SyncError::Connection("connection manager dropped".to_string()));
            }
        }
    }

    /// Hand `event` to the transport. Dropped with a warning unless connected;
    /// never queued for later.
    pub fn emit(&self, event: ClientEvent) -> bool {
        let inner = self.inner.lock();
        let outbound = match (&inner.state, &inner.outbound) {
            (ConnectionState::Connected, Some(outbound)) => outbound,
            (state, _) => {
                warn!(
                    event = event.name(),
                    state = state.name(),
                    "dropping emit while not connected"
                );
                return false;
            }
        };
        match outbound.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(event = event.name(), "outbound queue full, dropping emit");
                false
            }
            Err(TrySendError::Closed(event)) => {
                warn!(event = event.name(), "transport closed, dropping emit");
                false
            }
        }
    }

    /// Record a channel join; sent now if connected, otherwise on connect.
    pub fn join(&self, channel: ChannelId) -> bool {
        let mut inner = self.inner.lock();
        if inner.joined.contains(&channel) {
            return false;
        }
        inner.joined.push(channel.clone());
        if let (ConnectionState::Connected, Some(outbound)) = (&inner.state, &inner.outbound) {
            if let Err(e) = outbound.try_send(ClientEvent::ConversationJoin {
                channel_id: channel.clone(),
            }) {
                warn!(%channel, "join not sent, will be retried on reconnect: {}", e);
            }
        }
        debug!(%channel, "channel joined");
        true
    }

    pub fn leave(&self, channel: &ChannelId) -> bool {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.joined.iter().position(|c| c == channel) else {
            return false;
        };
        inner.joined.remove(pos);
        if let (ConnectionState::Connected, Some(outbound)) = (&inner.state, &inner.outbound) {
            if let Err(e) = outbound.try_send(ClientEvent::ConversationLeave {
                channel_id: channel.clone(),
            }) {
                warn!(%channel, "leave not sent: {}", e);
            }
        }
        debug!(%channel, "channel left");
        true
    }

    /// Transition to `to` if `generation` is still current. Handlers run
    /// after the lock is released. Returns false for a superseded generation.
    fn set_state(
        &self,
        generation: Option<u64>,
        to: ConnectionState,
        error: Option<SyncError>,
    ) -> bool {
        let change = {
            let mut inner = self.inner.lock();
            if let Some(generation) = generation {
                if inner.generation != generation {
                    return false;
                }
            }
            self.transition(&mut inner, to, error)
        };
        if let Some(change) = change {
            self.publish(change);
        }
        true
    }

    /// Apply a transition with the lock held. `None` when nothing changed.
    fn transition(
        &self,
        inner: &mut Inner,
        to: ConnectionState,
        error: Option<SyncError>,
    ) -> Option<StateChange> {
        if inner.state == to && error.is_none() {
            return None;
        }
        if !to.is_connected() {
            inner.outbound = None;
        }
        let previous = std::mem::replace(&mut inner.state, to.clone());
        self.state_tx.send_replace(to.clone());
        Some(StateChange {
            previous,
            current: to,
            error,
        })
    }

    fn publish(&self, change: StateChange) {
        let (from, to) = (change.previous.name(), change.current.name());
        match &change.error {
            Some(err) => warn!(from, to, error = %err, "connection state changed"),
            None => info!(from, to, "connection state changed"),
        }

        let handlers: Vec<StateHandler> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(&change);
        }
    }

    async fn drive(
        self: Arc<Self>,
        generation: u64,
        cancel: CancellationToken,
        credential: Credential,
        ready_tx: oneshot::Sender<Result<(), SyncError>>,
    ) {
        let mut ready = Some(ready_tx);
        let mut attempt: u32 = 0;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = self.connector.connect(&credential) => result,
            };

            let cause = match outcome {
                Ok(link) => {
                    match self
                        .run_link(generation, &cancel, link, &mut ready, &mut attempt)
                        .await
                    {
                        LinkEnd::Cancelled => return,
                        LinkEnd::Fatal(err) => {
                            if let Some(tx) = ready.take() {
                                let _ = tx.send(Err(err.clone()));
                            }
                            self.set_state(
                                Some(generation),
                                ConnectionState::Disconnected,
                                Some(err),
                            );
                            return;
                        }
                        LinkEnd::Dropped(err) => {
                            // Still pending only if the link never reached Connected.
                            if let Some(tx) = ready.take() {
                                let _ = tx.send(Err(err.clone()));
                            }
                            err
                        }
                    }
                }
                Err(err) if err.is_fatal() => {
                    warn!("credential rejected, not retrying: {}", err);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(err.clone()));
                    }
                    self.set_state(Some(generation), ConnectionState::Disconnected, Some(err));
                    return;
                }
                Err(err) => {
                    warn!(attempt, "connection attempt failed: {}", err);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(err.clone()));
                    }
                    err
                }
            };

            if attempt >= self.policy.max_attempts {
                warn!(attempts = attempt, "giving up on reconnecting");
                self.set_state(
                    Some(generation),
                    ConnectionState::Disconnected,
                    Some(SyncError::ReconnectExhausted { attempts: attempt }),
                );
                return;
            }

            attempt += 1;
            if !self.set_state(
                Some(generation),
                ConnectionState::Reconnecting { attempt },
                Some(cause),
            ) {
                return;
            }

            let delay = self.policy.delay_for(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Rejoin, go `Connected`, then pump the link until it ends. `attempt`
    /// is reset only once `Connected` is reached.
    async fn run_link(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        link: Link,
        ready: &mut Option<oneshot::Sender<Result<(), SyncError>>>,
        attempt: &mut u32,
    ) -> LinkEnd {
        let Link {
            outbound,
            mut inbound,
        } = link;

        let snapshot = {
            let inner = self.inner.lock();
            if inner.generation != generation {
                return LinkEnd::Cancelled;
            }
            inner.joined.clone()
        };

        // The queue may be smaller than the joined set, so wait for room.
        for channel in &snapshot {
            let join = ClientEvent::ConversationJoin {
                channel_id: channel.clone(),
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return LinkEnd::Cancelled,
                sent = outbound.send(join) => {
                    if let Err(e) = sent {
                        return LinkEnd::Dropped(SyncError::Connection(format!(
                            "failed to rejoin {channel}: {e}"
                        )));
                    }
                }
            }
        }
        if !snapshot.is_empty() {
            info!(count = snapshot.len(), "rejoined channels");
        }

        // Publish the sender and go Connected in one step. Joins and leaves
        // made while rejoining only touched the joined set, so reconcile them.
        let change = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return LinkEnd::Cancelled;
            }
            let left = snapshot.iter().filter(|c| !inner.joined.contains(c));
            let added = inner.joined.iter().filter(|c| !snapshot.contains(c));
            let catch_up: Vec<ClientEvent> = left
                .map(|c| ClientEvent::ConversationLeave {
                    channel_id: c.clone(),
                })
                .chain(added.map(|c| ClientEvent::ConversationJoin {
                    channel_id: c.clone(),
                }))
                .collect();
            for event in catch_up {
                if let Err(e) = outbound.try_send(event) {
                    warn!("channel change not sent, will be retried on reconnect: {}", e);
                }
            }
            inner.outbound = Some(outbound.clone());
            self.transition(&mut inner, ConnectionState::Connected, None)
        };
        if let Some(change) = change {
            self.publish(change);
        }
        *attempt = 0;
        if let Some(tx) = ready.take() {
            let _ = tx.send(Ok(()));
        }

        let period = self.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return LinkEnd::Cancelled,
                message = inbound.recv() => match message {
                    Some(TransportEvent::Event(event)) => {
                        if event.is_unauthorized() {
                            let reason = match &event {
                                ServerEvent::Error { message, .. } => message.clone(),
                                _ => "unauthorized".to_string(),
                            };
                            return LinkEnd::Fatal(SyncError::Auth(reason));
                        }
                        if cancel.is_cancelled() {
                            return LinkEnd::Cancelled;
                        }
                        self.dispatch(&event);
                    }
                    Some(TransportEvent::Closed { reason }) => {
                        return LinkEnd::Dropped(SyncError::Connection(format!("closed: {reason}")));
                    }
                    Some(TransportEvent::Error(e)) => {
                        return LinkEnd::Dropped(SyncError::Connection(e));
                    }
                    None => {
                        return LinkEnd::Dropped(SyncError::Connection(
                            "transport ended".to_string(),
                        ));
                    }
                },
                _ = heartbeat.tick() => match outbound.try_send(ClientEvent::Ping) {
                    Ok(()) => trace!("heartbeat sent"),
                    Err(TrySendError::Full(_)) => warn!("outbound queue full, heartbeat skipped"),
                    Err(TrySendError::Closed(_)) => {
                        return LinkEnd::Dropped(SyncError::Connection(
                            "heartbeat failed: transport closed".to_string(),
                        ));
                    }
                },
            }
        }
    }

    fn dispatch(&self, event: &ServerEvent) {
        if let Some(channel) = event.channel_scope() {
            if !self.inner.lock().joined.contains(channel) {
                debug!(%channel, event = %event.kind(), "dropping event for unjoined channel");
                return;
            }
        }
        if let ServerEvent::Error { message, code } = event {
            warn!(code = ?code, "server error: {}", message);
        }
        let delivered = self.registry.dispatch(event);
        trace!(event = %event.kind(), delivered, "event dispatched");
    }
}
