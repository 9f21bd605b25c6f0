use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use shared::{
    domain::{ConnectionState, UserId},
    error::{ErrorKind, RealtimeError},
    protocol::{
        decode_frame, encode_frame, EventKind, Handshake, InboundEvent, OutboundEvent, ServerFrame,
    },
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::{interval, sleep, timeout, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    retry::RetryPolicy,
    transport::{ChannelTransport, TransportLink},
};

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_threshold: u32,
    pub reconnect: RetryPolicy,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(20),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_miss_threshold: 3,
            reconnect: RetryPolicy::default(),
        }
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Connected,
    Reconnecting { attempt: u32 },
    ConnectionRestored,
    ConnectionDegraded { missed: u32 },
    AuthRejected { message: String },
    Disconnected { reason: String },
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("backend rejected credentials: {0}")]
    AuthRejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("channel is not connected")]
    NotConnected,
    #[error("no acknowledgement for '{event}' within {timeout:?}")]
    AckTimeout {
        event: &'static str,
        timeout: Duration,
    },
    #[error("failed to encode '{event}': {reason}")]
    Encode { event: &'static str, reason: String },
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthRejected(_) => ErrorKind::AuthRejected,
            Self::Transport(_) | Self::NotConnected | Self::AckTimeout { .. } => {
                ErrorKind::Transport
            }
            Self::Encode { .. } => ErrorKind::InvalidState,
        }
    }
}

impl From<&ChannelError> for RealtimeError {
    fn from(value: &ChannelError) -> Self {
        RealtimeError::new(value.kind(), value.to_string())
    }
}

/// Read-only view of the session owned by the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub user_id: UserId,
    pub connection: ConnectionState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub missed_heartbeats: u32,
}

struct Registration {
    scope_id: u64,
    sender: mpsc::UnboundedSender<InboundEvent>,
}

#[derive(Default)]
struct Registry {
    by_kind: HashMap<EventKind, Vec<Registration>>,
}

impl Registry {
    fn remove_scope(&mut self, scope_id: u64) {
        for registrations in self.by_kind.values_mut() {
            registrations.retain(|r| r.scope_id != scope_id);
        }
        self.by_kind.retain(|_, registrations| !registrations.is_empty());
    }
}

struct ChannelState {
    connection: ConnectionState,
    token: Option<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    pending_acks: HashMap<u64, oneshot::Sender<Value>>,
    /// Bumped whenever the current link is abandoned; stale tasks compare
    /// against it before touching state.
    generation: u64,
    last_heartbeat: Option<DateTime<Utc>>,
    missed_heartbeats: u32,
    degraded: bool,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl ChannelState {
    fn drop_link(&mut self) {
        self.generation += 1;
        self.outbound = None;
        // Dropping the senders fails every waiter.
        self.pending_acks.clear();
        self.missed_heartbeats = 0;
        self.degraded = false;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The single persistent connection of one authenticated session.
pub struct EventChannel {
    session_id: Uuid,
    user_id: UserId,
    settings: ChannelSettings,
    transport: Arc<dyn ChannelTransport>,
    state: Mutex<ChannelState>,
    registry: Arc<Mutex<Registry>>,
    signals: broadcast::Sender<ChannelSignal>,
    next_ack: AtomicU64,
    next_scope: AtomicU64,
}

impl EventChannel {
    pub fn new(
        user_id: UserId,
        settings: ChannelSettings,
        transport: Arc<dyn ChannelTransport>,
    ) -> Arc<Self> {
        let (signals, _) = broadcast::channel(64);
        Arc::new(Self {
            session_id: Uuid::new_v4(),
            user_id,
            settings,
            transport,
            state: Mutex::new(ChannelState {
                connection: ConnectionState::Disconnected,
                token: None,
                outbound: None,
                pending_acks: HashMap::new(),
                generation: 0,
                last_heartbeat: None,
                missed_heartbeats: 0,
                degraded: false,
                reader: None,
                heartbeat: None,
            }),
            registry: Arc::new(Mutex::new(Registry::default())),
            signals,
            next_ack: AtomicU64::new(0),
            next_scope: AtomicU64::new(0),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn signals(&self) -> broadcast::Receiver<ChannelSignal> {
        self.signals.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.state).connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn session(&self) -> SessionSnapshot {
        let state = lock(&self.state);
        SessionSnapshot {
            session_id: self.session_id,
            user_id: self.user_id.clone(),
            connection: state.connection,
            last_heartbeat: state.last_heartbeat,
            missed_heartbeats: state.missed_heartbeats,
        }
    }

    /// Open the connection and complete the auth handshake.
    ///
    /// A no-op while already connecting or connected.
    pub async fn connect(self: &Arc<Self>, token: &str) -> Result<(), ChannelError> {
        let generation = {
            let mut state = lock(&self.state);
            if state.connection != ConnectionState::Disconnected {
                debug!(
                    session_id = %self.session_id,
                    state = ?state.connection,
                    "channel: connect ignored"
                );
                return Ok(());
            }
            state.connection = ConnectionState::Connecting;
            state.token = Some(token.to_owned());
            state.generation
        };

        match self.establish(token, generation).await {
            Ok(()) => {
                self.emit_signal(ChannelSignal::Connected);
                Ok(())
            }
            Err(ChannelError::AuthRejected(message)) => {
                self.reject_auth(message.clone());
                Err(ChannelError::AuthRejected(message))
            }
            Err(err) => {
                let mut state = lock(&self.state);
                if state.generation == generation {
                    state.connection = ConnectionState::Disconnected;
                }
                drop(state);
                warn!(session_id = %self.session_id, error = %err, "channel: connect failed");
                Err(err)
            }
        }
    }

    // Boxed: the reader spawned here can loop back into `establish` on
    // reconnect, and a named `Send` future breaks that type cycle.
    fn establish<'a>(
        self: &'a Arc<Self>,
        token: &'a str,
        generation: u64,
    ) -> BoxFuture<'a, Result<(), ChannelError>> {
        self.open_link(token, generation).boxed()
    }

    async fn open_link(self: &Arc<Self>, token: &str, generation: u64) -> Result<(), ChannelError> {
        let TransportLink {
            outbound,
            mut inbound,
        } = self
            .transport
            .open(&self.user_id, token)
            .await
            .map_err(|err| ChannelError::Transport(format!("{err:#}")))?;

        timeout(
            self.settings.handshake_timeout,
            await_handshake(&mut inbound),
        )
        .await
        .map_err(|_| {
            ChannelError::Transport(format!(
                "no handshake within {:?}",
                self.settings.handshake_timeout
            ))
        })??;

        let join = encode_frame(&OutboundEvent::Join(self.user_id.clone()), None).map_err(
            |err| ChannelError::Encode {
                event: "join",
                reason: err.to_string(),
            },
        )?;

        let mut state = lock(&self.state);
        if state.generation != generation || state.connection != ConnectionState::Connecting {
            return Err(ChannelError::Transport(
                "channel closed while connecting".into(),
            ));
        }
        state.connection = ConnectionState::Connected;
        state.missed_heartbeats = 0;
        state.degraded = false;
        let _ = outbound.send(join);
        state.outbound = Some(outbound);
        state.reader = Some(tokio::spawn(run_reader(
            Arc::downgrade(self),
            inbound,
            generation,
        )));
        state.heartbeat = Some(tokio::spawn(run_heartbeat(
            Arc::downgrade(self),
            generation,
            self.settings.heartbeat_interval,
        )));
        drop(state);

        info!(
            session_id = %self.session_id,
            user_id = %self.user_id,
            "channel: connected"
        );
        Ok(())
    }

    /// Fire-and-forget emission. Nothing is queued while disconnected.
    pub fn emit(&self, event: OutboundEvent) -> Result<(), ChannelError> {
        let name = event.name();
        let frame = encode_frame(&event, None).map_err(|err| ChannelError::Encode {
            event: name,
            reason: err.to_string(),
        })?;
        let state = lock(&self.state);
        match (&state.connection, &state.outbound) {
            (ConnectionState::Connected, Some(outbound)) => outbound
                .send(frame)
                .map_err(|_| ChannelError::NotConnected),
            _ => Err(ChannelError::NotConnected),
        }
    }

    /// Emit and wait for the server's acknowledgement payload.
    pub async fn emit_with_ack(
        &self,
        event: OutboundEvent,
        wait: Duration,
    ) -> Result<Value, ChannelError> {
        let name = event.name();
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = encode_frame(&event, Some(id)).map_err(|err| ChannelError::Encode {
            event: name,
            reason: err.to_string(),
        })?;

        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut state = lock(&self.state);
            let outbound = match (&state.connection, &state.outbound) {
                (ConnectionState::Connected, Some(outbound)) => outbound.clone(),
                _ => return Err(ChannelError::NotConnected),
            };
            state.pending_acks.insert(id, ack_tx);
            if outbound.send(frame).is_err() {
                state.pending_acks.remove(&id);
                return Err(ChannelError::NotConnected);
            }
        }

        match timeout(wait, ack_rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(ChannelError::Transport(format!(
                "connection lost before '{name}' was acknowledged"
            ))),
            Err(_) => {
                lock(&self.state).pending_acks.remove(&id);
                Err(ChannelError::AckTimeout {
                    event: name,
                    timeout: wait,
                })
            }
        }
    }

    pub fn scope(&self, name: &'static str) -> SubscriberScope {
        let (sender, receiver) = mpsc::unbounded_channel();
        SubscriberScope {
            id: self.next_scope.fetch_add(1, Ordering::Relaxed) + 1,
            name,
            registry: Arc::clone(&self.registry),
            sender,
            receiver,
            kinds: HashSet::new(),
        }
    }

    /// Tear the connection down locally. Pending acks fail and no reconnection
    /// is attempted.
    pub fn close(&self) {
        let (previous, reader) = {
            let mut state = lock(&self.state);
            if let (ConnectionState::Connected, Some(outbound)) =
                (&state.connection, &state.outbound)
            {
                if let Ok(frame) = encode_frame(&OutboundEvent::ManualDisconnect, None) {
                    let _ = outbound.send(frame);
                }
            }
            let previous = state.connection;
            state.drop_link();
            state.connection = ConnectionState::Disconnected;
            state.token = None;
            (previous, state.reader.take())
        };
        if let Some(reader) = reader {
            reader.abort();
        }
        if previous != ConnectionState::Disconnected {
            info!(session_id = %self.session_id, "channel: closed");
            self.emit_signal(ChannelSignal::Closed);
        }
    }

    fn emit_signal(&self, signal: ChannelSignal) {
        let _ = self.signals.send(signal);
    }

    fn reject_auth(&self, message: String) {
        {
            let mut state = lock(&self.state);
            state.drop_link();
            state.connection = ConnectionState::Disconnected;
            state.token = None;
        }
        error!(
            session_id = %self.session_id,
            user_id = %self.user_id,
            %message,
            "channel: credentials rejected"
        );
        self.emit_signal(ChannelSignal::AuthRejected { message });
    }

    fn handle_frame(&self, text: &str) {
        match decode_frame(text) {
            Ok(ServerFrame::Ack { id, payload }) => {
                match lock(&self.state).pending_acks.remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(payload);
                    }
                    None => debug!(ack = id, "channel: ack for unknown or expired request"),
                }
            }
            Ok(ServerFrame::Event(event)) => self.deliver(event),
            Ok(ServerFrame::Handshake(handshake)) => {
                debug!(?handshake, "channel: ignoring handshake frame on open link");
            }
            Err(err) => warn!(error = %err, "channel: dropping undecodable frame"),
        }
    }

    fn deliver(&self, event: InboundEvent) {
        if let InboundEvent::Malformed { kind, error } = &event {
            warn!(event = kind.as_str(), error = %error, "channel: dropping malformed event");
            return;
        }
        let Some(kind) = event.kind() else {
            if let InboundEvent::Unknown { event } = &event {
                debug!(%event, "channel: dropping unknown event");
            }
            return;
        };

        let mut registry = lock(&self.registry);
        match registry.by_kind.get_mut(&kind) {
            Some(registrations) => {
                registrations.retain(|r| r.sender.send(event.clone()).is_ok());
            }
            None => debug!(event = kind.as_str(), "channel: no subscriber"),
        }
    }

    /// Transport ended underneath us; reconnect unless closed meanwhile.
    async fn on_link_lost(self: &Arc<Self>, generation: u64) {
        let (token, generation) = {
            let mut state = lock(&self.state);
            if state.generation != generation || state.connection != ConnectionState::Connected {
                return;
            }
            state.drop_link();
            state.connection = ConnectionState::Connecting;
            match state.token.clone() {
                Some(token) => (token, state.generation),
                None => {
                    state.connection = ConnectionState::Disconnected;
                    return;
                }
            }
        };
        warn!(session_id = %self.session_id, "channel: transport closed unexpectedly");
        self.reconnect(&token, generation).await;
    }

    async fn reconnect(self: &Arc<Self>, token: &str, generation: u64) {
        let policy = self.settings.reconnect;
        for attempt in 1..=policy.max_attempts() {
            self.emit_signal(ChannelSignal::Reconnecting { attempt });
            sleep(policy.delay_for_attempt(attempt)).await;
            if lock(&self.state).generation != generation {
                return;
            }

            match self.establish(token, generation).await {
                Ok(()) => {
                    info!(session_id = %self.session_id, attempt, "channel: connection restored");
                    self.emit_signal(ChannelSignal::ConnectionRestored);
                    return;
                }
                Err(ChannelError::AuthRejected(message)) => {
                    self.reject_auth(message);
                    return;
                }
                Err(err) => {
                    warn!(session_id = %self.session_id, attempt, error = %err, "channel: reconnect attempt failed");
                }
            }
        }

        {
            let mut state = lock(&self.state);
            if state.generation != generation {
                return;
            }
            state.connection = ConnectionState::Disconnected;
        }
        error!(
            session_id = %self.session_id,
            attempts = policy.max_attempts(),
            "channel: giving up on reconnection"
        );
        self.emit_signal(ChannelSignal::Disconnected {
            reason: format!("reconnect failed after {} attempts", policy.max_attempts()),
        });
    }

    fn record_heartbeat(&self, generation: u64, acked: bool) {
        let degraded = {
            let mut state = lock(&self.state);
            if state.generation != generation {
                return;
            }
            if acked {
                state.missed_heartbeats = 0;
                state.degraded = false;
                state.last_heartbeat = Some(Utc::now());
                None
            } else {
                state.missed_heartbeats += 1;
                if state.missed_heartbeats >= self.settings.heartbeat_miss_threshold
                    && !state.degraded
                {
                    state.degraded = true;
                    Some(state.missed_heartbeats)
                } else {
                    None
                }
            }
        };
        if let Some(missed) = degraded {
            warn!(session_id = %self.session_id, missed, "channel: heartbeat acks missing");
            self.emit_signal(ChannelSignal::ConnectionDegraded { missed });
        }
    }
}

async fn await_handshake(
    inbound: &mut mpsc::UnboundedReceiver<String>,
) -> Result<(), ChannelError> {
    while let Some(text) = inbound.recv().await {
        match decode_frame(&text) {
            Ok(ServerFrame::Handshake(Handshake::Accepted)) => return Ok(()),
            Ok(ServerFrame::Handshake(Handshake::Rejected(err))) => {
                return Err(if err.is_auth_failure() {
                    ChannelError::AuthRejected(err.message)
                } else {
                    ChannelError::Transport(format!("handshake rejected: {}", err.message))
                });
            }
            Ok(_) => debug!("channel: frame before handshake ignored"),
            Err(err) => warn!(error = %err, "channel: undecodable frame during handshake"),
        }
    }
    Err(ChannelError::Transport(
        "connection closed during handshake".into(),
    ))
}

async fn run_reader(
    channel: Weak<EventChannel>,
    mut inbound: mpsc::UnboundedReceiver<String>,
    generation: u64,
) {
    while let Some(text) = inbound.recv().await {
        let Some(channel) = channel.upgrade() else {
            return;
        };
        channel.handle_frame(&text);
    }
    if let Some(channel) = channel.upgrade() {
        channel.on_link_lost(generation).await;
    }
}

async fn run_heartbeat(channel: Weak<EventChannel>, generation: u64, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(channel) = channel.upgrade() else {
            return;
        };
        let acked = channel
            .emit_with_ack(OutboundEvent::Heartbeat, period)
            .await
            .is_ok();
        channel.record_heartbeat(generation, acked);
    }
}

/// A named group of event registrations with one delivery queue.
///
/// Dropping the scope removes every registration it made.
pub struct SubscriberScope {
    id: u64,
    name: &'static str,
    registry: Arc<Mutex<Registry>>,
    sender: mpsc::UnboundedSender<InboundEvent>,
    receiver: mpsc::UnboundedReceiver<InboundEvent>,
    /// Kinds still wanted; anything else left in the queue is skipped.
    kinds: HashSet<EventKind>,
}

impl SubscriberScope {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns `false` when this scope already listens to `kind`.
    pub fn on(&mut self, kind: EventKind) -> bool {
        let mut registry = lock(&self.registry);
        let registrations = registry.by_kind.entry(kind).or_default();
        if registrations.iter().any(|r| r.scope_id == self.id) {
            return false;
        }
        registrations.push(Registration {
            scope_id: self.id,
            sender: self.sender.clone(),
        });
        self.kinds.insert(kind);
        true
    }

    pub fn on_all(&mut self, kinds: &[EventKind]) {
        for kind in kinds {
            self.on(*kind);
        }
    }

    /// Stop delivery of `kind`, including events already queued.
    pub fn off(&mut self, kind: EventKind) -> bool {
        self.kinds.remove(&kind);
        let mut registry = lock(&self.registry);
        let Some(registrations) = registry.by_kind.get_mut(&kind) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.scope_id != self.id);
        let removed = registrations.len() != before;
        if registrations.is_empty() {
            registry.by_kind.remove(&kind);
        }
        removed
    }

    pub fn is_registered(&self, kind: EventKind) -> bool {
        lock(&self.registry)
            .by_kind
            .get(&kind)
            .is_some_and(|registrations| registrations.iter().any(|r| r.scope_id == self.id))
    }

    pub async fn recv(&mut self) -> Option<InboundEvent> {
        loop {
            let event = self.receiver.recv().await?;
            if self.wants(&event) {
                return Some(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<InboundEvent> {
        loop {
            let event = self.receiver.try_recv().ok()?;
            if self.wants(&event) {
                return Some(event);
            }
        }
    }

    fn wants(&self, event: &InboundEvent) -> bool {
        event.kind().is_some_and(|kind| self.kinds.contains(&kind))
    }
}

impl Drop for SubscriberScope {
    fn drop(&mut self) {
        lock(&self.registry).remove_scope(self.id);
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
