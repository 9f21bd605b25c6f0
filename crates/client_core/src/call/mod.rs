//! Two-party call negotiation: ringing, signaling relay and peer media setup.

mod state;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use peer_integration::{
    default_ice_servers, IceServer, MediaConstraints, MediaDevices, MediaHandle, PeerConfig,
    PeerConnector, PeerEvent, PeerLink, PeerSession, TrackKind,
};
use serde_json::Value;
use shared::{
    domain::{CallKind, RoomId, UserId, UserRef},
    error::RealtimeError,
    protocol::{
        CallInitiated, CallUpdate, EventKind, InboundEvent, IncomingCall, InitiateCall,
        OutboundEvent, RoomPayload, SignalEnvelope,
    },
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

pub use state::{CallError, CallPhase, CallRole, CallSession, EndOrigin, EndReason};

use crate::{channel::EventChannel, ClientEvent};

#[derive(Debug, Clone)]
pub struct CallSettings {
    pub ring_timeout: Duration,
    pub ice_servers: Vec<IceServer>,
    /// Remote signals held while the peer link is still being created.
    pub signal_buffer: usize,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(45),
            ice_servers: default_ice_servers(),
            signal_buffer: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    PhaseChanged {
        room_id: Option<RoomId>,
        phase: CallPhase,
    },
    Incoming {
        room_id: RoomId,
        caller: UserRef,
        kind: CallKind,
    },
    /// A second call arrived while one was in progress and was declined.
    Busy {
        room_id: RoomId,
        caller: UserRef,
    },
    RemoteStream {
        room_id: Option<RoomId>,
        stream_id: String,
    },
    MediaToggled {
        track: TrackKind,
        enabled: bool,
    },
    Ended {
        room_id: Option<RoomId>,
        reason: EndReason,
    },
    Failed(RealtimeError),
}

#[derive(Default)]
struct CallState {
    session: Option<CallSession>,
    generation: u64,
    peer: Option<Arc<dyn PeerLink>>,
    pending_signals: VecDeque<Value>,
    ring_timer: Option<JoinHandle<()>>,
    peer_pump: Option<JoinHandle<()>>,
    /// Outgoing calls ended locally before the server assigned their room.
    /// Their `call-initiated` is still on the way and must be answered with
    /// `end-call`.
    abandoned_initiations: u32,
}

impl CallState {
    fn is_current(&self, generation: u64) -> bool {
        self.session.is_some() && self.generation == generation
    }

    fn begin(&mut self, session: CallSession) -> u64 {
        self.generation += 1;
        self.session = Some(session);
        self.pending_signals.clear();
        self.generation
    }
}

pub struct CallController {
    channel: Arc<EventChannel>,
    media: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnector>,
    settings: CallSettings,
    events: broadcast::Sender<ClientEvent>,
    inner: Mutex<CallState>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl CallController {
    pub fn new(
        channel: Arc<EventChannel>,
        media: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnector>,
        settings: CallSettings,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            media,
            peers,
            settings,
            events,
            inner: Mutex::new(CallState::default()),
            pump: Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let mut scope = self.channel.scope("calls");
        scope.on_all(&[
            EventKind::CallInitiated,
            EventKind::IncomingCall,
            EventKind::CallAccepted,
            EventKind::CallRejected,
            EventKind::CallEnded,
            EventKind::WebrtcSignal,
        ]);

        let controller = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            while let Some(event) = scope.recv().await {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.handle_event(event).await;
            }
        });
        if let Some(previous) = self.pump.lock().await.replace(pump) {
            previous.abort();
        }
    }

    fn publish(&self, event: CallEvent) {
        let _ = self.events.send(ClientEvent::Call(event));
    }

    fn emit_quietly(&self, event: OutboundEvent) {
        let name = event.name();
        if let Err(err) = self.channel.emit(event) {
            debug!(event = name, error = %err, "calls: emit skipped");
        }
    }

    pub async fn phase(&self) -> CallPhase {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .map_or(CallPhase::Idle, |session| session.phase)
    }

    pub async fn snapshot(&self) -> Option<CallSession> {
        self.inner.lock().await.session.clone()
    }

    /// Ring `callee`. The room id arrives later with `call-initiated`.
    pub async fn initiate(self: &Arc<Self>, callee: UserId, kind: CallKind) -> Result<(), CallError> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(session) = &inner.session {
                return Err(CallError::Busy(session.phase));
            }
            self.channel.emit(OutboundEvent::InitiateCall(InitiateCall {
                callee_id: callee.clone(),
                kind,
            }))?;
            let generation = inner.begin(CallSession::outgoing(callee.clone(), kind));
            inner.ring_timer = Some(self.arm_ring_timer(generation));
        }
        info!(%callee, ?kind, "calls: ringing");
        self.publish(CallEvent::PhaseChanged {
            room_id: None,
            phase: CallPhase::Outgoing,
        });
        Ok(())
    }

    fn arm_ring_timer(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let controller = Arc::downgrade(self);
        let timeout = self.settings.ring_timeout;
        tokio::spawn(async move {
            sleep(timeout).await;
            if let Some(controller) = controller.upgrade() {
                let ended = controller
                    .end_call_where(
                        |state| {
                            state.is_current(generation)
                                && state
                                    .session
                                    .as_ref()
                                    .is_some_and(|session| session.phase.is_ringing())
                        },
                        EndReason::Timeout,
                        EndOrigin::Local,
                    )
                    .await;
                if ended {
                    info!(?timeout, "calls: ring timed out");
                }
            }
        })
    }

    /// Answer the ringing incoming call.
    pub async fn accept(self: &Arc<Self>) -> Result<(), CallError> {
        let (room_id, kind, generation) = {
            let mut inner = self.inner.lock().await;
            let generation = inner.generation;
            let session = inner.session.as_mut().ok_or(CallError::NoCall)?;
            if session.phase != CallPhase::Incoming {
                return Err(CallError::InvalidState {
                    action: "accept",
                    phase: session.phase,
                });
            }
            let room_id = session.room_id.clone().ok_or(CallError::NoCall)?;
            self.channel.emit(OutboundEvent::AcceptCall(RoomPayload {
                room_id: room_id.clone(),
            }))?;
            session.advance(CallPhase::Connecting)?;
            (room_id, session.kind, generation)
        };
        info!(%room_id, "calls: accepted");
        self.publish(CallEvent::PhaseChanged {
            room_id: Some(room_id),
            phase: CallPhase::Connecting,
        });
        self.spawn_setup(generation, kind, false);
        Ok(())
    }

    pub async fn decline(&self) -> Result<(), CallError> {
        let declined = self
            .end_call_where(
                |state| {
                    state
                        .session
                        .as_ref()
                        .is_some_and(|session| session.phase == CallPhase::Incoming)
                },
                EndReason::Declined,
                EndOrigin::Local,
            )
            .await;
        if declined {
            return Ok(());
        }
        match self.phase().await {
            CallPhase::Idle => Err(CallError::NoCall),
            phase => Err(CallError::InvalidState {
                action: "decline",
                phase,
            }),
        }
    }

    /// End whatever call is in progress.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        if self
            .end_call_where(|_| true, EndReason::HungUp, EndOrigin::Local)
            .await
        {
            Ok(())
        } else {
            Err(CallError::NoCall)
        }
    }

    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.toggle_track(TrackKind::Audio).await
    }

    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.toggle_track(TrackKind::Video).await
    }

    async fn toggle_track(&self, track: TrackKind) -> Result<bool, CallError> {
        let enabled = {
            let inner = self.inner.lock().await;
            let session = inner.session.as_ref().ok_or(CallError::NoCall)?;
            let media = session.local_media.as_ref().ok_or(CallError::NoLocalMedia)?;
            let current = media
                .is_track_enabled(track)
                .ok_or(CallError::MissingTrack(track))?;
            if !media.set_track_enabled(track, !current) {
                return Err(CallError::MissingTrack(track));
            }
            !current
        };
        debug!(?track, enabled, "calls: track toggled");
        self.publish(CallEvent::MediaToggled { track, enabled });
        Ok(enabled)
    }

    fn spawn_setup(self: &Arc<Self>, generation: u64, kind: CallKind, initiator: bool) {
        let controller = self.clone();
        tokio::spawn(async move {
            controller.establish_media(generation, kind, initiator).await;
        });
    }

    /// Acquire local media and create the peer link for the call identified by
    /// `generation`. Work for a call that ended meanwhile is discarded.
    async fn establish_media(self: &Arc<Self>, generation: u64, kind: CallKind, initiator: bool) {
        let constraints = MediaConstraints::for_call(kind);
        let media = match self.media.get_local_media(constraints).await {
            Ok(media) => media,
            Err(err) => {
                let error = CallError::MediaAcquisitionFailed(format!("{err:#}"));
                error!(error = %error, "calls: media acquisition failed");
                if self.inner.lock().await.is_current(generation) {
                    self.publish(CallEvent::Failed(RealtimeError::from(&error)));
                }
                self.end_current(generation, EndReason::MediaUnavailable(format!("{err:#}")))
                    .await;
                return;
            }
        };

        let stale = {
            let mut inner = self.inner.lock().await;
            let current = inner.generation == generation;
            match inner.session.as_mut() {
                Some(session) if current => {
                    session.local_media = Some(media.clone());
                    false
                }
                _ => true,
            }
        };
        if stale {
            debug!(stream = media.id(), "calls: call ended while acquiring media, discarding");
            media.stop();
            return;
        }

        let config = PeerConfig {
            initiator,
            trickle: true,
            ice_servers: self.settings.ice_servers.clone(),
            local_media: media,
        };
        let PeerSession { link, events } = match self.peers.create_peer(config).await {
            Ok(session) => session,
            Err(err) => {
                let error = CallError::PeerLink(format!("{err:#}"));
                error!(error = %error, "calls: peer link creation failed");
                if self.inner.lock().await.is_current(generation) {
                    self.publish(CallEvent::Failed(RealtimeError::from(&error)));
                }
                self.end_current(generation, EndReason::PeerFailed(format!("{err:#}")))
                    .await;
                return;
            }
        };

        let mut inner = self.inner.lock().await;
        if !inner.is_current(generation) {
            drop(inner);
            debug!("calls: call ended while creating peer link, destroying it");
            link.destroy();
            return;
        }
        let buffered: Vec<_> = inner.pending_signals.drain(..).collect();
        for signal in buffered {
            if let Err(err) = link.signal(signal) {
                warn!(error = %err, "calls: buffered signal rejected by peer link");
            }
        }
        inner.peer = Some(link);
        inner.peer_pump = Some(self.spawn_peer_pump(generation, events));
        info!(initiator, "calls: peer link created");
    }

    fn spawn_peer_pump(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) -> JoinHandle<()> {
        let controller = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(controller) = controller.upgrade() else {
                    return;
                };
                if !controller.handle_peer_event(generation, event).await {
                    return;
                }
            }
            if let Some(controller) = controller.upgrade() {
                controller.end_current(generation, EndReason::PeerClosed).await;
            }
        })
    }

    /// Returns `false` once the peer link is finished.
    async fn handle_peer_event(&self, generation: u64, event: PeerEvent) -> bool {
        match event {
            PeerEvent::Signal(signal) => {
                let inner = self.inner.lock().await;
                if !inner.is_current(generation) {
                    return false;
                }
                let Some(room_id) = inner.session.as_ref().and_then(|s| s.room_id.clone()) else {
                    debug!("calls: dropping local signal without a room");
                    return true;
                };
                self.emit_quietly(OutboundEvent::WebrtcSignal(SignalEnvelope {
                    room_id,
                    signal,
                    sender_id: Some(self.channel.user_id().clone()),
                }));
                true
            }
            PeerEvent::Stream(stream) => {
                let (room_id, activated) = {
                    let mut inner = self.inner.lock().await;
                    if !inner.is_current(generation) {
                        stream.stop();
                        return false;
                    }
                    let Some(session) = inner.session.as_mut() else {
                        return false;
                    };
                    if let Some(previous) = session.remote_media.replace(stream.clone()) {
                        previous.stop();
                    }
                    let activated = session.phase == CallPhase::Connecting
                        && session.advance(CallPhase::Active).is_ok();
                    (session.room_id.clone(), activated)
                };
                if activated {
                    info!(room_id = ?room_id, "calls: remote stream received, call active");
                    self.publish(CallEvent::PhaseChanged {
                        room_id: room_id.clone(),
                        phase: CallPhase::Active,
                    });
                }
                self.publish(CallEvent::RemoteStream {
                    room_id,
                    stream_id: stream.id().to_owned(),
                });
                true
            }
            PeerEvent::Connect => {
                debug!("calls: peer link connected");
                true
            }
            PeerEvent::Close => {
                self.end_current(generation, EndReason::PeerClosed).await;
                false
            }
            PeerEvent::Error(message) => {
                let error = CallError::PeerLink(message.clone());
                warn!(error = %error, "calls: peer link error");
                if self.inner.lock().await.is_current(generation) {
                    self.publish(CallEvent::Failed(RealtimeError::from(&error)));
                }
                self.end_current(generation, EndReason::PeerFailed(message))
                    .await;
                false
            }
        }
    }

    async fn end_current(&self, generation: u64, reason: EndReason) -> bool {
        self.end_call_where(
            |state| state.is_current(generation),
            reason,
            EndOrigin::Local,
        )
        .await
    }

    /// Tear down the session if `filter` accepts the current state. Returns
    /// `false` when there was nothing to end.
    async fn end_call_where(
        &self,
        filter: impl FnOnce(&CallState) -> bool,
        reason: EndReason,
        origin: EndOrigin,
    ) -> bool {
        let (mut session, peer, ring_timer, peer_pump) = {
            let mut inner = self.inner.lock().await;
            if !filter(&*inner) {
                return false;
            }
            let Some(session) = inner.session.take() else {
                return false;
            };
            if origin == EndOrigin::Local
                && session.role == CallRole::Initiator
                && session.room_id.is_none()
            {
                inner.abandoned_initiations += 1;
            }
            inner.generation += 1;
            inner.pending_signals.clear();
            (
                session,
                inner.peer.take(),
                inner.ring_timer.take(),
                inner.peer_pump.take(),
            )
        };

        if let Some(closing) = session.closing_event(origin) {
            self.emit_quietly(closing);
        }
        if let Some(peer) = peer {
            peer.destroy();
        }
        for media in [session.local_media.take(), session.remote_media.take()]
            .into_iter()
            .flatten()
        {
            media.stop();
        }
        if let Err(err) = session.advance(CallPhase::Ended) {
            debug!(error = %err, "calls: ending from unexpected phase");
        }
        info!(room_id = ?session.room_id, ?reason, ?origin, "calls: call ended");
        self.publish(CallEvent::Ended {
            room_id: session.room_id,
            reason,
        });

        // Aborted last: the caller may be one of these tasks.
        if let Some(timer) = ring_timer {
            timer.abort();
        }
        if let Some(pump) = peer_pump {
            pump.abort();
        }
        true
    }

    async fn handle_event(self: &Arc<Self>, event: InboundEvent) {
        match event {
            InboundEvent::CallInitiated(CallInitiated { room_id, .. }) => {
                let mut inner = self.inner.lock().await;
                // Rooms are assigned in initiation order, so the oldest
                // abandoned initiation owns this one.
                if inner.abandoned_initiations > 0 {
                    inner.abandoned_initiations -= 1;
                    drop(inner);
                    info!(%room_id, "calls: room assigned to an abandoned call, ending it");
                    self.emit_quietly(OutboundEvent::EndCall(RoomPayload { room_id }));
                    return;
                }
                match inner.session.as_mut() {
                    Some(session)
                        if session.phase == CallPhase::Outgoing && session.room_id.is_none() =>
                    {
                        session.room_id = Some(room_id.clone());
                        self.emit_quietly(OutboundEvent::JoinCallRoom(room_id.clone()));
                        info!(%room_id, "calls: room assigned");
                    }
                    _ => debug!(%room_id, "calls: call-initiated without an outgoing call"),
                }
            }
            InboundEvent::IncomingCall(incoming) => self.incoming_call(incoming).await,
            InboundEvent::CallAccepted(CallUpdate { room_id, .. }) => {
                self.remote_accepted(room_id).await;
            }
            InboundEvent::CallRejected(CallUpdate { room_id, .. }) => {
                self.end_call_where(
                    |state| state.session.as_ref().is_some_and(|s| s.is_room(&room_id)),
                    EndReason::Declined,
                    EndOrigin::Remote,
                )
                .await;
            }
            InboundEvent::CallEnded(CallUpdate { room_id, reason }) => {
                self.end_call_where(
                    |state| state.session.as_ref().is_some_and(|s| s.is_room(&room_id)),
                    EndReason::RemoteEnded(reason),
                    EndOrigin::Remote,
                )
                .await;
            }
            InboundEvent::WebrtcSignal(envelope) => self.remote_signal(envelope).await,
            other => debug!(event = ?other.kind(), "calls: unexpected event"),
        }
    }

    async fn incoming_call(&self, incoming: IncomingCall) {
        let IncomingCall {
            room_id,
            caller,
            kind,
        } = incoming;
        let busy = {
            let mut inner = self.inner.lock().await;
            match inner.session.as_ref().map(|session| session.is_room(&room_id)) {
                Some(true) => {
                    debug!(%room_id, "calls: repeated incoming-call ignored");
                    return;
                }
                Some(false) => true,
                None => {
                    inner.begin(CallSession::incoming(room_id.clone(), caller.id().clone(), kind));
                    false
                }
            }
        };
        if busy {
            info!(%room_id, caller = %caller.id(), "calls: busy, declining second call");
            self.emit_quietly(OutboundEvent::DeclineCall(RoomPayload {
                room_id: room_id.clone(),
            }));
            self.publish(CallEvent::Busy { room_id, caller });
            return;
        }
        info!(%room_id, caller = %caller.id(), ?kind, "calls: incoming call");
        self.publish(CallEvent::Incoming {
            room_id,
            caller,
            kind,
        });
    }

    async fn remote_accepted(self: &Arc<Self>, room_id: RoomId) {
        let (generation, kind, ring_timer) = {
            let mut inner = self.inner.lock().await;
            let generation = inner.generation;
            let Some(session) = inner.session.as_mut() else {
                debug!(%room_id, "calls: call-accepted without a call");
                return;
            };
            let room_matches = match &session.room_id {
                Some(current) => *current == room_id,
                None => true,
            };
            if session.phase != CallPhase::Outgoing || !room_matches {
                debug!(%room_id, phase = ?session.phase, "calls: ignoring call-accepted");
                return;
            }
            if session.room_id.is_none() {
                session.room_id = Some(room_id.clone());
            }
            if let Err(err) = session.advance(CallPhase::Connecting) {
                warn!(error = %err, "calls: cannot start connecting");
                return;
            }
            let kind = session.kind;
            (generation, kind, inner.ring_timer.take())
        };
        if let Some(timer) = ring_timer {
            timer.abort();
        }
        info!(%room_id, "calls: callee accepted");
        self.publish(CallEvent::PhaseChanged {
            room_id: Some(room_id),
            phase: CallPhase::Connecting,
        });
        self.spawn_setup(generation, kind, true);
    }

    async fn remote_signal(&self, envelope: SignalEnvelope) {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.session.as_ref() else {
            debug!(room_id = %envelope.room_id, "calls: signal without a call");
            return;
        };
        if !session.is_room(&envelope.room_id) {
            debug!(room_id = %envelope.room_id, "calls: signal for another room ignored");
            return;
        }
        let phase = session.phase;
        if let Some(peer) = &inner.peer {
            if let Err(err) = peer.signal(envelope.signal) {
                warn!(error = %err, "calls: peer link rejected signal");
            }
            return;
        }
        if phase != CallPhase::Connecting {
            debug!(?phase, "calls: signal before the call was accepted ignored");
            return;
        }
        if inner.pending_signals.len() >= self.settings.signal_buffer {
            warn!(
                limit = self.settings.signal_buffer,
                "calls: signal buffer full, dropping signal"
            );
            return;
        }
        inner.pending_signals.push_back(envelope.signal);
    }

    /// Stop the event pump and force any call to end.
    pub async fn shutdown(&self) {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        self.end_call_where(|_| true, EndReason::Shutdown, EndOrigin::Local)
            .await;
    }
}

#[cfg(test)]
#[path = "../tests/call_tests.rs"]
mod tests;
