//! In-process fakes for the transport, directory and platform seams.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use peer_integration::{
    MediaConstraints, MediaDevices, MediaHandle, PeerConfig, PeerConnector, PeerEvent, PeerLink,
    PeerSession, TrackKind,
};
use serde_json::{json, Value};
use shared::domain::{Conversation, ConversationId, Message, UserId};
use tokio::sync::{mpsc, oneshot};

use crate::{
    channel::{ChannelSettings, EventChannel},
    messages::ConversationDirectory,
    retry::RetryPolicy,
    transport::{ChannelTransport, TransportLink},
};

/// How the fake server answers the next connection attempt.
#[derive(Debug, Clone)]
pub enum HandshakeScript {
    Accept,
    Reject { message: &'static str, code: &'static str },
    RefuseOpen,
    Silent,
}

/// The server side of one fake connection.
pub struct ServerEnd {
    frames: mpsc::UnboundedReceiver<String>,
    push: mpsc::UnboundedSender<String>,
}

impl ServerEnd {
    pub async fn next_frame(&mut self) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the connection");
        serde_json::from_str(&text).expect("client frames are json")
    }

    /// Next frame that is not a heartbeat.
    pub async fn next_event(&mut self) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame["event"] != "heartbeat" {
                return frame;
            }
        }
    }

    pub async fn expect_event(&mut self, name: &str) -> Value {
        let frame = self.next_event().await;
        assert_eq!(frame["event"], name, "unexpected frame {frame}");
        frame
    }

    /// Frames already written by the client, without waiting.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.frames.try_recv() {
            frames.push(serde_json::from_str(&text).expect("client frames are json"));
        }
        frames
    }

    pub fn send_event(&self, event: &str, data: Value) {
        self.send_raw(json!({"event": event, "data": data}).to_string());
    }

    pub fn send_raw(&self, text: impl Into<String>) {
        let _ = self.push.send(text.into());
    }

    pub fn ack(&self, frame: &Value, data: Value) {
        let id = frame["ack"].as_u64().expect("frame requested an ack");
        self.send_raw(json!({"event": "ack", "ack": id, "data": data}).to_string());
    }

    pub fn is_closed(&self) -> bool {
        self.push.is_closed()
    }
}

pub struct FakeTransport {
    scripts: Mutex<VecDeque<HandshakeScript>>,
    servers: mpsc::UnboundedSender<ServerEnd>,
    opens: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, server_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                scripts: Mutex::new(VecDeque::new()),
                servers,
                opens: AtomicUsize::new(0),
            }),
            server_rx,
        )
    }

    pub fn script(&self, script: HandshakeScript) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelTransport for FakeTransport {
    async fn open(&self, _user_id: &UserId, _token: &str) -> Result<TransportLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(HandshakeScript::Accept);

        if matches!(script, HandshakeScript::RefuseOpen) {
            return Err(anyhow!("connection refused"));
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        match script {
            HandshakeScript::Accept => {
                let _ = server_tx.send(json!({"event": "connect"}).to_string());
            }
            HandshakeScript::Reject { message, code } => {
                let _ = server_tx.send(
                    json!({"event": "connect_error", "data": {"message": message, "code": code}})
                        .to_string(),
                );
            }
            HandshakeScript::Silent | HandshakeScript::RefuseOpen => {}
        }
        let _ = self.servers.send(ServerEnd {
            frames: client_rx,
            push: server_tx,
        });
        Ok(TransportLink {
            outbound: client_tx,
            inbound: server_rx,
        })
    }
}

pub fn quiet_settings() -> ChannelSettings {
    ChannelSettings {
        handshake_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(3600),
        heartbeat_miss_threshold: 3,
        reconnect: RetryPolicy::new(10, 40, 3),
    }
}

/// A connected channel whose `join` frame has already been consumed.
pub async fn connected_channel(
    user: &str,
    settings: ChannelSettings,
) -> (
    Arc<EventChannel>,
    Arc<FakeTransport>,
    ServerEnd,
    mpsc::UnboundedReceiver<ServerEnd>,
) {
    let (transport, mut servers) = FakeTransport::new();
    let channel = EventChannel::new(UserId::from(user), settings, transport.clone());
    channel.connect("token").await.expect("connect");
    let mut server = servers.recv().await.expect("server end");
    server.expect_event("join").await;
    (channel, transport, server, servers)
}

#[derive(Default)]
pub struct FakeDirectory {
    pub conversations: Mutex<Vec<Conversation>>,
    pub history: Mutex<HashMap<ConversationId, Vec<Message>>>,
    pub list_calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl FakeDirectory {
    pub fn with_conversations(conversations: Vec<Conversation>) -> Arc<Self> {
        let directory = Self::default();
        *directory.conversations.lock().unwrap() = conversations;
        Arc::new(directory)
    }
}

#[async_trait]
impl ConversationDirectory for FakeDirectory {
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("directory offline"));
        }
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn fetch_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("directory offline"));
        }
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct FakeMedia {
    id: String,
    audio: AtomicBool,
    video: Option<AtomicBool>,
    stops: AtomicUsize,
}

impl FakeMedia {
    pub fn new(id: &str, constraints: MediaConstraints) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            audio: AtomicBool::new(constraints.audio),
            video: constraints.video.then(|| AtomicBool::new(true)),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl MediaHandle for FakeMedia {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_track_enabled(&self, kind: TrackKind) -> Option<bool> {
        match kind {
            TrackKind::Audio => Some(self.audio.load(Ordering::SeqCst)),
            TrackKind::Video => self.video.as_ref().map(|v| v.load(Ordering::SeqCst)),
        }
    }

    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        match kind {
            TrackKind::Audio => {
                self.audio.store(enabled, Ordering::SeqCst);
                true
            }
            TrackKind::Video => match &self.video {
                Some(video) => {
                    video.store(enabled, Ordering::SeqCst);
                    true
                }
                None => false,
            },
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeMediaDevices {
    pub requests: Mutex<Vec<MediaConstraints>>,
    pub handles: Mutex<Vec<Arc<FakeMedia>>>,
    pub fail: AtomicBool,
    gate: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakeMediaDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquisition blocks until the returned sender fires.
    pub fn gated() -> (Arc<Self>, oneshot::Sender<()>) {
        let (release, gate) = oneshot::channel();
        let devices = Self {
            gate: tokio::sync::Mutex::new(Some(gate)),
            ..Self::default()
        };
        (Arc::new(devices), release)
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_handle(&self) -> Option<Arc<FakeMedia>> {
        self.handles.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn get_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn MediaHandle>> {
        self.requests.lock().unwrap().push(constraints);
        if let Some(gate) = self.gate.lock().await.take() {
            let _ = gate.await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("camera permission denied"));
        }
        let count = self.handles.lock().unwrap().len();
        let handle = FakeMedia::new(&format!("local-{}", count + 1), constraints);
        self.handles.lock().unwrap().push(handle.clone());
        Ok(handle)
    }
}

pub struct FakePeer {
    pub initiator: bool,
    pub local_media: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    received: Mutex<Vec<Value>>,
    destroys: AtomicUsize,
}

impl FakePeer {
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

impl PeerLink for FakePeer {
    fn signal(&self, payload: Value) -> Result<()> {
        self.received.lock().unwrap().push(payload);
        Ok(())
    }

    fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakePeerConnector {
    pub peers: Mutex<Vec<Arc<FakePeer>>>,
    pub fail: AtomicBool,
}

impl FakePeerConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_peer(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().unwrap().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnector for FakePeerConnector {
    async fn create_peer(&self, config: PeerConfig) -> Result<PeerSession> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("ice configuration rejected"));
        }
        let (events, events_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(FakePeer {
            initiator: config.initiator,
            local_media: config.local_media.id().to_owned(),
            events,
            received: Mutex::new(Vec::new()),
            destroys: AtomicUsize::new(0),
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok(PeerSession {
            link: peer,
            events: events_rx,
        })
    }
}

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
