//! Seams to the platform media and peer-connection primitives used by calls.

use std::{fmt, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::domain::CallKind;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    /// Audio is always requested; video only for video calls.
    pub fn for_call(kind: CallKind) -> Self {
        Self {
            audio: true,
            video: kind == CallKind::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A captured or received media stream.
pub trait MediaHandle: Send + Sync {
    fn id(&self) -> &str;
    /// `None` when the stream has no track of that kind.
    fn is_track_enabled(&self, kind: TrackKind) -> Option<bool>;
    /// Returns `false` when the stream has no track of that kind.
    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> bool;
    /// Stop every track. Calling it on a stopped stream is a no-op.
    fn stop(&self);
}

impl fmt::Debug for dyn MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle").field("id", &self.id()).finish()
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> anyhow::Result<Arc<dyn MediaHandle>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: String,
}

pub fn default_ice_servers() -> Vec<IceServer> {
    [
        "stun:stun.l.google.com:19302",
        "stun:stun1.l.google.com:19302",
        "stun:stun2.l.google.com:19302",
    ]
    .into_iter()
    .map(|urls| IceServer { urls: urls.into() })
    .collect()
}

#[derive(Clone)]
pub struct PeerConfig {
    pub initiator: bool,
    pub trickle: bool,
    pub ice_servers: Vec<IceServer>,
    pub local_media: Arc<dyn MediaHandle>,
}

impl fmt::Debug for PeerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConfig")
            .field("initiator", &self.initiator)
            .field("trickle", &self.trickle)
            .field("ice_servers", &self.ice_servers)
            .field("local_media", &self.local_media.id())
            .finish()
    }
}

#[derive(Clone)]
pub enum PeerEvent {
    /// Negotiation payload that must reach the remote peer unchanged.
    Signal(Value),
    Stream(Arc<dyn MediaHandle>),
    Connect,
    Close,
    Error(String),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(payload) => f.debug_tuple("Signal").field(payload).finish(),
            Self::Stream(handle) => f.debug_tuple("Stream").field(&handle.id()).finish(),
            Self::Connect => f.write_str("Connect"),
            Self::Close => f.write_str("Close"),
            Self::Error(err) => f.debug_tuple("Error").field(err).finish(),
        }
    }
}

pub trait PeerLink: Send + Sync {
    /// Feed a remote negotiation payload into the link.
    fn signal(&self, payload: Value) -> anyhow::Result<()>;
    fn destroy(&self);
}

/// A freshly created peer link and the stream of events it produces.
pub struct PeerSession {
    pub link: Arc<dyn PeerLink>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create_peer(&self, config: PeerConfig) -> anyhow::Result<PeerSession>;
}

pub struct MissingMediaDevices;

#[async_trait]
impl MediaDevices for MissingMediaDevices {
    async fn get_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> anyhow::Result<Arc<dyn MediaHandle>> {
        Err(anyhow!(
            "media devices are unavailable (audio={} video={})",
            constraints.audio,
            constraints.video
        ))
    }
}

pub struct MissingPeerConnector;

#[async_trait]
impl PeerConnector for MissingPeerConnector {
    async fn create_peer(&self, _config: PeerConfig) -> anyhow::Result<PeerSession> {
        Err(anyhow!("peer connector is unavailable"))
    }
}
