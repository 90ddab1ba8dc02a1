//! Peer transport abstraction.
//!
//! A [`PeerTransport`] opens one [`PeerConnection`] per remote member. The
//! connection reports asynchronous happenings (local ICE candidates, remote
//! tracks, ICE state) on the event channel handed to `connect`, tagged with
//! the link generation so the coordinator can drop events from replaced
//! links.

pub mod webrtc;

pub use self::webrtc::WebRtcTransport;

use crate::errors::MeshError;
use crate::media::{LocalTrack, TrackKind};
use async_trait::async_trait;
use common::types::MemberId;
use serde::Serialize;
use tokio::sync::mpsc;

/// ICE-level connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::New => "new",
            TransportState::Checking => "checking",
            TransportState::Connected => "connected",
            TransportState::Completed => "completed",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        }
    }
}

/// A track received from a remote member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTrack {
    pub track_id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    /// Serialized ICE candidate to forward to the remote.
    LocalCandidate(String),
    RemoteTrack(RemoteTrack),
    StateChanged(TransportState),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub remote_id: MemberId,
    pub generation: u64,
    pub kind: TransportEventKind,
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// One sample of link statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinkStats {
    /// Percent of packets lost since the previous sample.
    pub packet_loss: f64,
    /// Remote audio level in [0, 1].
    pub audio_energy: f64,
}

/// One peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_tracks(&self, tracks: &[LocalTrack]) -> Result<(), MeshError>;

    /// Create an offer and set it as the local description.
    async fn create_offer(&self) -> Result<String, MeshError>;

    /// Set the remote offer, then create and set the local answer.
    async fn accept_offer(&self, offer_sdp: &str) -> Result<String, MeshError>;

    async fn apply_answer(&self, answer_sdp: &str) -> Result<(), MeshError>;

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), MeshError>;

    async fn stats(&self) -> Result<LinkStats, MeshError>;

    async fn close(&self) -> Result<(), MeshError>;
}

/// Factory for peer connections.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn connect(
        &self,
        local_id: &MemberId,
        remote_id: &MemberId,
        generation: u64,
        events: TransportEventSender,
    ) -> Result<Box<dyn PeerConnection>, MeshError>;
}
