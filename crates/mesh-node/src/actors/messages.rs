//! Message and view types for the mesh coordinator.

use crate::errors::MeshError;
use crate::media::TrackKind;
use crate::quality::QualityTier;
use crate::store::MemberChange;
use crate::transport::RemoteTrack;
use common::types::{MemberId, MemberRecord, SignalEnvelope};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

use super::link::LinkState;

/// Messages handled by the `MeshActor`.
#[derive(Debug)]
pub enum MeshMessage {
    /// A change from the member subscription.
    MemberChanged(MemberChange),

    /// An envelope delivered to one of our mailboxes.
    SignalReceived(SignalEnvelope),

    /// Our record was removed and the room is full again.
    Evicted,

    /// Flip the enabled flag of every local track of `kind`.
    ToggleMedia {
        kind: TrackKind,
        respond_to: oneshot::Sender<Result<bool, MeshError>>,
    },

    GetState {
        respond_to: oneshot::Sender<MeshView>,
    },
}

impl MeshMessage {
    pub fn label(&self) -> &'static str {
        match self {
            MeshMessage::MemberChanged(_) => "member_changed",
            MeshMessage::SignalReceived(_) => "signal_received",
            MeshMessage::Evicted => "evicted",
            MeshMessage::ToggleMedia { .. } => "toggle_media",
            MeshMessage::GetState { .. } => "get_state",
        }
    }
}

/// Why a member left the local roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// The member's record was removed from the store.
    Departed,
    /// The member stopped heartbeating.
    Ghost,
}

/// Why a peer link was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Departed,
    Ghost,
    TransportFailed,
    /// The remote restarted and sent a fresh offer.
    Replaced,
    NegotiationFailed,
    /// Our own membership record was removed.
    Removed,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Departed => "departed",
            CloseReason::Ghost => "ghost",
            CloseReason::TransportFailed => "transport_failed",
            CloseReason::Replaced => "replaced",
            CloseReason::NegotiationFailed => "negotiation_failed",
            CloseReason::Removed => "removed",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// A remote member's media stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStream {
    pub remote_id: MemberId,
    pub tracks: Vec<RemoteTrack>,
}

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    MemberJoined { member: MemberRecord },
    MemberLeft { member_id: MemberId, reason: LeaveReason },
    /// First media from a link; emitted once per link.
    StreamAdded { remote_id: MemberId, stream: RemoteStream },
    LinkClosed { remote_id: MemberId, reason: CloseReason },
    /// We lost our membership and could not get it back.
    Evicted,
}

/// A live roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberSummary {
    pub id: MemberId,
    pub name: String,
}

/// One peer link as seen from outside the actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInfo {
    pub remote_id: MemberId,
    pub state: LinkState,
    pub generation: u64,
}

/// Derived state published after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshView {
    pub local_id: MemberId,
    /// Live members, self included, ordered by id.
    pub members: Vec<MemberSummary>,
    pub online_count: usize,
    pub links: Vec<LinkInfo>,
    pub streams: Vec<RemoteStream>,
    pub quality: BTreeMap<MemberId, QualityTier>,
    pub active_speaker: Option<MemberId>,
    pub reconnecting: bool,
    pub connected_notice: bool,
    pub mic_enabled: bool,
    pub video_enabled: bool,
    pub evicted: bool,
}

impl MeshView {
    pub fn new(local_id: MemberId) -> Self {
        Self {
            local_id,
            members: Vec::new(),
            online_count: 0,
            links: Vec::new(),
            streams: Vec::new(),
            quality: BTreeMap::new(),
            active_speaker: None,
            reconnecting: false,
            connected_notice: false,
            mic_enabled: false,
            video_enabled: false,
            evicted: false,
        }
    }

    pub fn link(&self, remote_id: &MemberId) -> Option<&LinkInfo> {
        self.links.iter().find(|link| &link.remote_id == remote_id)
    }

    pub fn link_state(&self, remote_id: &MemberId) -> Option<LinkState> {
        self.link(remote_id).map(|link| link.state)
    }

    pub fn has_member(&self, id: &MemberId) -> bool {
        self.members.iter().any(|member| &member.id == id)
    }

    /// Number of links currently `Connected`.
    pub fn connected_links(&self) -> usize {
        self.links
            .iter()
            .filter(|link| link.state == LinkState::Connected)
            .count()
    }
}
