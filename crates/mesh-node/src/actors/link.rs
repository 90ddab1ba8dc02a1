//! Per-remote peer link state machine.
//!
//! ```text
//! Idle ──offer──▶ Offering ──┐
//!   └───answer──▶ Answering ─┴─▶ Connected ⇄ Reconnecting
//!                                   any ──▶ Closed
//! ```
//!
//! The link owns its transport connection. It never talks to the mailbox;
//! the coordinator sends whatever SDP a transition produces.

use super::messages::RemoteStream;
use crate::errors::MeshError;
use crate::media::LocalTrack;
use crate::observability::metrics;
use crate::transport::{LinkStats, PeerConnection, RemoteTrack, TransportState};
use common::types::MemberId;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// The lexicographically lower id offers; the other side waits.
pub fn should_offer(local_id: &MemberId, remote_id: &MemberId) -> bool {
    local_id < remote_id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Idle,
    Offering,
    Answering,
    Connected,
    Reconnecting,
    Closed,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Offering => "offering",
            LinkState::Answering => "answering",
            LinkState::Connected => "connected",
            LinkState::Reconnecting => "reconnecting",
            LinkState::Closed => "closed",
        }
    }
}

/// How a link responds to a transport state report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportReaction {
    Unchanged,
    Entered(LinkState),
    /// The transport is gone; the caller must close the link.
    MustClose,
}

pub struct PeerLink {
    remote_id: MemberId,
    generation: u64,
    state: LinkState,
    created_at: Instant,
    connection: Box<dyn PeerConnection>,
    remote_description_set: bool,
    pending_candidates: Vec<String>,
    remote_tracks: Vec<RemoteTrack>,
    stream_announced: bool,
    answered_offer_id: Option<String>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote_id", &self.remote_id)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("remote_description_set", &self.remote_description_set)
            .field("pending_candidates", &self.pending_candidates.len())
            .finish_non_exhaustive()
    }
}

impl PeerLink {
    pub fn new(remote_id: MemberId, generation: u64, connection: Box<dyn PeerConnection>) -> Self {
        Self {
            remote_id,
            generation,
            state: LinkState::Idle,
            created_at: Instant::now(),
            connection,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            remote_tracks: Vec::new(),
            stream_announced: false,
            answered_offer_id: None,
        }
    }

    pub fn remote_id(&self) -> &MemberId {
        &self.remote_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn answered_offer_id(&self) -> Option<&str> {
        self.answered_offer_id.as_deref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn is_open(&self) -> bool {
        self.state != LinkState::Closed
    }

    /// True while an offer or answer is outstanding and the transport has
    /// not connected for longer than `timeout`.
    pub fn negotiation_stalled(&self, now: Instant, timeout: Duration) -> bool {
        matches!(self.state, LinkState::Offering | LinkState::Answering)
            && now.saturating_duration_since(self.created_at) >= timeout
    }

    /// Links whose statistics are worth sampling.
    pub fn is_sampleable(&self) -> bool {
        matches!(self.state, LinkState::Connected | LinkState::Reconnecting)
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state == state {
            return;
        }
        debug!(
            target: "mesh.link",
            remote_id = %self.remote_id,
            generation = self.generation,
            from = self.state.as_str(),
            to = state.as_str(),
            "Link state changed"
        );
        self.state = state;
        metrics::record_link_transition(state.as_str());
    }

    /// `Idle → Offering`. Returns the offer SDP to send.
    pub async fn start_offer(&mut self, tracks: &[LocalTrack]) -> Result<String, MeshError> {
        if self.state != LinkState::Idle {
            return Err(MeshError::Internal(format!(
                "offer from {} link",
                self.state.as_str()
            )));
        }
        self.connection.add_local_tracks(tracks).await?;
        let sdp = self.connection.create_offer().await?;
        self.set_state(LinkState::Offering);
        Ok(sdp)
    }

    /// `Idle → Answering`. Returns the answer SDP to send.
    pub async fn accept_offer(
        &mut self,
        offer_id: &str,
        offer_sdp: &str,
        tracks: &[LocalTrack],
    ) -> Result<String, MeshError> {
        if self.state != LinkState::Idle {
            return Err(MeshError::Internal(format!(
                "answer from {} link",
                self.state.as_str()
            )));
        }
        self.connection.add_local_tracks(tracks).await?;
        let answer = self.connection.accept_offer(offer_sdp).await?;
        self.remote_description_set = true;
        self.answered_offer_id = Some(offer_id.to_string());
        self.set_state(LinkState::Answering);
        self.flush_candidates().await;
        Ok(answer)
    }

    /// Apply a remote answer. Returns false (and does nothing) unless the
    /// link is `Offering` without a remote description.
    pub async fn apply_answer(&mut self, answer_sdp: &str) -> Result<bool, MeshError> {
        if self.state != LinkState::Offering || self.remote_description_set {
            return Ok(false);
        }
        self.connection.apply_answer(answer_sdp).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;
        Ok(true)
    }

    /// Apply a remote candidate, or hold it until a remote description exists.
    pub async fn add_remote_candidate(&mut self, candidate: String) {
        if !self.is_open() {
            return;
        }
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = self.connection.add_remote_candidate(&candidate).await {
            warn!(target: "mesh.link", remote_id = %self.remote_id, error = %e, "Remote candidate rejected");
        }
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(
                target: "mesh.link",
                remote_id = %self.remote_id,
                count = pending.len(),
                "Flushing buffered candidates"
            );
        }
        for candidate in pending {
            if let Err(e) = self.connection.add_remote_candidate(&candidate).await {
                warn!(target: "mesh.link", remote_id = %self.remote_id, error = %e, "Buffered candidate rejected");
            }
        }
    }

    pub fn on_transport_state(&mut self, reported: TransportState) -> TransportReaction {
        let next = match (self.state, reported) {
            (LinkState::Closed, _) => return TransportReaction::Unchanged,
            (_, TransportState::Failed | TransportState::Closed) => {
                return TransportReaction::MustClose
            }
            (
                LinkState::Offering | LinkState::Answering | LinkState::Reconnecting,
                TransportState::Connected | TransportState::Completed,
            ) => LinkState::Connected,
            (LinkState::Connected, TransportState::Checking | TransportState::Disconnected) => {
                LinkState::Reconnecting
            }
            _ => return TransportReaction::Unchanged,
        };
        self.set_state(next);
        TransportReaction::Entered(next)
    }

    /// Record a remote track. Repeats of the same track id are ignored.
    pub fn on_remote_track(&mut self, track: RemoteTrack) {
        if !self.is_open() || self.remote_tracks.iter().any(|t| t.track_id == track.track_id) {
            return;
        }
        self.remote_tracks.push(track);
    }

    /// The remote stream, the first time the link is connected with tracks.
    pub fn take_stream_announcement(&mut self) -> Option<RemoteStream> {
        if self.stream_announced
            || self.state != LinkState::Connected
            || self.remote_tracks.is_empty()
        {
            return None;
        }
        self.stream_announced = true;
        Some(RemoteStream {
            remote_id: self.remote_id.clone(),
            tracks: self.remote_tracks.clone(),
        })
    }

    pub async fn stats(&self) -> Result<LinkStats, MeshError> {
        self.connection.stats().await
    }

    /// Close the link. Returns false if it was already closed.
    pub async fn close(&mut self) -> bool {
        if self.state == LinkState::Closed {
            return false;
        }
        self.set_state(LinkState::Closed);
        self.pending_candidates.clear();
        if let Err(e) = self.connection.close().await {
            debug!(target: "mesh.link", remote_id = %self.remote_id, error = %e, "Transport close failed");
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::TrackKind;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct RecordingConnection(Recorder);

    impl RecordingConnection {
        fn push(&self, call: String) {
            self.0.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl PeerConnection for RecordingConnection {
        async fn add_local_tracks(&self, tracks: &[LocalTrack]) -> Result<(), MeshError> {
            self.push(format!("tracks:{}", tracks.len()));
            Ok(())
        }
        async fn create_offer(&self) -> Result<String, MeshError> {
            self.push("offer".to_string());
            Ok("offer-sdp".to_string())
        }
        async fn accept_offer(&self, offer_sdp: &str) -> Result<String, MeshError> {
            self.push(format!("accept:{offer_sdp}"));
            Ok("answer-sdp".to_string())
        }
        async fn apply_answer(&self, answer_sdp: &str) -> Result<(), MeshError> {
            self.push(format!("answer:{answer_sdp}"));
            Ok(())
        }
        async fn add_remote_candidate(&self, candidate: &str) -> Result<(), MeshError> {
            self.push(format!("candidate:{candidate}"));
            Ok(())
        }
        async fn stats(&self) -> Result<LinkStats, MeshError> {
            Ok(LinkStats::default())
        }
        async fn close(&self) -> Result<(), MeshError> {
            self.push("close".to_string());
            Ok(())
        }
    }

    fn link() -> (PeerLink, Recorder) {
        let recorder = Recorder::default();
        let link = PeerLink::new(
            MemberId::from("bob"),
            1,
            Box::new(RecordingConnection(recorder.clone())),
        );
        (link, recorder)
    }

    fn track(id: &str) -> RemoteTrack {
        RemoteTrack {
            track_id: id.to_string(),
            stream_id: "s".to_string(),
            kind: TrackKind::Audio,
        }
    }

    #[test]
    fn test_should_offer_is_antisymmetric() {
        let a = MemberId::from("alice");
        let b = MemberId::from("bob");

        assert!(should_offer(&a, &b));
        assert!(!should_offer(&b, &a));
        assert!(!should_offer(&a, &a));
    }

    #[tokio::test]
    async fn test_candidates_buffer_until_answer() {
        let (mut link, recorder) = link();
        link.start_offer(&[]).await.unwrap();

        link.add_remote_candidate("c1".to_string()).await;
        assert_eq!(link.pending_candidates(), 1);

        assert!(link.apply_answer("answer-sdp").await.unwrap());

        assert_eq!(link.pending_candidates(), 0);
        assert_eq!(
            recorder.calls(),
            vec!["tracks:0", "offer", "answer:answer-sdp", "candidate:c1"]
        );
    }

    #[tokio::test]
    async fn test_answer_applied_only_once() {
        let (mut link, recorder) = link();
        link.start_offer(&[]).await.unwrap();

        assert!(link.apply_answer("a1").await.unwrap());
        assert!(!link.apply_answer("a2").await.unwrap());

        assert_eq!(
            recorder.calls().iter().filter(|c| c.starts_with("answer:")).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_answer_ignored_when_not_offering() {
        let (mut link, _recorder) = link();

        assert!(!link.apply_answer("a1").await.unwrap());
        assert_eq!(link.state(), LinkState::Idle);
    }

    #[tokio::test]
    async fn test_accept_offer_flushes_early_candidates() {
        let (mut link, recorder) = link();
        link.add_remote_candidate("early".to_string()).await;

        let answer = link.accept_offer("env-1", "offer-sdp", &[]).await.unwrap();

        assert_eq!(answer, "answer-sdp");
        assert_eq!(link.state(), LinkState::Answering);
        assert_eq!(link.answered_offer_id(), Some("env-1"));
        assert_eq!(recorder.calls().last().map(String::as_str), Some("candidate:early"));
    }

    #[tokio::test]
    async fn test_transport_transitions() {
        let (mut link, _recorder) = link();
        link.start_offer(&[]).await.unwrap();

        assert_eq!(
            link.on_transport_state(TransportState::Checking),
            TransportReaction::Unchanged
        );
        assert_eq!(
            link.on_transport_state(TransportState::Connected),
            TransportReaction::Entered(LinkState::Connected)
        );
        assert_eq!(
            link.on_transport_state(TransportState::Disconnected),
            TransportReaction::Entered(LinkState::Reconnecting)
        );
        assert_eq!(
            link.on_transport_state(TransportState::Completed),
            TransportReaction::Entered(LinkState::Connected)
        );
        assert_eq!(
            link.on_transport_state(TransportState::Failed),
            TransportReaction::MustClose
        );
    }

    #[tokio::test]
    async fn test_stream_announced_once_after_connect() {
        let (mut link, _recorder) = link();
        link.start_offer(&[]).await.unwrap();
        link.on_remote_track(track("t1"));

        assert!(link.take_stream_announcement().is_none());

        link.on_transport_state(TransportState::Connected);
        let stream = link.take_stream_announcement().unwrap();
        assert_eq!(stream.tracks.len(), 1);
        assert!(link.take_stream_announcement().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_stalls_only_before_connect() {
        let timeout = Duration::from_secs(10);
        let (mut link, _recorder) = link();
        assert!(!link.negotiation_stalled(Instant::now() + timeout, timeout));

        link.start_offer(&[]).await.unwrap();
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!link.negotiation_stalled(Instant::now(), timeout));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(link.negotiation_stalled(Instant::now(), timeout));

        link.on_transport_state(TransportState::Connected);
        assert!(!link.negotiation_stalled(Instant::now(), timeout));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut link, recorder) = link();
        link.add_remote_candidate("c".to_string()).await;

        assert!(link.close().await);
        assert!(!link.close().await);

        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(link.pending_candidates(), 0);
        assert_eq!(recorder.calls(), vec!["close"]);
        assert_eq!(
            link.on_transport_state(TransportState::Connected),
            TransportReaction::Unchanged
        );
    }
}
