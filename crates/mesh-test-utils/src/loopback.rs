//! In-process peer transport.
//!
//! Every `connect` registers an endpoint keyed by `(local, remote)`. Once both
//! directions of a pair hold a local and a remote description, each end gets
//! `Connected` followed by one `RemoteTrack` per track the other end added.
//!
//! SDP strings are opaque markers (`offer:alice->bob:1`); nothing is parsed.
//!
//! # Example
//!
//! ```rust,ignore
//! let network = LoopbackNetwork::new();
//! network.set_stats("alice", "bob", LinkStats { packet_loss: 15.0, audio_energy: 0.2 });
//! network.set_transport_state("alice", "bob", TransportState::Disconnected);
//! ```

use async_trait::async_trait;
use common::types::MemberId;
use mesh_node::errors::MeshError;
use mesh_node::media::LocalTrack;
use mesh_node::transport::{
    LinkStats, PeerConnection, PeerTransport, RemoteTrack, TransportEvent, TransportEventKind,
    TransportEventSender, TransportState,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

type PairKey = (MemberId, MemberId);

#[derive(Debug)]
struct Endpoint {
    generation: u64,
    events: TransportEventSender,
    tracks: Vec<LocalTrack>,
    local_description: bool,
    remote_description: bool,
    connected: bool,
    closed: bool,
    candidates_received: Vec<String>,
}

impl Endpoint {
    fn emit(&self, remote_id: &MemberId, kind: TransportEventKind) {
        if self.closed {
            return;
        }
        let _ = self.events.send(TransportEvent {
            remote_id: remote_id.clone(),
            generation: self.generation,
            kind,
        });
    }

    fn ready(&self) -> bool {
        !self.closed && self.local_description && self.remote_description
    }
}

#[derive(Debug, Default)]
struct NetworkInner {
    endpoints: HashMap<PairKey, Endpoint>,
    stats: HashMap<PairKey, LinkStats>,
    offers_created: Vec<PairKey>,
    refused: Vec<MemberId>,
}

impl NetworkInner {
    /// Raise `Connected` on both ends once negotiation finished on both.
    fn check_connected(&mut self, local: &MemberId, remote: &MemberId) {
        let forward = (local.clone(), remote.clone());
        let backward = (remote.clone(), local.clone());
        let both_ready = matches!(
            (self.endpoints.get(&forward), self.endpoints.get(&backward)),
            (Some(a), Some(b)) if a.ready() && b.ready() && !(a.connected && b.connected)
        );
        if !both_ready {
            return;
        }

        let forward_tracks = remote_tracks(local, &self.endpoints[&forward].tracks);
        let backward_tracks = remote_tracks(remote, &self.endpoints[&backward].tracks);

        if let Some(endpoint) = self.endpoints.get_mut(&forward) {
            endpoint.connected = true;
            endpoint.emit(remote, TransportEventKind::StateChanged(TransportState::Connected));
            for track in backward_tracks {
                endpoint.emit(remote, TransportEventKind::RemoteTrack(track));
            }
        }
        if let Some(endpoint) = self.endpoints.get_mut(&backward) {
            endpoint.connected = true;
            endpoint.emit(local, TransportEventKind::StateChanged(TransportState::Connected));
            for track in forward_tracks {
                endpoint.emit(local, TransportEventKind::RemoteTrack(track));
            }
        }
    }
}

fn remote_tracks(owner: &MemberId, tracks: &[LocalTrack]) -> Vec<RemoteTrack> {
    tracks
        .iter()
        .map(|track| RemoteTrack {
            track_id: track.id.clone(),
            stream_id: format!("stream-{owner}"),
            kind: track.kind,
        })
        .collect()
}

/// Shared in-process network. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap()
    }

    /// A transport handle to give to one session.
    #[must_use]
    pub fn transport(&self) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            network: self.clone(),
        })
    }

    /// Statistics `local` will read for its link to `remote`.
    pub fn set_stats(&self, local: &str, remote: &str, stats: LinkStats) {
        self.lock()
            .stats
            .insert((MemberId::from(local), MemberId::from(remote)), stats);
    }

    /// Report `state` to `local`'s link towards `remote`.
    pub fn set_transport_state(&self, local: &str, remote: &str, state: TransportState) {
        let key = (MemberId::from(local), MemberId::from(remote));
        if let Some(endpoint) = self.lock().endpoints.get(&key) {
            endpoint.emit(&key.1, TransportEventKind::StateChanged(state));
        }
    }

    /// Make every future `connect` from `member` fail.
    pub fn refuse_connections_from(&self, member: &str) {
        self.lock().refused.push(MemberId::from(member));
    }

    /// Let `member` connect again.
    pub fn accept_connections_from(&self, member: &str) {
        let member = MemberId::from(member);
        self.lock().refused.retain(|refused| refused != &member);
    }

    /// `(offerer, answerer)` for every offer created so far.
    #[must_use]
    pub fn offers_created(&self) -> Vec<(MemberId, MemberId)> {
        self.lock().offers_created.clone()
    }

    /// Whether `local`'s current link to `remote` reached `Connected`.
    #[must_use]
    pub fn is_connected(&self, local: &str, remote: &str) -> bool {
        self.lock()
            .endpoints
            .get(&(MemberId::from(local), MemberId::from(remote)))
            .is_some_and(|endpoint| endpoint.connected && !endpoint.closed)
    }

    /// Remote candidates applied by `local`'s current link to `remote`.
    #[must_use]
    pub fn candidates_received(&self, local: &str, remote: &str) -> Vec<String> {
        self.lock()
            .endpoints
            .get(&(MemberId::from(local), MemberId::from(remote)))
            .map(|endpoint| endpoint.candidates_received.clone())
            .unwrap_or_default()
    }
}

/// `PeerTransport` backed by a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn connect(
        &self,
        local_id: &MemberId,
        remote_id: &MemberId,
        generation: u64,
        events: TransportEventSender,
    ) -> Result<Box<dyn PeerConnection>, MeshError> {
        let mut inner = self.network.lock();
        if inner.refused.contains(local_id) {
            return Err(MeshError::Transport("loopback refused".to_string()));
        }
        inner.endpoints.insert(
            (local_id.clone(), remote_id.clone()),
            Endpoint {
                generation,
                events,
                tracks: Vec::new(),
                local_description: false,
                remote_description: false,
                connected: false,
                closed: false,
                candidates_received: Vec::new(),
            },
        );
        Ok(Box::new(LoopbackConnection {
            network: self.network.clone(),
            local_id: local_id.clone(),
            remote_id: remote_id.clone(),
            generation,
        }))
    }
}

struct LoopbackConnection {
    network: LoopbackNetwork,
    local_id: MemberId,
    remote_id: MemberId,
    generation: u64,
}

impl LoopbackConnection {
    fn key(&self) -> PairKey {
        (self.local_id.clone(), self.remote_id.clone())
    }

    /// Run `f` on our endpoint if it still belongs to this connection.
    fn with_endpoint<T>(
        &self,
        f: impl FnOnce(&mut NetworkInner, &PairKey) -> T,
    ) -> Result<T, MeshError> {
        let mut inner = self.network.lock();
        let key = self.key();
        let current = inner
            .endpoints
            .get(&key)
            .is_some_and(|endpoint| endpoint.generation == self.generation && !endpoint.closed);
        if !current {
            return Err(MeshError::Transport("loopback endpoint closed".to_string()));
        }
        Ok(f(&mut inner, &key))
    }

    fn marker(&self, kind: &str) -> String {
        format!("{kind}:{}->{}:{}", self.local_id, self.remote_id, self.generation)
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn add_local_tracks(&self, tracks: &[LocalTrack]) -> Result<(), MeshError> {
        self.with_endpoint(|inner, key| {
            if let Some(endpoint) = inner.endpoints.get_mut(key) {
                endpoint.tracks.extend_from_slice(tracks);
            }
        })
    }

    async fn create_offer(&self) -> Result<String, MeshError> {
        let candidate = self.marker("candidate");
        self.with_endpoint(|inner, key| {
            inner.offers_created.push(key.clone());
            if let Some(endpoint) = inner.endpoints.get_mut(key) {
                endpoint.local_description = true;
                endpoint.emit(&key.1, TransportEventKind::LocalCandidate(candidate));
            }
        })?;
        Ok(self.marker("offer"))
    }

    async fn accept_offer(&self, _offer_sdp: &str) -> Result<String, MeshError> {
        let candidate = self.marker("candidate");
        self.with_endpoint(|inner, key| {
            if let Some(endpoint) = inner.endpoints.get_mut(key) {
                endpoint.local_description = true;
                endpoint.remote_description = true;
                endpoint.emit(&key.1, TransportEventKind::LocalCandidate(candidate));
            }
            inner.check_connected(&key.0, &key.1);
        })?;
        Ok(self.marker("answer"))
    }

    async fn apply_answer(&self, _answer_sdp: &str) -> Result<(), MeshError> {
        self.with_endpoint(|inner, key| {
            if let Some(endpoint) = inner.endpoints.get_mut(key) {
                endpoint.remote_description = true;
            }
            inner.check_connected(&key.0, &key.1);
        })
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), MeshError> {
        self.with_endpoint(|inner, key| {
            if let Some(endpoint) = inner.endpoints.get_mut(key) {
                endpoint.candidates_received.push(candidate.to_string());
            }
        })
    }

    async fn stats(&self) -> Result<LinkStats, MeshError> {
        self.with_endpoint(|inner, key| inner.stats.get(key).copied().unwrap_or_default())
    }

    async fn close(&self) -> Result<(), MeshError> {
        let mut inner = self.network.lock();
        let key = self.key();
        match inner.endpoints.get_mut(&key) {
            Some(endpoint) if endpoint.generation == self.generation => endpoint.closed = true,
            _ => return Ok(()),
        }
        let peer_key = (self.remote_id.clone(), self.local_id.clone());
        if let Some(peer) = inner.endpoints.get(&peer_key) {
            if peer.connected {
                peer.emit(&self.local_id, TransportEventKind::StateChanged(TransportState::Disconnected));
            }
        }
        Ok(())
    }
}
