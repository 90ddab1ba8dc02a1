//! `MeshActor` - the per-session coordinator.
//!
//! The actor owns the local roster, every [`PeerLink`] and the quality
//! monitor. Membership changes, mailbox deliveries and transport events are
//! applied one at a time, so link state machines never race each other.
//!
//! # Reconciliation
//!
//! After every membership change and on each ghost sweep the actor compares
//! the live roster against what it has announced:
//! 1. Members that stopped being live are torn down (link closed, buffered
//!    candidates and quality tracking dropped) and reported as left.
//! 2. Ghosts are handed to admission for a conditional eviction.
//! 3. Links still offering or answering after the negotiation timeout are
//!    dropped.
//! 4. Held offers from members that became live are answered.
//! 5. Live members without an open link get an offer, if we are the lower id.
//!
//! Links only exist towards live members, and only while our own record is
//! in the roster. Offers from senders that are not live yet are held until
//! they are, or until the negotiation timeout passes. A link closed by a
//! transport failure or a stalled negotiation is removed, so step 5 re-offers
//! on the next sweep.

use super::link::{should_offer, LinkState, PeerLink, TransportReaction};
use super::messages::{
    CloseReason, LeaveReason, LinkInfo, MemberSummary, MeshEvent, MeshMessage, MeshView,
    RemoteStream,
};
use super::metrics::MailboxMonitor;
use crate::admission::{Departure, RoomAdmission};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::errors::MeshError;
use crate::mailbox::SignalMailbox;
use crate::media::{LocalMedia, TrackKind};
use crate::observability::metrics;
use crate::presence::{is_ghost, Roster, RosterUpdate};
use crate::quality::{LinkSample, QualityMonitor, ReconnectChange};
use crate::store::MemberChange;
use crate::transport::{PeerTransport, TransportEvent, TransportEventKind};
use common::types::{MemberId, SignalEnvelope, SignalKind};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Coordinator mailbox size.
const MESH_CHANNEL_BUFFER: usize = 256;

/// Buffered `MeshEvent`s per subscriber before the oldest are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Candidates held per remote while no link exists.
const MAX_ORPHAN_CANDIDATES: usize = 64;

/// Senders whose offers may wait for their membership at once.
const MAX_HELD_OFFERS: usize = 16;

/// Handle to a `MeshActor`.
#[derive(Clone)]
pub struct MeshActorHandle {
    sender: mpsc::Sender<MeshMessage>,
    cancel_token: CancellationToken,
    local_id: MemberId,
    mailbox: Arc<MailboxMonitor>,
    view: watch::Receiver<MeshView>,
    events: broadcast::Sender<MeshEvent>,
}

impl MeshActorHandle {
    pub fn local_id(&self) -> &MemberId {
        &self.local_id
    }

    async fn send(&self, message: MeshMessage) -> Result<(), MeshError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| MeshError::SessionClosed)?;
        self.mailbox.record_enqueue();
        Ok(())
    }

    /// Deliver a change from the member subscription.
    pub async fn member_changed(&self, change: MemberChange) -> Result<(), MeshError> {
        self.send(MeshMessage::MemberChanged(change)).await
    }

    /// Deliver an envelope from one of our mailboxes.
    pub async fn signal_received(&self, envelope: SignalEnvelope) -> Result<(), MeshError> {
        self.send(MeshMessage::SignalReceived(envelope)).await
    }

    /// Report that our membership is gone for good.
    pub async fn evicted(&self) -> Result<(), MeshError> {
        self.send(MeshMessage::Evicted).await
    }

    async fn toggle(&self, kind: TrackKind) -> Result<bool, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(MeshMessage::ToggleMedia {
            kind,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| MeshError::SessionClosed)?
    }

    /// Flip the microphone. Returns whether it is now enabled.
    pub async fn toggle_mic(&self) -> Result<bool, MeshError> {
        self.toggle(TrackKind::Audio).await
    }

    /// Flip the camera. Returns whether it is now enabled.
    pub async fn toggle_video(&self) -> Result<bool, MeshError> {
        self.toggle(TrackKind::Video).await
    }

    /// Round-trip a fresh view through the actor.
    pub async fn get_state(&self) -> Result<MeshView, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(MeshMessage::GetState { respond_to: tx }).await?;
        rx.await.map_err(|_| MeshError::SessionClosed)
    }

    /// Watch the published view.
    pub fn view(&self) -> watch::Receiver<MeshView> {
        self.view.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Everything a `MeshActor` needs from its session.
pub struct MeshActorParams {
    pub local_id: MemberId,
    pub local_name: String,
    pub config: SessionConfig,
    pub admission: RoomAdmission,
    pub signals: SignalMailbox,
    pub transport: Arc<dyn PeerTransport>,
    pub media: LocalMedia,
    pub clock: Arc<dyn Clock>,
}

type EvictionOutcome = (MemberId, Result<Departure, MeshError>);

/// An offer that arrived before its sender (or we) were live members.
struct HeldOffer {
    envelope: SignalEnvelope,
    received_at: Instant,
}

/// The `MeshActor` implementation.
pub struct MeshActor {
    local_id: MemberId,
    local_name: String,
    config: SessionConfig,
    receiver: mpsc::Receiver<MeshMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
    admission: RoomAdmission,
    signals: SignalMailbox,
    transport: Arc<dyn PeerTransport>,
    media: LocalMedia,
    clock: Arc<dyn Clock>,
    roster: Roster,
    /// Remote members currently reported as live.
    announced: BTreeSet<MemberId>,
    links: BTreeMap<MemberId, PeerLink>,
    /// Candidates that arrived before any link to their sender existed.
    orphan_candidates: HashMap<MemberId, Vec<String>>,
    held_offers: HashMap<MemberId, HeldOffer>,
    next_generation: u64,
    quality: QualityMonitor,
    evicting: HashSet<MemberId>,
    evictions: JoinSet<EvictionOutcome>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    view_tx: watch::Sender<MeshView>,
    events_tx: broadcast::Sender<MeshEvent>,
    evicted: bool,
}

impl MeshActor {
    /// Spawn the coordinator. Returns its handle and the task join handle.
    pub fn spawn(
        params: MeshActorParams,
        cancel_token: CancellationToken,
    ) -> (MeshActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(MESH_CHANNEL_BUFFER);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mailbox = Arc::new(MailboxMonitor::new(params.local_id.as_str()));

        let quality = QualityMonitor::new(params.config.quality, params.config.connected_notice);
        let mut actor = Self {
            local_id: params.local_id.clone(),
            local_name: params.local_name,
            config: params.config,
            receiver,
            cancel_token: cancel_token.clone(),
            mailbox: Arc::clone(&mailbox),
            admission: params.admission,
            signals: params.signals,
            transport: params.transport,
            media: params.media,
            clock: params.clock,
            roster: Roster::new(),
            announced: BTreeSet::new(),
            links: BTreeMap::new(),
            orphan_candidates: HashMap::new(),
            held_offers: HashMap::new(),
            next_generation: 0,
            quality,
            evicting: HashSet::new(),
            evictions: JoinSet::new(),
            transport_tx,
            transport_rx,
            view_tx: watch::Sender::new(MeshView::new(params.local_id.clone())),
            events_tx: events_tx.clone(),
            evicted: false,
        };
        let initial = actor.build_view();
        actor.view_tx.send_replace(initial);
        let view = actor.view_tx.subscribe();

        let task_handle = tokio::spawn(actor.run());

        let handle = MeshActorHandle {
            sender,
            cancel_token,
            local_id: params.local_id,
            mailbox,
            view,
            events: events_tx,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "mesh.actor.mesh", fields(local_id = %self.local_id))]
    async fn run(mut self) {
        info!(target: "mesh.actor.mesh", local_id = %self.local_id, "MeshActor started");

        let mut ghost_sweep = tokio::time::interval(self.config.ghost_sweep_interval);
        ghost_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sampling = tokio::time::interval(self.config.sample_interval);
        sampling.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let notice_deadline = self.quality.notice_deadline();

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "mesh.actor.mesh",
                        local_id = %self.local_id,
                        "MeshActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = ghost_sweep.tick() => {
                    self.reconcile().await;
                }

                _ = sampling.tick() => {
                    self.sample_links().await;
                }

                () = wait_until(notice_deadline) => {
                    if self.quality.expire_notice(Instant::now()) {
                        self.publish_view();
                    }
                }

                Some(event) = self.transport_rx.recv() => {
                    self.handle_transport_event(event).await;
                }

                Some(outcome) = self.evictions.join_next(), if !self.evictions.is_empty() => {
                    self.eviction_finished(outcome);
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_dequeue();
                            self.handle_message(message).await;
                        }
                        None => {
                            info!(
                                target: "mesh.actor.mesh",
                                local_id = %self.local_id,
                                "MeshActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "mesh.actor.mesh",
            local_id = %self.local_id,
            messages_processed = self.mailbox.messages_processed(),
            "MeshActor stopped"
        );
    }

    async fn handle_message(&mut self, message: MeshMessage) {
        debug!(target: "mesh.actor.mesh", message = message.label(), "Handling message");
        match message {
            MeshMessage::MemberChanged(change) => self.handle_member_change(&change).await,
            MeshMessage::SignalReceived(envelope) => self.handle_signal(envelope).await,
            MeshMessage::Evicted => self.handle_evicted().await,
            MeshMessage::ToggleMedia { kind, respond_to } => {
                let result = if self.media.has_kind(kind) {
                    Ok(self.media.toggle(kind))
                } else {
                    Err(MeshError::MediaUnavailable(format!(
                        "no local {} track",
                        kind.as_str()
                    )))
                };
                self.publish_view();
                let _ = respond_to.send(result);
            }
            MeshMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.build_view());
            }
        }
    }

    async fn handle_member_change(&mut self, change: &MemberChange) {
        let own = change.member_id() == &self.local_id;
        match self.roster.apply(change) {
            RosterUpdate::Unchanged => return,
            RosterUpdate::Left if own => {
                warn!(
                    target: "mesh.actor.mesh",
                    local_id = %self.local_id,
                    "Own membership record removed, closing links until rejoined"
                );
            }
            RosterUpdate::Joined if own => {
                info!(target: "mesh.actor.mesh", local_id = %self.local_id, "Own membership record present");
            }
            _ => {}
        }
        self.reconcile().await;
    }

    /// Whether our own record is in the roster.
    fn is_member(&self) -> bool {
        self.roster.get(&self.local_id).is_some()
    }

    /// Bring links and announcements in line with the live roster.
    async fn reconcile(&mut self) {
        let now = self.clock.now();
        let ghost_timeout = self.config.ghost_timeout;
        let live: BTreeSet<MemberId> = self
            .roster
            .live(now, ghost_timeout)
            .into_iter()
            .map(|record| record.id.clone())
            .filter(|id| id != &self.local_id)
            .collect();

        let departed: Vec<MemberId> = self.announced.difference(&live).cloned().collect();
        for remote_id in departed {
            let reason = match self.roster.get(&remote_id) {
                Some(record) if is_ghost(record, now, ghost_timeout) => LeaveReason::Ghost,
                _ => LeaveReason::Departed,
            };
            self.announced.remove(&remote_id);
            let close_reason = match reason {
                LeaveReason::Ghost => CloseReason::Ghost,
                LeaveReason::Departed => CloseReason::Departed,
            };
            self.teardown(&remote_id, close_reason).await;
            info!(
                target: "mesh.actor.mesh",
                remote_id = %remote_id,
                reason = ?reason,
                "Member left"
            );
            self.emit(MeshEvent::MemberLeft {
                member_id: remote_id,
                reason,
            });
        }

        let member = self.is_member();
        let stray: Vec<MemberId> = self
            .links
            .keys()
            .filter(|id| !member || !live.contains(*id))
            .cloned()
            .collect();
        let stray_reason = if member {
            CloseReason::Ghost
        } else {
            CloseReason::Removed
        };
        for remote_id in stray {
            self.teardown(&remote_id, stray_reason).await;
        }

        let negotiation_timeout = self.config.negotiation_timeout;
        let started = Instant::now();
        let stalled: Vec<MemberId> = self
            .links
            .values()
            .filter(|link| link.negotiation_stalled(started, negotiation_timeout))
            .map(|link| link.remote_id().clone())
            .collect();
        for remote_id in stalled {
            warn!(
                target: "mesh.actor.mesh",
                remote_id = %remote_id,
                timeout_ms = u64::try_from(negotiation_timeout.as_millis()).unwrap_or(u64::MAX),
                "Negotiation stalled, dropping link"
            );
            self.teardown_link(&remote_id, CloseReason::NegotiationFailed)
                .await;
        }

        for remote_id in &live {
            if self.announced.insert(remote_id.clone()) {
                if let Some(member) = self.roster.get(remote_id).cloned() {
                    info!(target: "mesh.actor.mesh", remote_id = %remote_id, "Member joined");
                    self.emit(MeshEvent::MemberJoined { member });
                }
            }
        }

        for ghost in self.roster.ghosts(now, ghost_timeout) {
            if ghost != self.local_id && self.evicting.insert(ghost.clone()) {
                metrics::record_ghost_detected();
                self.spawn_eviction(ghost);
            }
        }

        self.held_offers.retain(|sender, held| {
            let keep = started.saturating_duration_since(held.received_at) < negotiation_timeout;
            if !keep {
                debug!(target: "mesh.actor.mesh", remote_id = %sender, "Held offer expired");
            }
            keep
        });

        if member && !self.evicted {
            let ready: Vec<MemberId> = self
                .held_offers
                .keys()
                .filter(|sender| live.contains(*sender))
                .cloned()
                .collect();
            for sender in ready {
                if let Some(held) = self.held_offers.remove(&sender) {
                    debug!(target: "mesh.actor.mesh", remote_id = %sender, "Answering held offer");
                    self.answer_offer(&held.envelope).await;
                }
            }

            for remote_id in &live {
                if should_offer(&self.local_id, remote_id) && !self.links.contains_key(remote_id) {
                    self.open_offer(remote_id).await;
                }
            }
        }

        self.publish_view();
    }

    fn spawn_eviction(&mut self, ghost: MemberId) {
        debug!(target: "mesh.actor.mesh", remote_id = %ghost, "Evicting ghost");
        let admission = self.admission.clone();
        let ghost_timeout = self.config.ghost_timeout;
        self.evictions.spawn(async move {
            let result = admission.evict_ghost(&ghost, ghost_timeout).await;
            (ghost, result)
        });
    }

    fn eviction_finished(&mut self, outcome: Result<EvictionOutcome, tokio::task::JoinError>) {
        match outcome {
            Ok((ghost, result)) => {
                self.evicting.remove(&ghost);
                if let Err(e) = result {
                    warn!(target: "mesh.actor.mesh", remote_id = %ghost, error = %e, "Ghost eviction failed");
                }
            }
            Err(e) => {
                // The id is lost with the task; the next sweep retries everyone
                warn!(target: "mesh.actor.mesh", error = %e, "Ghost eviction task failed");
                self.evicting.clear();
            }
        }
    }

    fn allocate_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    async fn connect(&mut self, remote_id: &MemberId) -> Option<PeerLink> {
        let generation = self.allocate_generation();
        match self
            .transport
            .connect(&self.local_id, remote_id, generation, self.transport_tx.clone())
            .await
        {
            Ok(connection) => Some(PeerLink::new(remote_id.clone(), generation, connection)),
            Err(e) => {
                warn!(target: "mesh.actor.mesh", remote_id = %remote_id, error = %e, "Peer connection failed");
                None
            }
        }
    }

    /// `Idle → Offering` for a remote we are designated to call.
    async fn open_offer(&mut self, remote_id: &MemberId) {
        let Some(mut link) = self.connect(remote_id).await else {
            return;
        };
        // Nothing can be addressed to a link that did not exist yet
        self.orphan_candidates.remove(remote_id);

        let sdp = match link.start_offer(self.media.tracks()).await {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!(target: "mesh.actor.mesh", remote_id = %remote_id, error = %e, "Offer creation failed");
                link.close().await;
                return;
            }
        };

        let envelope = SignalEnvelope::offer(self.local_id.clone(), &self.local_name, sdp);
        if let Err(e) = self.signals.send(remote_id, envelope).await {
            // Dropping the link lets the next presence change re-offer
            warn!(target: "mesh.actor.mesh", remote_id = %remote_id, error = %e, "Offer not delivered");
            link.close().await;
            return;
        }

        info!(
            target: "mesh.actor.mesh",
            remote_id = %remote_id,
            generation = link.generation(),
            "Offer sent"
        );
        self.links.insert(remote_id.clone(), link);
    }

    async fn handle_signal(&mut self, envelope: SignalEnvelope) {
        if self.signals.already_consumed(&envelope.id) {
            debug!(
                target: "mesh.actor.mesh",
                envelope_id = %envelope.id,
                kind = envelope.kind.as_str(),
                "Duplicate envelope ignored"
            );
            self.signals.discard_duplicate(&envelope).await;
            return;
        }

        match envelope.kind {
            SignalKind::Offer => self.handle_offer(&envelope).await,
            SignalKind::Answer => self.handle_answer(&envelope).await,
            SignalKind::Candidate => self.handle_candidate(&envelope).await,
        }

        if let Err(e) = self.signals.acknowledge(&envelope).await {
            warn!(target: "mesh.actor.mesh", error = %e, "Envelope acknowledgement failed");
        }
        self.publish_view();
    }

    /// Answer an offer now, or hold it until both ends are live members.
    async fn handle_offer(&mut self, envelope: &SignalEnvelope) {
        let remote_id = &envelope.sender_id;

        if self.evicted || !should_offer(remote_id, &self.local_id) {
            debug!(target: "mesh.actor.mesh", remote_id = %remote_id, "Offer ignored");
            return;
        }
        let now = self.clock.now();
        let ghost_timeout = self.config.ghost_timeout;
        if self
            .roster
            .get(remote_id)
            .is_some_and(|record| is_ghost(record, now, ghost_timeout))
        {
            debug!(target: "mesh.actor.mesh", remote_id = %remote_id, "Offer from ghost ignored");
            return;
        }

        if self.is_member() && self.roster.is_live(remote_id, now, ghost_timeout) {
            self.held_offers.remove(remote_id);
            self.answer_offer(envelope).await;
            return;
        }

        if self.held_offers.len() >= MAX_HELD_OFFERS && !self.held_offers.contains_key(remote_id) {
            debug!(target: "mesh.actor.mesh", remote_id = %remote_id, "Held offer buffer full");
            return;
        }
        debug!(target: "mesh.actor.mesh", remote_id = %remote_id, "Offer held until sender is live");
        self.held_offers.insert(
            remote_id.clone(),
            HeldOffer {
                envelope: envelope.clone(),
                received_at: Instant::now(),
            },
        );
    }

    /// `Idle → Answering`, replacing any link from an earlier offer.
    async fn answer_offer(&mut self, envelope: &SignalEnvelope) {
        let remote_id = envelope.sender_id.clone();

        if let Some(existing) = self.links.get(&remote_id) {
            if existing.answered_offer_id() == Some(envelope.id.as_str()) {
                return;
            }
            info!(
                target: "mesh.actor.mesh",
                remote_id = %remote_id,
                "Fresh offer from connected member, replacing link"
            );
            self.teardown_link(&remote_id, CloseReason::Replaced).await;
        }

        let Some(mut link) = self.connect(&remote_id).await else {
            return;
        };
        for candidate in self.orphan_candidates.remove(&remote_id).unwrap_or_default() {
            link.add_remote_candidate(candidate).await;
        }

        let answer = match link
            .accept_offer(&envelope.id, &envelope.payload, self.media.tracks())
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!(target: "mesh.actor.mesh", remote_id = %remote_id, error = %e, "Answer creation failed");
                link.close().await;
                self.emit(MeshEvent::LinkClosed {
                    remote_id,
                    reason: CloseReason::NegotiationFailed,
                });
                return;
            }
        };

        let generation = link.generation();
        self.links.insert(remote_id.clone(), link);

        let reply = SignalEnvelope::answer(self.local_id.clone(), answer);
        match self.signals.send(&remote_id, reply).await {
            Ok(()) => {
                info!(target: "mesh.actor.mesh", remote_id = %remote_id, generation, "Answer sent");
            }
            Err(e) => {
                // The offerer's negotiation timeout brings a fresh offer
                warn!(target: "mesh.actor.mesh", remote_id = %remote_id, error = %e, "Answer not delivered");
                self.teardown_link(&remote_id, CloseReason::NegotiationFailed)
                    .await;
            }
        }
    }

    async fn handle_answer(&mut self, envelope: &SignalEnvelope) {
        let remote_id = &envelope.sender_id;
        let Some(link) = self.links.get_mut(remote_id) else {
            debug!(target: "mesh.actor.mesh", remote_id = %remote_id, "Answer without link ignored");
            return;
        };

        match link.apply_answer(&envelope.payload).await {
            Ok(true) => {
                debug!(target: "mesh.actor.mesh", remote_id = %remote_id, "Answer applied");
            }
            Ok(false) => {
                debug!(
                    target: "mesh.actor.mesh",
                    remote_id = %remote_id,
                    state = link.state().as_str(),
                    "Answer ignored"
                );
            }
            Err(e) => {
                warn!(target: "mesh.actor.mesh", remote_id = %remote_id, error = %e, "Answer rejected");
                let remote_id = remote_id.clone();
                self.teardown_link(&remote_id, CloseReason::NegotiationFailed)
                    .await;
            }
        }
    }

    async fn handle_candidate(&mut self, envelope: &SignalEnvelope) {
        let remote_id = &envelope.sender_id;
        if let Some(link) = self.links.get_mut(remote_id) {
            link.add_remote_candidate(envelope.payload.clone()).await;
            return;
        }

        let pending = self.orphan_candidates.entry(remote_id.clone()).or_default();
        if pending.len() < MAX_ORPHAN_CANDIDATES {
            pending.push(envelope.payload.clone());
        } else {
            debug!(target: "mesh.actor.mesh", remote_id = %remote_id, "Orphan candidate buffer full");
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        let remote_id = event.remote_id;
        let Some(link) = self.links.get_mut(&remote_id) else {
            return;
        };
        if link.generation() != event.generation {
            debug!(
                target: "mesh.actor.mesh",
                remote_id = %remote_id,
                event_generation = event.generation,
                link_generation = link.generation(),
                "Stale transport event dropped"
            );
            return;
        }

        match event.kind {
            TransportEventKind::LocalCandidate(candidate) => {
                let envelope = SignalEnvelope::candidate(self.local_id.clone(), candidate);
                if let Err(e) = self.signals.send(&remote_id, envelope).await {
                    warn!(target: "mesh.actor.mesh", remote_id = %remote_id, error = %e, "Candidate not delivered");
                }
                return;
            }
            TransportEventKind::RemoteTrack(track) => {
                link.on_remote_track(track);
                let announcement = link.take_stream_announcement();
                self.announce_stream(announcement);
            }
            TransportEventKind::StateChanged(state) => {
                let previous = link.state();
                match link.on_transport_state(state) {
                    TransportReaction::Unchanged => return,
                    TransportReaction::Entered(entered) => {
                        if entered == LinkState::Reconnecting {
                            let e = MeshError::TransientLinkFailure(format!(
                                "transport {}",
                                state.as_str()
                            ));
                            warn!(target: "mesh.actor.mesh", remote_id = %remote_id, error = %e, "Link reconnecting");
                        }
                        let announcement = link.take_stream_announcement();
                        self.announce_stream(announcement);
                        let recovered =
                            previous == LinkState::Reconnecting && entered == LinkState::Connected;
                        self.update_reconnecting(recovered);
                    }
                    TransportReaction::MustClose => {
                        warn!(
                            target: "mesh.actor.mesh",
                            remote_id = %remote_id,
                            state = state.as_str(),
                            "Transport failed, closing link"
                        );
                        self.teardown(&remote_id, CloseReason::TransportFailed).await;
                    }
                }
            }
        }
        self.publish_view();
    }

    fn announce_stream(&mut self, announcement: Option<RemoteStream>) {
        if let Some(stream) = announcement {
            info!(
                target: "mesh.actor.mesh",
                remote_id = %stream.remote_id,
                tracks = stream.tracks.len(),
                "Remote stream added"
            );
            self.emit(MeshEvent::StreamAdded {
                remote_id: stream.remote_id.clone(),
                stream,
            });
        }
    }

    fn update_reconnecting(&mut self, recovered: bool) {
        let transient = self
            .links
            .values()
            .filter(|link| link.state() == LinkState::Reconnecting)
            .count();
        match self
            .quality
            .update_reconnecting(transient, recovered, Instant::now())
        {
            Some(ReconnectChange::Raised) => {
                info!(target: "mesh.actor.mesh", transient, "Mesh reconnecting");
                metrics::set_reconnecting(true);
            }
            Some(ReconnectChange::Cleared) => {
                info!(target: "mesh.actor.mesh", "Mesh connected again");
                metrics::set_reconnecting(false);
            }
            Some(ReconnectChange::Dropped) => {
                info!(target: "mesh.actor.mesh", "Reconnecting links closed");
                metrics::set_reconnecting(false);
            }
            None => {}
        }
    }

    /// Close and remove one link without touching anything else.
    async fn teardown_link(&mut self, remote_id: &MemberId, reason: CloseReason) {
        if let Some(mut link) = self.links.remove(remote_id) {
            if link.close().await {
                info!(
                    target: "mesh.actor.mesh",
                    remote_id = %remote_id,
                    generation = link.generation(),
                    reason = reason.as_str(),
                    "Link closed"
                );
                self.emit(MeshEvent::LinkClosed {
                    remote_id: remote_id.clone(),
                    reason,
                });
            }
        }
        self.quality.forget(remote_id);
        self.update_reconnecting(false);
    }

    /// Close the link and drop every trace of `remote_id`.
    async fn teardown(&mut self, remote_id: &MemberId, reason: CloseReason) {
        self.teardown_link(remote_id, reason).await;
        self.orphan_candidates.remove(remote_id);
    }

    async fn sample_links(&mut self) {
        let mut samples = Vec::with_capacity(self.links.len());
        for link in self.links.values().filter(|link| link.is_sampleable()) {
            match link.stats().await {
                Ok(stats) => samples.push(LinkSample {
                    remote_id: link.remote_id().clone(),
                    packet_loss: stats.packet_loss,
                    audio_energy: stats.audio_energy,
                }),
                Err(e) => {
                    debug!(target: "mesh.quality", remote_id = %link.remote_id(), error = %e, "Stats unavailable");
                }
            }
        }
        if samples.is_empty() {
            return;
        }
        if self.quality.record(&samples) {
            self.publish_view();
        }
    }

    async fn handle_evicted(&mut self) {
        if self.evicted {
            return;
        }
        self.evicted = true;
        warn!(target: "mesh.actor.mesh", local_id = %self.local_id, "Evicted from room");
        self.held_offers.clear();
        self.close_all(CloseReason::Shutdown).await;
        self.emit(MeshEvent::Evicted);
        self.publish_view();
    }

    async fn close_all(&mut self, reason: CloseReason) {
        let remotes: Vec<MemberId> = self.links.keys().cloned().collect();
        for remote_id in remotes {
            self.teardown(&remote_id, reason).await;
        }
    }

    fn emit(&self, event: MeshEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn build_view(&self) -> MeshView {
        let live = self
            .roster
            .live(self.clock.now(), self.config.ghost_timeout);
        MeshView {
            local_id: self.local_id.clone(),
            members: live
                .iter()
                .map(|record| MemberSummary {
                    id: record.id.clone(),
                    name: record.name.clone(),
                })
                .collect(),
            online_count: live.len(),
            links: self
                .links
                .values()
                .map(|link| LinkInfo {
                    remote_id: link.remote_id().clone(),
                    state: link.state(),
                    generation: link.generation(),
                })
                .collect(),
            streams: self
                .links
                .values()
                .filter(|link| link.is_sampleable() && !link.remote_tracks().is_empty())
                .map(|link| RemoteStream {
                    remote_id: link.remote_id().clone(),
                    tracks: link.remote_tracks().to_vec(),
                })
                .collect(),
            quality: self.quality.tiers().clone(),
            active_speaker: self.quality.active_speaker().cloned(),
            reconnecting: self.quality.is_reconnecting(),
            connected_notice: self.quality.connected_notice(),
            mic_enabled: self.media.is_enabled(TrackKind::Audio),
            video_enabled: self.media.is_enabled(TrackKind::Video),
            evicted: self.evicted,
        }
    }

    fn publish_view(&self) {
        let view = self.build_view();
        metrics::set_links_active(view.links.len());
        metrics::set_members_online(view.online_count);
        self.view_tx.send_replace(view);
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "mesh.actor.mesh",
            local_id = %self.local_id,
            links = self.links.len(),
            "Performing graceful shutdown"
        );
        self.close_all(CloseReason::Shutdown).await;
        self.evictions.abort_all();
        self.publish_view();
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
