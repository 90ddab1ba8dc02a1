//! Session lifecycle.
//!
//! A [`MeetingSession`] is everything one participant owns while in the
//! room: its admission, the coordinator, the heartbeat and the forwarders
//! feeding the coordinator. It is created by [`MeetingSession::join`] and
//! ends with [`MeetingSession::leave`] (or, best effort, on drop).

use crate::actors::{MeshActor, MeshActorHandle, MeshActorParams, MeshEvent, MeshView};
use crate::admission::{Departure, RoomAdmission};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::errors::MeshError;
use crate::mailbox::{spawn_forwarder, subscribe_all, SignalMailbox};
use crate::media::{LocalMedia, MediaCapture};
use crate::presence::Heartbeat;
use crate::store::{MemberChange, SharedStore};
use crate::transport::PeerTransport;
use common::types::{MemberId, SignalEnvelope, SignalKind};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Who is joining.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub member_id: MemberId,
    pub display_name: String,
}

impl SessionIdentity {
    pub fn new(member_id: MemberId, display_name: impl Into<String>) -> Self {
        Self {
            member_id,
            display_name: display_name.into(),
        }
    }
}

/// External collaborators of a session.
#[derive(Clone)]
pub struct SessionDeps {
    pub store: SharedStore,
    pub transport: Arc<dyn PeerTransport>,
    pub capture: Arc<dyn MediaCapture>,
    pub clock: Arc<dyn Clock>,
}

/// One participant's presence in the room.
pub struct MeetingSession {
    identity: SessionIdentity,
    admission: RoomAdmission,
    admitted_count: u32,
    cancel_token: CancellationToken,
    mesh: MeshActorHandle,
    actor_task: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    media: LocalMedia,
    media_error: Option<MeshError>,
    left: bool,
}

impl MeetingSession {
    /// Join the room and start coordinating.
    ///
    /// # Errors
    ///
    /// - `MeshError::Config` if `config` is invalid
    /// - `MeshError::CapacityExceeded` if the room is full
    /// - store errors while opening subscriptions (admission is rolled back)
    ///
    /// Media failures do not fail the join; see [`media_error`](Self::media_error).
    #[instrument(skip_all, name = "mesh.session.join", fields(member_id = %identity.member_id))]
    pub async fn join(
        identity: SessionIdentity,
        config: SessionConfig,
        deps: SessionDeps,
    ) -> Result<Self, MeshError> {
        config
            .validate()
            .map_err(|e| MeshError::Config(e.to_string()))?;

        let admission = RoomAdmission::new(
            Arc::clone(&deps.store),
            config.room_capacity,
            config.admission_retry,
            Arc::clone(&deps.clock),
        );
        let admitted_count = admission
            .join(&identity.member_id, &identity.display_name)
            .await?
            .count();

        let (media, media_error) = match deps.capture.acquire().await {
            Ok(media) => (media, None),
            Err(e) => {
                warn!(
                    target: "mesh.session",
                    member_id = %identity.member_id,
                    error = %e,
                    "Media unavailable, joining without local tracks"
                );
                (LocalMedia::empty(), Some(e))
            }
        };

        let subscriptions = match open_subscriptions(&deps.store, &identity.member_id).await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                warn!(target: "mesh.session", error = %e, "Subscriptions failed, leaving room");
                media.release();
                if let Err(leave_err) = admission.leave(&identity.member_id).await {
                    warn!(target: "mesh.session", error = %leave_err, "Rollback leave failed");
                }
                return Err(e);
            }
        };
        let (members, mailboxes) = subscriptions;

        let cancel_token = CancellationToken::new();
        let (mesh, actor_task) = MeshActor::spawn(
            MeshActorParams {
                local_id: identity.member_id.clone(),
                local_name: identity.display_name.clone(),
                config: config.clone(),
                admission: admission.clone(),
                signals: SignalMailbox::new(
                    Arc::clone(&deps.store),
                    identity.member_id.clone(),
                    config.signal_retry,
                ),
                transport: Arc::clone(&deps.transport),
                media: media.clone(),
                clock: Arc::clone(&deps.clock),
            },
            cancel_token.child_token(),
        );

        let mut tasks = Vec::with_capacity(5);
        tasks.push(spawn_member_forwarder(
            members,
            mesh.clone(),
            cancel_token.child_token(),
        ));
        for (kind, envelopes) in mailboxes {
            tasks.push(spawn_forwarder(
                kind,
                envelopes,
                mesh.clone(),
                cancel_token.child_token(),
            ));
        }
        tasks.push(
            Heartbeat::new(
                Arc::clone(&deps.store),
                admission.clone(),
                identity.member_id.clone(),
                identity.display_name.clone(),
                config.heartbeat_interval,
                Arc::clone(&deps.clock),
            )
            .spawn(cancel_token.child_token(), mesh.clone()),
        );

        info!(
            target: "mesh.session",
            member_id = %identity.member_id,
            count = admitted_count,
            capacity = config.room_capacity,
            local_tracks = media.tracks().len(),
            "Joined room"
        );

        Ok(Self {
            identity,
            admission,
            admitted_count,
            cancel_token,
            mesh,
            actor_task: Some(actor_task),
            tasks,
            media,
            media_error,
            left: false,
        })
    }

    pub fn member_id(&self) -> &MemberId {
        &self.identity.member_id
    }

    /// Room count right after our admission.
    pub fn admitted_count(&self) -> u32 {
        self.admitted_count
    }

    /// Watch the derived session state.
    pub fn view(&self) -> watch::Receiver<MeshView> {
        self.mesh.view()
    }

    /// Subscribe to roster and link events.
    pub fn events(&self) -> broadcast::Receiver<MeshEvent> {
        self.mesh.subscribe_events()
    }

    /// The capture failure, if the session joined without local media.
    pub fn media_error(&self) -> Option<&MeshError> {
        self.media_error.as_ref()
    }

    /// Round-trip a fresh view through the coordinator.
    pub async fn state(&self) -> Result<MeshView, MeshError> {
        self.mesh.get_state().await
    }

    /// # Errors
    ///
    /// `MeshError::MediaUnavailable` if there is no local audio track.
    pub async fn toggle_mic(&self) -> Result<bool, MeshError> {
        self.mesh.toggle_mic().await
    }

    /// # Errors
    ///
    /// `MeshError::MediaUnavailable` if there is no local video track.
    pub async fn toggle_video(&self) -> Result<bool, MeshError> {
        self.mesh.toggle_video().await
    }

    /// Leave the room: stop every task, close every link, release media,
    /// then give up our slot.
    #[instrument(skip_all, name = "mesh.session.leave", fields(member_id = %self.identity.member_id))]
    pub async fn leave(mut self) -> Result<Departure, MeshError> {
        self.left = true;
        self.cancel_token.cancel();

        if let Some(actor_task) = self.actor_task.take() {
            if let Err(e) = actor_task.await {
                warn!(target: "mesh.session", error = %e, "Coordinator task failed");
            }
        }
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                debug!(target: "mesh.session", error = %e, "Session task failed");
            }
        }

        self.media.release();
        let departure = self.admission.leave(&self.identity.member_id).await?;
        info!(
            target: "mesh.session",
            member_id = %self.identity.member_id,
            departure = ?departure,
            "Left room"
        );
        Ok(departure)
    }
}

impl Drop for MeetingSession {
    fn drop(&mut self) {
        if self.left {
            return;
        }
        self.cancel_token.cancel();
        self.media.release();

        // Without a runtime the record ages out through ghost eviction
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let admission = self.admission.clone();
            let member_id = self.identity.member_id.clone();
            runtime.spawn(async move {
                if let Err(e) = admission.leave(&member_id).await {
                    warn!(target: "mesh.session", member_id = %member_id, error = %e, "Leave on drop failed");
                }
            });
        }
    }
}

type Subscriptions = (
    mpsc::UnboundedReceiver<MemberChange>,
    Vec<(SignalKind, mpsc::UnboundedReceiver<SignalEnvelope>)>,
);

async fn open_subscriptions(
    store: &SharedStore,
    member_id: &MemberId,
) -> Result<Subscriptions, MeshError> {
    let members = store.subscribe_members().await?;
    let mailboxes = subscribe_all(store, member_id).await?;
    Ok((members, mailboxes))
}

fn spawn_member_forwarder(
    mut changes: mpsc::UnboundedReceiver<MemberChange>,
    mesh: MeshActorHandle,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                change = changes.recv() => {
                    let Some(change) = change else {
                        warn!(target: "mesh.session", "Member subscription ended");
                        break;
                    };
                    if mesh.member_changed(change).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(target: "mesh.session", "Member forwarder stopped");
    })
}
