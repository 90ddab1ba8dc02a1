//! Fixtures for multi-member tests.
//!
//! Every member of a [`TestRoom`] shares one store, one loopback network and
//! one [`TokioClock`], so paused-time tests see a single notion of "now".

use crate::flaky_store::FlakyStore;
use crate::loopback::LoopbackNetwork;
use crate::mock_capture::MockCapture;
use common::types::MemberId;
use mesh_node::actors::{MeshEvent, MeshView};
use mesh_node::clock::TokioClock;
use mesh_node::config::SessionConfig;
use mesh_node::errors::MeshError;
use mesh_node::media::MediaCapture;
use mesh_node::session::{MeetingSession, SessionDeps, SessionIdentity};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Upper bound for any wait in tests; generous because time is usually paused.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Session timings scaled down, keeping the default `G / H` ratio.
#[must_use]
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        heartbeat_interval: Duration::from_millis(500),
        ghost_timeout: Duration::from_millis(1_200),
        ghost_sweep_interval: Duration::from_millis(250),
        sample_interval: Duration::from_millis(100),
        negotiation_timeout: Duration::from_millis(1_000),
        connected_notice: Duration::from_millis(300),
        ..SessionConfig::default()
    }
}

#[must_use]
pub fn shared_clock() -> Arc<TokioClock> {
    Arc::new(TokioClock::new())
}

#[must_use]
pub fn identity(id: &str) -> SessionIdentity {
    let mut name = id.to_string();
    if let Some(first) = name.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    SessionIdentity::new(MemberId::from(id), name)
}

/// One room: shared store, network and clock.
#[derive(Clone)]
pub struct TestRoom {
    pub store: FlakyStore,
    pub network: LoopbackNetwork,
    pub clock: Arc<TokioClock>,
    pub config: SessionConfig,
}

impl Default for TestRoom {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRoom {
    /// Must be called inside a runtime; the clock anchors to tokio time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: FlakyStore::new(),
            network: LoopbackNetwork::new(),
            clock: shared_clock(),
            config: fast_config(),
        }
    }

    #[must_use]
    pub fn deps(&self, capture: Arc<dyn MediaCapture>) -> SessionDeps {
        SessionDeps {
            store: self.store.shared(),
            transport: self.network.transport(),
            capture,
            clock: self.clock.clone(),
        }
    }

    /// Join with audio and video available.
    pub async fn join(&self, id: &str) -> Result<MeetingSession, MeshError> {
        self.join_with(id, Arc::new(MockCapture::available())).await
    }

    pub async fn join_with(
        &self,
        id: &str,
        capture: Arc<dyn MediaCapture>,
    ) -> Result<MeetingSession, MeshError> {
        MeetingSession::join(identity(id), self.config.clone(), self.deps(capture)).await
    }
}

/// Wait until the view satisfies `predicate` and return it.
///
/// # Panics
///
/// Panics after [`WAIT_TIMEOUT`] or if the session closed.
pub async fn wait_for_view<F>(view: &mut watch::Receiver<MeshView>, mut predicate: F) -> MeshView
where
    F: FnMut(&MeshView) -> bool,
{
    let current = tokio::time::timeout(WAIT_TIMEOUT, view.wait_for(|v| predicate(v)))
        .await
        .expect("timed out waiting for view")
        .expect("session closed while waiting for view");
    current.clone()
}

/// Wait for the first event matching `predicate`, skipping others.
///
/// # Panics
///
/// Panics after [`WAIT_TIMEOUT`] or if the event stream closed.
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<MeshEvent>, mut predicate: F) -> MeshEvent
where
    F: FnMut(&MeshEvent) -> bool,
{
    tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
