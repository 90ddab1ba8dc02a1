//! Huddle Mesh node
//!
//! Headless participant: joins the room, keeps its membership alive, links
//! to every other member and logs roster, speaker and quality changes.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect to the document store (Redis)
//! 4. Join the room (exits with an error if it is full)
//! 5. Start health HTTP server (liveness, readiness, status, metrics)
//! 6. Log view changes until a shutdown signal arrives
//! 7. Leave the room

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use common::secret::ExposeSecret;
use mesh_node::actors::{MeshEvent, MeshView};
use mesh_node::clock::SystemClock;
use mesh_node::config::Config;
use mesh_node::media::SyntheticCapture;
use mesh_node::observability::{health_router, init_metrics_recorder, HealthState};
use mesh_node::session::{MeetingSession, SessionDeps, SessionIdentity};
use mesh_node::store::RedisStore;
use mesh_node::transport::WebRtcTransport;
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh_node=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting mesh node");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        room_id = %config.room_id,
        member_id = %config.member_id,
        capacity = config.session.room_capacity,
        heartbeat_interval_ms = u64::try_from(config.session.heartbeat_interval.as_millis()).unwrap_or(u64::MAX),
        ghost_timeout_ms = u64::try_from(config.session.ghost_timeout.as_millis()).unwrap_or(u64::MAX),
        ghost_margin = config.session.ghost_margin(),
        health_bind_address = %config.health_bind_address,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());

    info!("Connecting to Redis...");
    let store = RedisStore::connect(config.redis_url.expose_secret(), &config.room_id)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to Redis");
            e
        })?;
    info!("Redis connection established");

    let deps = SessionDeps {
        store: Arc::new(store),
        transport: Arc::new(WebRtcTransport::new(config.ice_servers.clone())),
        capture: Arc::new(SyntheticCapture::new(
            config.audio_enabled,
            config.video_enabled,
        )),
        clock: Arc::new(SystemClock),
    };

    let session = MeetingSession::join(
        SessionIdentity::new(config.member_id.clone(), config.display_name.clone()),
        config.session.clone(),
        deps,
    )
    .await
    .map_err(|e| {
        if e.is_capacity_exceeded() {
            error!(error = %e, notice = %e.client_message(), "Room is full");
        } else {
            error!(
                error = %e,
                notice = %e.client_message(),
                retryable = e.is_retryable(),
                "Failed to join room"
            );
        }
        e
    })?;
    if let Some(e) = session.media_error() {
        warn!(error = %e, notice = %e.client_message(), "Running without local media");
    }
    health_state.set_ready();

    let shutdown_token = CancellationToken::new();

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let app = health_router(Arc::clone(&health_state), session.view())
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    let reporter = tokio::spawn(report_changes(
        session.view(),
        session.events(),
        Arc::clone(&health_state),
        shutdown_token.child_token(),
    ));

    info!("Mesh node running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, leaving room...");
    health_state.set_not_ready();
    shutdown_token.cancel();
    if let Err(e) = reporter.await {
        warn!(error = %e, "Reporter task failed");
    }

    match session.leave().await {
        Ok(departure) => info!(departure = ?departure, "Left room"),
        Err(e) => warn!(error = %e, "Leave failed; record will age out"),
    }

    info!("Mesh node shutdown complete");
    Ok(())
}

/// Log roster, speaker and quality changes until cancelled.
async fn report_changes(
    mut view: watch::Receiver<MeshView>,
    mut events: broadcast::Receiver<MeshEvent>,
    health_state: Arc<HealthState>,
    cancel_token: CancellationToken,
) {
    let mut last = view.borrow_and_update().clone();

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                if current.online_count != last.online_count {
                    info!(online = current.online_count, "Online count changed");
                }
                if current.active_speaker != last.active_speaker {
                    info!(speaker = ?current.active_speaker, "Active speaker changed");
                }
                if current.quality != last.quality {
                    info!(quality = ?current.quality, "Link quality changed");
                }
                if current.reconnecting != last.reconnecting {
                    info!(reconnecting = current.reconnecting, "Reconnecting state changed");
                }
                last = current;
            }
            event = events.recv() => {
                match event {
                    Ok(MeshEvent::Evicted) => {
                        warn!("Evicted from room");
                        health_state.set_not_ready();
                    }
                    Ok(event) => info!(event = ?event, "Mesh event"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event reporter lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
