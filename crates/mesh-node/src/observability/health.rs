//! Health endpoints for the mesh node.
//!
//! - `GET /health` - Liveness check (is the process running?)
//! - `GET /ready` - Readiness check (admitted and coordinating?)
//! - `GET /status` - The current [`MeshView`] as JSON
//!
//! The `/metrics` endpoint is served separately via `metrics-exporter-prometheus`.

use crate::actors::MeshView;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Liveness and readiness for probes.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    /// True between a successful join and the start of shutdown.
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the node as not ready (e.g., during shutdown or after eviction).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct HealthContext {
    health: Arc<HealthState>,
    view: watch::Receiver<MeshView>,
}

/// Create the health router.
///
/// # Endpoints
///
/// - `GET /health` - 200 if the process is running
/// - `GET /ready` - 200 if ready, 503 otherwise
/// - `GET /status` - latest published view
pub fn health_router(health_state: Arc<HealthState>, view: watch::Receiver<MeshView>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .route("/status", get(status_handler))
        .with_state(HealthContext {
            health: health_state,
            view,
        })
}

async fn liveness_handler(State(ctx): State<HealthContext>) -> StatusCode {
    if ctx.health.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(ctx): State<HealthContext>) -> StatusCode {
    if ctx.health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status_handler(State(ctx): State<HealthContext>) -> Json<MeshView> {
    Json(ctx.view.borrow().clone())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use common::types::MemberId;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn router(state: Arc<HealthState>) -> (Router, watch::Sender<MeshView>) {
        let (tx, rx) = watch::channel(MeshView::new(MemberId::from("alice")));
        (health_router(state, rx), tx)
    }

    async fn get_status(app: Router, uri: &str) -> StatusCode {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        app.oneshot(request)
            .await
            .expect("Failed to execute request")
            .status()
    }

    #[test]
    fn test_health_state_default() {
        let state = HealthState::new();
        assert!(state.is_live(), "Should be live by default");
        assert!(!state.is_ready(), "Should not be ready by default");
    }

    #[test]
    fn test_health_state_set_ready() {
        let state = HealthState::new();

        state.set_ready();
        assert!(state.is_ready());

        state.set_not_ready();
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_liveness_endpoint() {
        let (app, _tx) = router(Arc::new(HealthState::new()));
        assert_eq!(get_status(app, "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_follows_state() {
        let state = Arc::new(HealthState::new());
        let (app, _tx) = router(Arc::clone(&state));
        assert_eq!(
            get_status(app.clone(), "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.set_ready();
        assert_eq!(get_status(app, "/ready").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_returns_latest_view() {
        let (app, tx) = router(Arc::new(HealthState::new()));
        tx.send_modify(|view| view.online_count = 2);

        let request = Request::builder()
            .uri("/status")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["localId"], "alice");
        assert_eq!(json["onlineCount"], 2);
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let (app, _tx) = router(Arc::new(HealthState::new()));
        assert_eq!(get_status(app, "/unknown").await, StatusCode::NOT_FOUND);
    }
}
