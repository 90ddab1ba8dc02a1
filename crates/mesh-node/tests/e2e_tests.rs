//! End-to-end room lifecycle: fill, reject, prune a stalled member, refill.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::types::MemberId;
use http_body_util::BodyExt;
use mesh_node::actors::{LeaveReason, LinkState, MeshEvent, MeshView};
use mesh_node::observability::{health_router, HealthState};
use mesh_test_utils::{wait_for_event, wait_for_view, TestRoom};
use std::sync::Arc;
use tower::util::ServiceExt;

fn id(s: &str) -> MemberId {
    MemberId::from(s)
}

#[tokio::test(start_paused = true)]
async fn test_room_lifecycle_with_stalled_member() {
    let room = TestRoom::new();
    let alice = room.join("alice").await.unwrap();
    let bob = room.join("bob").await.unwrap();
    let carol = room.join("carol").await.unwrap();

    for session in [&alice, &bob, &carol] {
        wait_for_view(&mut session.view(), |v| v.connected_links() == 2).await;
    }

    // Full room turns the fourth member away
    let err = room.join("dave").await.err().expect("room should be full");
    assert!(err.is_capacity_exceeded());
    assert_eq!(room.store.memory().count(), 3);

    // Carol stalls and is pruned by the others
    let mut events = alice.events();
    room.store.freeze_heartbeats("carol");
    let left = wait_for_event(&mut events, |e| matches!(e, MeshEvent::MemberLeft { .. })).await;
    assert_eq!(
        left,
        MeshEvent::MemberLeft {
            member_id: id("carol"),
            reason: LeaveReason::Ghost,
        }
    );
    wait_for_view(&mut bob.view(), |v| !v.has_member(&id("carol"))).await;
    tokio::time::sleep(room.config.ghost_sweep_interval * 2).await;
    assert_eq!(room.store.memory().count(), 2);

    // The freed slot goes to dave, who meshes with the survivors
    let dave = room.join("dave").await.unwrap();
    assert_eq!(dave.admitted_count(), 3);
    let connected = |v: &MeshView, remote: &str| {
        v.link_state(&id(remote)) == Some(LinkState::Connected)
    };
    wait_for_view(&mut dave.view(), |v| connected(v, "alice") && connected(v, "bob")).await;

    // Carol comes back to a full room and learns she was evicted
    room.store.thaw_heartbeats("carol");
    let carol_view = wait_for_view(&mut carol.view(), |v| v.evicted).await;
    assert!(carol_view.links.is_empty());
    assert_eq!(room.store.memory().count(), 3);
    assert!(room.store.memory().member(&id("carol")).is_none());

    // Whatever carol opened towards dave is gone once her side closes
    let view = wait_for_view(&mut dave.view(), |v| v.link(&id("carol")).is_none()).await;
    assert_eq!(view.connected_links(), 2);
    assert_eq!(view.online_count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_member_rejoins_when_slot_is_free() {
    let room = TestRoom::new();
    let alice = room.join("alice").await.unwrap();
    let bob = room.join("bob").await.unwrap();
    wait_for_view(&mut alice.view(), |v| v.connected_links() == 1).await;

    room.store.freeze_heartbeats("bob");
    wait_for_view(&mut alice.view(), |v| !v.has_member(&id("bob"))).await;
    tokio::time::sleep(room.config.ghost_sweep_interval * 2).await;
    assert!(room.store.memory().member(&id("bob")).is_none());

    room.store.thaw_heartbeats("bob");
    let view = wait_for_view(&mut alice.view(), |v| {
        v.has_member(&id("bob")) && v.connected_links() == 1
    })
    .await;
    assert_eq!(view.online_count, 2);
    assert!(!bob.view().borrow().evicted);
}

#[tokio::test(start_paused = true)]
async fn test_status_endpoint_reports_session_view() {
    let room = TestRoom::new();
    let alice = room.join("alice").await.unwrap();
    let _bob = room.join("bob").await.unwrap();
    wait_for_view(&mut alice.view(), |v| v.connected_links() == 1).await;

    let app = health_router(Arc::new(HealthState::new()), alice.view());
    let response = app
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["localId"], "alice");
    assert_eq!(status["onlineCount"], 2);
    assert_eq!(status["links"].as_array().map(Vec::len), Some(1));
}
