//! Integration tests for peer link coordination between sessions.
//!
//! Every test runs with paused time: the runtime jumps straight to the next
//! timer whenever all tasks are idle.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::types::{MemberId, SignalEnvelope, SignalKind};
use mesh_node::actors::{LeaveReason, LinkState, MeshEvent, MeshView};
use mesh_node::config::RetryPolicy;
use mesh_node::errors::MeshError;
use mesh_node::mailbox::SignalMailbox;
use mesh_node::quality::QualityTier;
use mesh_node::transport::{LinkStats, TransportState};
use mesh_test_utils::{wait_for_event, wait_for_view, FlakyStore, MockCapture, TestRoom};
use std::sync::Arc;
use std::time::Duration;

fn id(s: &str) -> MemberId {
    MemberId::from(s)
}

#[tokio::test(start_paused = true)]
async fn test_only_lower_id_offers() {
    let room = TestRoom::new();
    let carol = room.join("carol").await.unwrap();
    let alice = room.join("alice").await.unwrap();
    let bob = room.join("bob").await.unwrap();

    for session in [&alice, &bob, &carol] {
        wait_for_view(&mut session.view(), |v| v.connected_links() == 2).await;
    }

    let mut offers = room.network.offers_created();
    offers.sort();
    assert_eq!(
        offers,
        vec![
            (id("alice"), id("bob")),
            (id("alice"), id("carol")),
            (id("bob"), id("carol")),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_streams_announced_once_per_link() {
    let room = TestRoom::new();
    let alice = room.join("alice").await.unwrap();
    let mut events = alice.events();
    let _bob = room.join("bob").await.unwrap();

    let event = wait_for_event(&mut events, |e| matches!(e, MeshEvent::StreamAdded { .. })).await;
    let view = wait_for_view(&mut alice.view(), |v| !v.streams.is_empty()).await;

    match event {
        MeshEvent::StreamAdded { remote_id, stream } => {
            assert_eq!(remote_id, id("bob"));
            assert_eq!(stream.tracks.len(), 2);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(view.streams.len(), 1);
    assert!(!std::iter::from_fn(|| events.try_recv().ok())
        .any(|e| matches!(e, MeshEvent::StreamAdded { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_consumed_envelopes_leave_mailboxes_empty() {
    let room = TestRoom::new();
    let alice = room.join("alice").await.unwrap();
    let bob = room.join("bob").await.unwrap();
    wait_for_view(&mut alice.view(), |v| v.connected_links() == 1).await;
    wait_for_view(&mut bob.view(), |v| v.connected_links() == 1).await;
    // Paused time only advances once every task is idle
    tokio::time::sleep(Duration::from_millis(1)).await;

    for member in ["alice", "bob"] {
        for kind in SignalKind::ALL {
            assert!(
                room.store.memory().mailbox(&id(member), kind).is_empty(),
                "{member} {kind:?} mailbox not drained"
            );
        }
    }
    assert_eq!(
        room.network.candidates_received("bob", "alice").len(),
        1,
        "offerer candidate applied exactly once"
    );
}

#[tokio::test(start_paused = true)]
async fn test_signal_write_failures_are_retried() {
    let room = TestRoom::new();
    let alice = room.join("alice").await.unwrap();
    room.store.fail_next_signal_writes(2);
    let _bob = room.join("bob").await.unwrap();

    let view = wait_for_view(&mut alice.view(), |v| v.connected_links() == 1).await;

    assert_eq!(view.link_state(&id("bob")), Some(LinkState::Connected));
}

#[tokio::test(start_paused = true)]
async fn test_refused_signal_write_is_not_retried() {
    let store = FlakyStore::new();
    let mailbox = SignalMailbox::new(store.shared(), id("alice"), RetryPolicy::signaling());
    store.refuse_next_signal_writes(2);
    let candidate = || SignalEnvelope::candidate(id("alice"), "c".to_string());

    // Each send spends exactly one refusal
    let first = mailbox.send(&id("bob"), candidate()).await;
    let second = mailbox.send(&id("bob"), candidate()).await;
    let third = mailbox.send(&id("bob"), candidate()).await;

    assert!(matches!(first, Err(MeshError::SignalingWrite(_))));
    assert!(matches!(second, Err(MeshError::SignalingWrite(_))));
    assert!(third.is_ok());
    assert_eq!(store.memory().mailbox(&id("bob"), SignalKind::Candidate).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_offer_is_renegotiated() {
    let room = TestRoom::new();
    room.network.refuse_connections_from("bob");
    let alice = room.join("alice").await.unwrap();
    let bob = room.join("bob").await.unwrap();

    // Bob could not answer; alice is left waiting
    wait_for_view(&mut alice.view(), |v| v.online_count == 2).await;
    tokio::time::sleep(room.config.ghost_sweep_interval).await;
    assert_eq!(
        alice.state().await.unwrap().link_state(&id("bob")),
        Some(LinkState::Offering)
    );
    room.network.accept_connections_from("bob");

    let view = wait_for_view(&mut alice.view(), |v| {
        v.link(&id("bob"))
            .is_some_and(|l| l.generation > 1 && l.state == LinkState::Connected)
    })
    .await;
    assert_eq!(view.connected_links(), 1);
    wait_for_view(&mut bob.view(), |v| v.connected_links() == 1).await;
    assert!(room.network.offers_created().len() >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_lost_answer_is_renegotiated() {
    let room = TestRoom::new();
    room.store
        .fail_next_writes_of(SignalKind::Answer, room.config.signal_retry.max_attempts);
    let alice = room.join("alice").await.unwrap();
    let bob = room.join("bob").await.unwrap();

    let view = wait_for_view(&mut alice.view(), |v| {
        v.link(&id("bob"))
            .is_some_and(|l| l.generation > 1 && l.state == LinkState::Connected)
    })
    .await;
    assert_eq!(view.connected_links(), 1);
    let bob_view = wait_for_view(&mut bob.view(), |v| v.connected_links() == 1).await;
    assert_eq!(bob_view.link_state(&id("alice")), Some(LinkState::Connected));
    assert!(room.network.offers_created().len() >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_evicted_member_is_not_linked_by_newcomer() {
    let room = TestRoom::new();
    let alice = room.join("alice").await.unwrap();
    let bob = room.join("bob").await.unwrap();
    let carol = room.join("carol").await.unwrap();
    for session in [&alice, &bob, &carol] {
        wait_for_view(&mut session.view(), |v| v.connected_links() == 2).await;
    }

    // Carol keeps running but her record is evicted
    room.store.freeze_heartbeats("carol");
    wait_for_view(&mut alice.view(), |v| !v.has_member(&id("carol"))).await;
    tokio::time::sleep(room.config.ghost_sweep_interval * 2).await;
    assert_eq!(room.store.memory().count(), 2);
    let carol_view = wait_for_view(&mut carol.view(), |v| v.links.is_empty()).await;
    assert!(!carol_view.evicted);
    let offers_before = room.network.offers_created().len();

    let dave = room.join("dave").await.unwrap();
    let connected = |v: &MeshView, remote: &str| {
        v.link_state(&id(remote)) == Some(LinkState::Connected)
    };
    wait_for_view(&mut dave.view(), |v| connected(v, "alice") && connected(v, "bob")).await;
    tokio::time::sleep(room.config.ghost_sweep_interval * 40).await;

    let dave_view = dave.state().await.unwrap();
    assert!(dave_view.link(&id("carol")).is_none());
    assert!(!dave_view.has_member(&id("carol")));
    assert!(carol.state().await.unwrap().links.is_empty());
    let carol_offers = room
        .network
        .offers_created()
        .into_iter()
        .skip(offers_before)
        .filter(|(offerer, answerer)| *offerer == id("carol") || *answerer == id("carol"))
        .count();
    assert_eq!(carol_offers, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_member_is_pruned_within_sweep_window() {
    let room = TestRoom::new();
    let alice = room.join("alice").await.unwrap();
    let bob = room.join("bob").await.unwrap();
    let _carol = room.join("carol").await.unwrap();
    wait_for_view(&mut alice.view(), |v| v.connected_links() == 2).await;
    let mut events = alice.events();

    let stalled_at = tokio::time::Instant::now();
    room.store.freeze_heartbeats("carol");

    let left = wait_for_event(&mut events, |e| matches!(e, MeshEvent::MemberLeft { .. })).await;
    let pruned_after = stalled_at.elapsed();

    assert_eq!(
        left,
        MeshEvent::MemberLeft {
            member_id: id("carol"),
            reason: LeaveReason::Ghost,
        }
    );
    // Last beat landed at most one heartbeat before the stall
    let bound = room.config.ghost_timeout + room.config.ghost_sweep_interval;
    assert!(pruned_after <= bound, "pruned after {pruned_after:?}");

    let view = wait_for_view(&mut alice.view(), |v| v.online_count == 2).await;
    assert!(view.link(&id("carol")).is_none());
    assert!(!view.has_member(&id("carol")));
    wait_for_view(&mut bob.view(), |v| !v.has_member(&id("carol"))).await;

    // One of the peers evicts the record and frees the slot
    tokio::time::sleep(room.config.ghost_sweep_interval * 2).await;
    assert_eq!(room.store.memory().count(), 2);
    assert!(room.store.memory().member(&id("carol")).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_quality_tiers_and_active_speaker() {
    let mut room = TestRoom::new();
    room.config.room_capacity = 4;
    let alice = room.join("alice").await.unwrap();
    let _bob = room.join("bob").await.unwrap();
    let _carol = room.join("carol").await.unwrap();
    let _dave = room.join("dave").await.unwrap();
    wait_for_view(&mut alice.view(), |v| v.connected_links() == 3).await;

    room.network.set_stats("alice", "bob", LinkStats { packet_loss: 0.0, audio_energy: 0.01 });
    room.network.set_stats("alice", "carol", LinkStats { packet_loss: 5.0, audio_energy: 0.2 });
    room.network.set_stats("alice", "dave", LinkStats { packet_loss: 15.0, audio_energy: 0.08 });

    let view = wait_for_view(&mut alice.view(), |v| {
        v.quality.len() == 3 && v.active_speaker.is_some()
    })
    .await;

    assert_eq!(view.quality.get(&id("bob")), Some(&QualityTier::Good));
    assert_eq!(view.quality.get(&id("carol")), Some(&QualityTier::Weak));
    assert_eq!(view.quality.get(&id("dave")), Some(&QualityTier::Bad));
    assert_eq!(view.active_speaker, Some(id("carol")));

    // Silence keeps the last speaker
    room.network.set_stats("alice", "carol", LinkStats { packet_loss: 0.0, audio_energy: 0.0 });
    room.network.set_stats("alice", "dave", LinkStats { packet_loss: 15.0, audio_energy: 0.0 });
    let view = wait_for_view(&mut alice.view(), |v| {
        v.quality.get(&id("carol")) == Some(&QualityTier::Good)
    })
    .await;
    assert_eq!(view.active_speaker, Some(id("carol")));
}

#[tokio::test(start_paused = true)]
async fn test_reconnecting_flag_and_connected_notice() {
    let room = TestRoom::new();
    let alice = room.join("alice").await.unwrap();
    let _bob = room.join("bob").await.unwrap();
    let mut view = alice.view();
    wait_for_view(&mut view, |v| v.connected_links() == 1).await;

    room.network
        .set_transport_state("alice", "bob", TransportState::Disconnected);
    let reconnecting = wait_for_view(&mut view, |v| v.reconnecting).await;
    assert_eq!(reconnecting.link_state(&id("bob")), Some(LinkState::Reconnecting));

    room.network
        .set_transport_state("alice", "bob", TransportState::Connected);
    let recovered = wait_for_view(&mut view, |v| !v.reconnecting).await;
    assert!(recovered.connected_notice);

    let settled = wait_for_view(&mut view, |v| !v.connected_notice).await;
    assert_eq!(settled.link_state(&id("bob")), Some(LinkState::Connected));
}

#[tokio::test(start_paused = true)]
async fn test_failed_transport_is_reoffered() {
    let room = TestRoom::new();
    let alice = room.join("alice").await.unwrap();
    let _bob = room.join("bob").await.unwrap();
    let mut view = alice.view();
    wait_for_view(&mut view, |v| v.connected_links() == 1).await;

    room.network
        .set_transport_state("alice", "bob", TransportState::Failed);

    let view = wait_for_view(&mut view, |v| {
        v.link(&id("bob"))
            .is_some_and(|l| l.generation > 1 && l.state == LinkState::Connected)
    })
    .await;
    assert_eq!(view.connected_links(), 1);
    assert!(room.network.offers_created().len() >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_denied_media_degrades_without_failing_join() {
    let room = TestRoom::new();
    let capture = MockCapture::denied();
    let alice = room
        .join_with("alice", Arc::new(capture.clone()))
        .await
        .unwrap();
    let bob = room.join("bob").await.unwrap();

    assert_eq!(capture.acquisitions(), 1);

    assert!(matches!(
        alice.media_error(),
        Some(MeshError::MediaUnavailable(_))
    ));
    let view = wait_for_view(&mut alice.view(), |v| v.connected_links() == 1).await;
    assert!(!view.mic_enabled);
    assert!(!view.video_enabled);
    assert!(alice.toggle_mic().await.is_err());

    // Bob still receives nothing from alice but gets a working link
    let bob_view = wait_for_view(&mut bob.view(), |v| v.connected_links() == 1).await;
    assert!(bob_view.streams.is_empty());
    assert!(!bob.toggle_video().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_leave_closes_links_on_peers() {
    let room = TestRoom::new();
    let alice = room.join("alice").await.unwrap();
    let bob = room.join("bob").await.unwrap();
    let mut events = alice.events();
    wait_for_view(&mut alice.view(), |v| v.connected_links() == 1).await;

    bob.leave().await.unwrap();

    let left = wait_for_event(&mut events, |e| matches!(e, MeshEvent::MemberLeft { .. })).await;
    assert_eq!(
        left,
        MeshEvent::MemberLeft {
            member_id: id("bob"),
            reason: LeaveReason::Departed,
        }
    );
    let view = wait_for_view(&mut alice.view(), |v| v.links.is_empty()).await;
    assert_eq!(view.online_count, 1);
    assert_eq!(room.store.memory().count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_session_leaves_and_releases_media() {
    let room = TestRoom::new();
    let alice = room.join("alice").await.unwrap();
    let capture = MockCapture::available();
    let bob = room
        .join_with("bob", Arc::new(capture.clone()))
        .await
        .unwrap();
    let mut events = alice.events();
    wait_for_view(&mut alice.view(), |v| v.connected_links() == 1).await;
    assert_eq!(room.store.memory().count(), 2);
    assert_eq!(capture.unreleased(), 1);

    drop(bob);

    let left = wait_for_event(&mut events, |e| matches!(e, MeshEvent::MemberLeft { .. })).await;
    assert_eq!(
        left,
        MeshEvent::MemberLeft {
            member_id: id("bob"),
            reason: LeaveReason::Departed,
        }
    );
    assert_eq!(room.store.memory().count(), 1);
    assert_eq!(capture.unreleased(), 0);
    let view = wait_for_view(&mut alice.view(), |v| v.links.is_empty()).await;
    assert_eq!(view.online_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_refusal_is_not_fatal() {
    let room = TestRoom::new();
    room.network.refuse_connections_from("alice");
    let alice = room.join("alice").await.unwrap();
    let _bob = room.join("bob").await.unwrap();

    wait_for_view(&mut alice.view(), |v| v.online_count == 2).await;
    // Several heartbeats, each re-running reconciliation
    tokio::time::sleep(room.config.heartbeat_interval * 3).await;

    let view = alice.state().await.unwrap();
    assert!(view.links.is_empty());
    assert!(view.has_member(&id("bob")));
    assert!(room.network.offers_created().is_empty());
    assert!(!alice.toggle_mic().await.unwrap());
}
