//! End-to-end call lifecycle through the controller.
//!
//! Drives calls the way the signaling gateway does and checks the outbound
//! events, the persisted records and the media routers left behind.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::time::Duration;

use call_controller::errors::CallError;
use call_controller::media::engine::mock::MockMediaEngine;
use call_controller::session::{end_reason, CallState, DeviceInfo, ParticipantStatus, QualitySample};
use call_controller::signaling::{CallEvent, SignalingEvent};
use call_controller::store::mock::MockCallRecordStore;
use call_test_utils::{user, EventCollector, TestCall, TestConfig, TestController};

fn device(id: &str) -> Option<DeviceInfo> {
    Some(DeviceInfo {
        device_id: id.to_string(),
        platform: Some("ios".to_string()),
        app_version: None,
    })
}

// ============================================================================
// Happy paths
// ============================================================================

#[tokio::test]
async fn test_one_to_one_call_completes() {
    let t = TestController::start(&TestConfig::new().build());
    let mut events = EventCollector::new(t.controller.subscribe());

    let snap = t
        .controller
        .initiate_call(TestCall::audio("alice", &["bob"]).build())
        .await
        .unwrap();
    assert_eq!(snap.state, CallState::Ringing);
    assert_eq!(snap.status_of(&user("alice")), Some(ParticipantStatus::Accepted));
    assert_eq!(snap.status_of(&user("bob")), Some(ParticipantStatus::Unanswered));

    let snap = t
        .controller
        .accept(snap.call_id, user("bob"), device("bob-phone"))
        .await
        .unwrap();
    assert_eq!(snap.state, CallState::Active);

    // Whole-second durations need a real second to pass.
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let snap = t.controller.leave(snap.call_id, user("bob")).await.unwrap();
    assert_eq!(snap.state, CallState::Ended);

    events.wait_for_end(snap.call_id).await;
    let record = t.wait_for_record(snap.call_id).await;
    assert_eq!(record.final_state, CallState::Ended);
    assert_eq!(record.end_reason, end_reason::COMPLETED);
    assert!(!record.missed);
    assert!(record.duration_seconds >= 1);
    assert!(record.participants.iter().all(|p| p.joined_at.is_some()));

    let bob = record
        .participants
        .iter()
        .find(|p| p.user_id == user("bob"))
        .unwrap();
    assert_eq!(bob.status, ParticipantStatus::Left);
    assert!(bob.left_at.is_some());
    assert_eq!(bob.device_info, device("bob-phone"));

    t.wait_for_release(snap.call_id).await;
    assert_eq!(t.engine.routers_closed(), 1);
}

#[tokio::test]
async fn test_group_call_survives_one_rejection() {
    let t = TestController::start(&TestConfig::new().build());
    let mut events = EventCollector::new(t.controller.subscribe());

    let snap = t
        .controller
        .initiate_call(TestCall::video("alice", &["bob", "carol"]).build())
        .await
        .unwrap();
    let call_id = snap.call_id;

    let snap = t.controller.reject(call_id, user("bob")).await.unwrap();
    assert_eq!(snap.state, CallState::Ringing);

    let snap = t.controller.accept(call_id, user("carol"), None).await.unwrap();
    assert_eq!(snap.state, CallState::Active);
    assert_eq!(snap.status_of(&user("bob")), Some(ParticipantStatus::Rejected));

    let snap = t.controller.leave(call_id, user("carol")).await.unwrap();
    assert_eq!(snap.state, CallState::Ended);
    assert_eq!(snap.status_of(&user("alice")), Some(ParticipantStatus::Left));

    events.wait_for_end(call_id).await;
    let record = t.wait_for_record(call_id).await;
    assert!(!record.missed);
    assert_eq!(record.end_reason, end_reason::COMPLETED);
}

#[tokio::test]
async fn test_force_end_marks_unanswered_missed() {
    let t = TestController::start(&TestConfig::new().build());

    let request = TestCall::audio("alice", &["bob"]).with_retry_count(1).build();
    let snap = t.controller.initiate_call(request).await.unwrap();

    let snap = t
        .controller
        .force_end(snap.call_id, "timeout".to_string())
        .await
        .unwrap();
    assert_eq!(snap.state, CallState::Ended);
    assert_eq!(snap.status_of(&user("bob")), Some(ParticipantStatus::Missed));

    let record = t.wait_for_record(snap.call_id).await;
    assert!(record.missed);
    let termination = record.termination.unwrap();
    assert_eq!(termination.reason, "timeout");
    assert_eq!(termination.retry_count, 1);
}

#[tokio::test]
async fn test_all_receivers_decline_ends_without_media() {
    let t = TestController::start(&TestConfig::new().build());

    let snap = t
        .controller
        .initiate_call(TestCall::audio("alice", &["bob", "carol"]).build())
        .await
        .unwrap();
    let call_id = snap.call_id;

    t.controller.mark_busy(call_id, user("bob")).await.unwrap();
    let snap = t.controller.mark_missed(call_id, user("carol")).await.unwrap();
    assert_eq!(snap.state, CallState::Ended);
    assert_eq!(snap.end_reason.as_deref(), Some(end_reason::UNANSWERED));

    let record = t.wait_for_record(call_id).await;
    assert!(record.missed);
    t.wait_for_release(call_id).await;
    assert_eq!(t.engine.live_transports(), 0);
}

// ============================================================================
// Error paths
// ============================================================================

#[tokio::test]
async fn test_duplicate_accept_is_invalid_transition() {
    let t = TestController::start(&TestConfig::new().build());
    let snap = t
        .controller
        .initiate_call(TestCall::audio("alice", &["bob", "carol"]).build())
        .await
        .unwrap();

    t.controller.accept(snap.call_id, user("bob"), None).await.unwrap();
    let result = t.controller.accept(snap.call_id, user("bob"), None).await;
    assert!(matches!(result, Err(CallError::InvalidTransition(_))));

    // The failed accept left the call untouched.
    let snap = t.controller.snapshot(snap.call_id).await.unwrap();
    assert_eq!(snap.state, CallState::Active);
    assert_eq!(snap.status_of(&user("carol")), Some(ParticipantStatus::Unanswered));
}

#[tokio::test]
async fn test_stranger_is_participant_not_found() {
    let t = TestController::start(&TestConfig::new().build());
    let snap = t
        .controller
        .initiate_call(TestCall::audio("alice", &["bob"]).build())
        .await
        .unwrap();

    let result = t.controller.accept(snap.call_id, user("mallory"), None).await;
    assert!(matches!(result, Err(CallError::ParticipantNotFound(_))));
}

#[tokio::test]
async fn test_events_after_end_are_not_found() {
    let t = TestController::start(&TestConfig::new().build());
    let snap = t
        .controller
        .initiate_call(TestCall::audio("alice", &["bob"]).build())
        .await
        .unwrap();
    t.controller.reject(snap.call_id, user("bob")).await.unwrap();
    t.wait_for_idle().await;

    let result = t.controller.accept(snap.call_id, user("bob"), None).await;
    assert!(matches!(result, Err(CallError::CallNotFound(_))));
}

#[tokio::test]
async fn test_no_reachable_worker_leaves_no_state() {
    let engine = MockMediaEngine::with_unreachable_workers([0, 1]);
    let t = TestController::with_mocks(
        &TestConfig::new().with_workers(2).build(),
        engine,
        MockCallRecordStore::new(),
    );

    let result = t
        .controller
        .initiate_call(TestCall::audio("alice", &["bob"]).build())
        .await;
    assert!(matches!(result, Err(CallError::ResourceExhausted(_))));

    let status = t.controller.get_status().await.unwrap();
    assert_eq!(status.call_count, 0);
    assert_eq!(t.registry.router_count().await, 0);
    assert_eq!(t.store.save_attempts(), 0);
}

#[tokio::test]
async fn test_persistence_failure_still_ends_call() {
    let t = TestController::with_mocks(
        &TestConfig::new().build(),
        MockMediaEngine::new(),
        MockCallRecordStore::failing(),
    );
    let mut events = EventCollector::new(t.controller.subscribe());

    let snap = t
        .controller
        .initiate_call(TestCall::audio("alice", &["bob"]).build())
        .await
        .unwrap();
    t.controller.accept(snap.call_id, user("bob"), None).await.unwrap();
    t.controller.leave(snap.call_id, user("bob")).await.unwrap();

    events.wait_for_end(snap.call_id).await;
    t.wait_for_idle().await;
    t.wait_for_release(snap.call_id).await;
    assert_eq!(t.store.save_attempts(), 1);
    assert_eq!(t.metrics.persist_failures(), 1);
}

// ============================================================================
// Media and quality
// ============================================================================

#[tokio::test]
async fn test_router_released_exactly_once() {
    let t = TestController::start(&TestConfig::new().build());
    let snap = t
        .controller
        .initiate_call(TestCall::audio("alice", &["bob"]).build())
        .await
        .unwrap();
    t.controller.accept(snap.call_id, user("bob"), None).await.unwrap();

    // Leave and force-end race for the same call.
    let (left, forced) = tokio::join!(
        t.controller.leave(snap.call_id, user("bob")),
        t.controller.force_end(snap.call_id, "admin".to_string()),
    );
    assert!(left.is_ok() || forced.is_ok());

    t.wait_for_idle().await;
    t.wait_for_release(snap.call_id).await;
    assert_eq!(t.engine.routers_closed(), 1);
    assert!(!t.registry.release_router(&snap.call_id).await);
    assert_eq!(t.engine.routers_closed(), 1);
}

#[tokio::test]
async fn test_media_ready_for_each_joined_participant() {
    let t = TestController::start(&TestConfig::new().build());
    let mut events = EventCollector::new(t.controller.subscribe());

    let snap = t
        .controller
        .initiate_call(TestCall::video("alice", &["bob"]).build())
        .await
        .unwrap();
    t.controller.accept(snap.call_id, user("bob"), None).await.unwrap();

    for who in ["alice", "bob"] {
        events
            .wait_for(|e| {
                matches!(e, CallEvent::MediaReady { user_id, .. } if *user_id == user(who))
            })
            .await;
    }
    assert_eq!(t.registry.active_transport_count(&snap.call_id).await, 4);
    assert_eq!(t.registry.consumer_count(&snap.call_id).await, 2);
}

#[tokio::test]
async fn test_quality_only_counts_while_active() {
    let t = TestController::start(&TestConfig::new().build());
    let sample = QualitySample {
        bitrate_kbps: 800,
        packet_loss: 0.02,
        latency_ms: 40,
    };

    let snap = t
        .controller
        .initiate_call(TestCall::audio("alice", &["bob"]).build())
        .await
        .unwrap();
    assert!(!t.controller.report_quality(snap.call_id, &sample).await.unwrap());

    t.controller.accept(snap.call_id, user("bob"), None).await.unwrap();
    let event = SignalingEvent::QualityReport {
        call_id: snap.call_id,
        user_id: user("bob"),
        sample,
    };
    assert_eq!(t.controller.dispatch(event).await.unwrap(), None);

    t.controller.leave(snap.call_id, user("bob")).await.unwrap();
    let record = t.wait_for_record(snap.call_id).await;
    let quality = record.quality.unwrap();
    assert!((quality.avg_bitrate_kbps - 800.0).abs() < f64::EPSILON);
    assert!((quality.avg_latency_ms - 40.0).abs() < f64::EPSILON);
}

// ============================================================================
// Timing and shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_ring_timeout_ends_unanswered_call() {
    let t = TestController::start(&TestConfig::new().with_ring_timeout_seconds(3).build());
    let mut events = EventCollector::new(t.controller.subscribe());

    let snap = t
        .controller
        .initiate_call(TestCall::audio("alice", &["bob"]).build())
        .await
        .unwrap();
    t.controller.mark_ringing(snap.call_id, user("bob")).await.unwrap();

    tokio::time::advance(Duration::from_secs(1)).await;
    let mid = t.controller.snapshot(snap.call_id).await.unwrap();
    assert_eq!(mid.state, CallState::Ringing);

    let ended = events.wait_for_end(snap.call_id).await;
    assert!(matches!(ended, CallEvent::CallEnded { ref reason, .. } if reason == end_reason::TIMEOUT));

    let record = t.wait_for_record(snap.call_id).await;
    assert!(record.missed);
    let bob = record
        .participants
        .iter()
        .find(|p| p.user_id == user("bob"))
        .unwrap();
    assert_eq!(bob.status, ParticipantStatus::Missed);
}

#[tokio::test]
async fn test_shutdown_ends_live_calls() {
    let t = TestController::start(&TestConfig::new().build());

    let mut ids = Vec::new();
    for receiver in ["bob", "carol"] {
        let snap = t
            .controller
            .initiate_call(TestCall::audio("alice", &[receiver]).build())
            .await
            .unwrap();
        ids.push(snap.call_id);
    }
    t.controller.accept(ids[0], user("bob"), None).await.unwrap();

    t.controller.shutdown(Duration::from_secs(5)).await.unwrap();

    for call_id in &ids {
        let record = t.wait_for_record(*call_id).await;
        assert_eq!(record.end_reason, end_reason::SHUTDOWN);
    }
    assert_eq!(t.engine.routers_closed(), 2);

    let result = t
        .controller
        .initiate_call(TestCall::audio("alice", &["dave"]).build())
        .await;
    assert!(matches!(result, Err(CallError::Draining)));
}
