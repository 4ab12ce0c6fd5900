//! End-to-end scenarios against the in-process mock engine, with intervals
//! compressed to milliseconds so the budgets in the assertions are the real
//! scene-switch budgets, scaled.

mod common;

use std::time::Duration;

use common::{start, wait_until, MockEngine};
use liveward::fault::Fault;
use liveward::store::model::{
    DowntimeEvent, FailureCause, InitializationState, OverallStatus, OwnerSession, StreamSession,
};

async fn open_session_id(harness: &common::Harness) -> String {
    StreamSession::db_find_open(harness.store.pool())
        .await
        .unwrap()
        .expect("stream session should be open")
        .id
}

async fn wait_live(harness: &common::Harness) -> String {
    assert!(
        wait_until(3000, || async { harness.engine.is_streaming() }).await,
        "stream never went live"
    );
    assert!(
        wait_until(3000, || async {
            StreamSession::db_find_open(harness.store.pool())
                .await
                .unwrap()
                .is_some()
        })
        .await,
        "no open stream session"
    );
    let session_id = open_session_id(harness).await;
    // The first health sample also proves every monitor task is running,
    // so fault injection cannot race component startup.
    assert!(
        wait_until(3000, || async {
            liveward::store::model::HealthMetric::db_latest(harness.store.pool(), &session_id)
                .await
                .unwrap()
                .is_some()
        })
        .await,
        "no health sample arrived"
    );
    session_id
}

// Scenario A: preflight fails on missing fallback content, logs a failed
// attempt, never starts streaming, and passes after the file appears.
#[tokio::test]
async fn preflight_blocks_until_fallback_content_exists() {
    let engine = MockEngine::new();
    let harness = start(engine.clone(), true, |cfg| {
        cfg.content.fallback_file = cfg.content.fallback_file.with_file_name("missing.mp4");
    })
    .await;

    assert!(
        wait_until(2000, || async {
            matches!(
                InitializationState::db_latest(harness.store.pool()).await.unwrap(),
                Some(state) if state.overall_status == OverallStatus::Failed
            )
        })
        .await,
        "no failed preflight attempt recorded"
    );
    let failed = InitializationState::db_latest(harness.store.pool())
        .await
        .unwrap()
        .unwrap();
    assert!(!failed.fallback_content_available);
    assert!(failed
        .failure_details
        .as_deref()
        .unwrap_or_default()
        .contains("fallback_content"));
    assert!(failed.stream_started_at.is_none());
    assert_eq!(engine.start_count(), 0);
    assert!(!engine.is_streaming());

    // Drop the file in place; the retry loop picks it up from scratch.
    std::fs::write(harness.fallback_path(), b"now it exists").unwrap();

    assert!(
        wait_until(3000, || async { engine.is_streaming() }).await,
        "streaming did not start after preflight passed"
    );
    let passed = InitializationState::db_latest(harness.store.pool())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(passed.overall_status, OverallStatus::Passed);
    assert!(passed.all_passed());
    assert!(passed.stream_started_at.is_some());

    // Preflight also provisioned the four required scenes, idempotently.
    let scenes = engine.scene_names();
    for required in [
        "Automated Content",
        "Owner Live",
        "Failover",
        "Technical Difficulties",
    ] {
        assert_eq!(
            scenes.iter().filter(|scene| *scene == required).count(),
            1,
            "scene {} should exist exactly once",
            required
        );
    }

    harness.stop().await;
}

// Scenario B: a content failure swaps the fallback scene in within budget
// and leaves a closed content-failure downtime event behind.
#[tokio::test]
async fn content_failure_recovers_to_fallback_scene_within_budget() {
    let engine = MockEngine::new();
    let harness = start(engine.clone(), true, |_| {}).await;
    let session_id = wait_live(&harness).await;

    let raised_at = tokio::time::Instant::now();
    harness.raise(Fault::Content {
        detail: "media item stalled".to_string(),
    });

    assert!(
        wait_until(1000, || async { engine.active_scene_name() == "Failover" }).await,
        "fallback scene was not activated within the budget"
    );
    assert!(raised_at.elapsed() < Duration::from_millis(1000));

    assert!(
        wait_until(2000, || async {
            let events = DowntimeEvent::db_find_by_session(harness.store.pool(), &session_id)
                .await
                .unwrap();
            events
                .iter()
                .any(|event| event.cause == FailureCause::ContentFailure && !event.is_ongoing())
        })
        .await,
        "content-failure event was not opened and closed"
    );
    let events = DowntimeEvent::db_find_by_session(harness.store.pool(), &session_id)
        .await
        .unwrap();
    let event = events
        .iter()
        .find(|event| event.cause == FailureCause::ContentFailure)
        .unwrap();
    assert!(event.automatic_recovery);
    assert!(event.recovery_action.contains("fallback"));

    harness.stop().await;
}

// Scenario C: a held owner activation opens an owner session and lands on
// the owner scene within the transition budget.
#[tokio::test]
async fn owner_activation_held_past_debounce_takes_the_air() {
    let engine = MockEngine::new();
    let harness = start(engine.clone(), true, |_| {}).await;
    let session_id = wait_live(&harness).await;

    engine.set_source("Owner Camera", true, true);

    assert!(
        wait_until(2000, || async { engine.active_scene_name() == "Owner Live" }).await,
        "owner scene was not activated"
    );
    let open = OwnerSession::db_find_open(harness.store.pool(), &session_id)
        .await
        .unwrap()
        .expect("owner session should be open");
    assert_eq!(open.content_interrupted.as_deref(), Some("Automated Content"));
    // Budget is 1 s in compressed time (10 s scaled).
    assert!(open.transition_time_sec <= 1.0);

    // Owner walks away; after the deactivation debounce the automated
    // programming resumes and the session closes with the resume item.
    engine.set_source("Owner Camera", false, false);
    assert!(
        wait_until(2000, || async {
            engine.active_scene_name() == "Automated Content"
        })
        .await,
        "automated scene did not resume"
    );
    assert!(
        wait_until(1000, || async {
            OwnerSession::db_find_open(harness.store.pool(), &session_id)
                .await
                .unwrap()
                .is_none()
        })
        .await,
        "owner session did not close"
    );
    let sessions = OwnerSession::db_find_by_session(harness.store.pool(), &session_id)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].resume_content.as_deref(), Some("fallback"));

    harness.stop().await;
}

// Scenario D: a flicker shorter than the debounce window changes nothing.
#[tokio::test]
async fn owner_flicker_shorter_than_debounce_is_ignored() {
    let engine = MockEngine::new();
    let harness = start(engine.clone(), true, |_| {}).await;
    let session_id = wait_live(&harness).await;

    engine.set_source("Owner Camera", true, true);
    tokio::time::sleep(Duration::from_millis(150)).await;
    engine.set_source("Owner Camera", false, false);

    // Give the detector ample time to (wrongly) promote.
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(engine.active_scene_name(), "Automated Content");
    let sessions = OwnerSession::db_find_by_session(harness.store.pool(), &session_id)
        .await
        .unwrap();
    assert!(sessions.is_empty(), "flicker must not create an owner session");

    harness.stop().await;
}

// Scenario E: destination drops, the session manager reconnects on its own
// cadence, and the connection-lost event closes once the stream is healthy.
#[tokio::test]
async fn destination_drop_reconnects_and_closes_the_event() {
    let engine = MockEngine::new();
    let harness = start(engine.clone(), true, |_| {}).await;
    let session_id = wait_live(&harness).await;
    let starts_before = engine.start_count();

    // Link drops; the engine reports it is retrying.
    engine.set_streaming(false, true);

    assert!(
        wait_until(2000, || async {
            DowntimeEvent::db_find_open(harness.store.pool(), &session_id)
                .await
                .unwrap()
                .map(|event| event.cause == FailureCause::ConnectionLost)
                .unwrap_or(false)
        })
        .await,
        "connection-lost event was not opened"
    );

    // The engine gives up on its own retries; the session manager's 10 s
    // (compressed: 80 ms) loop takes over and succeeds on the third try.
    engine.fail_next_starts(2);
    engine.set_streaming(false, false);

    assert!(
        wait_until(3000, || async { engine.is_streaming() }).await,
        "destination link was not re-established"
    );
    assert!(engine.start_count() > starts_before);

    assert!(
        wait_until(2000, || async {
            DowntimeEvent::db_find_open(harness.store.pool(), &session_id)
                .await
                .unwrap()
                .is_none()
        })
        .await,
        "connection-lost event was not closed after recovery"
    );
    let events = DowntimeEvent::db_find_by_session(harness.store.pool(), &session_id)
        .await
        .unwrap();
    let event = events
        .iter()
        .find(|event| event.cause == FailureCause::ConnectionLost)
        .unwrap();
    assert!(event.automatic_recovery);
    assert!(!event.is_ongoing());

    // Session downtime was folded in and never exceeds the total.
    let session = StreamSession::db_find_by_id(harness.store.pool(), &session_id)
        .await
        .unwrap()
        .unwrap();
    assert!(session.downtime_duration_sec <= session.total_duration_sec);

    harness.stop().await;
}

// An unresponsive engine gets restarted through the lifecycle collaborator
// and the downtime event closes after it comes back.
#[tokio::test]
async fn unresponsive_engine_is_restarted_and_recovers() {
    let engine = MockEngine::new();
    let harness = start(engine.clone(), true, |_| {}).await;
    let session_id = wait_live(&harness).await;

    engine.set_responsive(false);

    assert!(
        wait_until(4000, || async {
            harness.lifecycle.restarts.load(std::sync::atomic::Ordering::SeqCst) >= 1
        })
        .await,
        "engine restart was never attempted"
    );
    assert!(
        wait_until(3000, || async { engine.is_streaming() }).await,
        "streaming did not resume after engine recovery"
    );
    assert!(
        wait_until(2000, || async {
            let events = DowntimeEvent::db_find_by_session(harness.store.pool(), &session_id)
                .await
                .unwrap();
            events
                .iter()
                .any(|event| event.cause == FailureCause::EngineUnresponsive && !event.is_ongoing())
        })
        .await,
        "engine-unresponsive event was not closed"
    );

    harness.stop().await;
}

// Restart exhaustion is the terminal state: technical-difficulties scene,
// an event that requires an operator, and no automatic closure ever.
#[tokio::test]
async fn engine_restart_exhaustion_goes_terminal() {
    let engine = MockEngine::new();
    let harness = start(engine.clone(), false, |_| {}).await;
    let session_id = wait_live(&harness).await;

    harness.raise(Fault::Engine {
        detail: "induced".to_string(),
    });

    assert!(
        wait_until(3000, || async {
            engine.active_scene_name() == "Technical Difficulties"
        })
        .await,
        "technical difficulties scene was not activated"
    );
    assert_eq!(
        harness.lifecycle.restarts.load(std::sync::atomic::Ordering::SeqCst),
        harness.cfg.failover.max_engine_restarts
    );

    let event = DowntimeEvent::db_find_open(harness.store.pool(), &session_id)
        .await
        .unwrap()
        .expect("terminal event must stay open");
    assert!(event.requires_operator);
    assert!(!event.automatic_recovery);

    // Healthy samples keep arriving (the mock engine still answers), but a
    // terminal event is never closed automatically.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(DowntimeEvent::db_find_open(harness.store.pool(), &session_id)
        .await
        .unwrap()
        .is_some());

    // Only the explicit operator marker resolves it.
    DowntimeEvent::db_resolve_terminal(harness.store.pool(), &event.id, "engine replaced")
        .await
        .unwrap();
    assert!(DowntimeEvent::db_find_open(harness.store.pool(), &session_id)
        .await
        .unwrap()
        .is_none());

    harness.stop().await;
}

// An active owner session outranks automated-path recovery: the fault is
// still recorded, but the scene stays with the owner.
#[tokio::test]
async fn owner_session_preempts_fallback_recovery() {
    let engine = MockEngine::new();
    let harness = start(engine.clone(), true, |_| {}).await;
    let session_id = wait_live(&harness).await;

    engine.set_source("Owner Camera", true, true);
    assert!(
        wait_until(2000, || async { engine.active_scene_name() == "Owner Live" }).await,
        "owner scene was not activated"
    );

    harness.raise(Fault::Content {
        detail: "automated item died while owner is live".to_string(),
    });
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Scene stays with the owner; the event was still recorded.
    assert_eq!(engine.active_scene_name(), "Owner Live");
    let events = DowntimeEvent::db_find_by_session(harness.store.pool(), &session_id)
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|event| event.cause == FailureCause::ContentFailure));

    harness.stop().await;
}

// Fallback content failing while already failed over is the one terminal
// content path.
#[tokio::test]
async fn double_content_failure_goes_terminal() {
    let engine = MockEngine::new();
    let harness = start(engine.clone(), true, |_| {}).await;
    let session_id = wait_live(&harness).await;

    harness.raise(Fault::Content {
        detail: "primary died".to_string(),
    });
    assert!(
        wait_until(1000, || async { engine.active_scene_name() == "Failover" }).await,
        "fallback scene was not activated"
    );

    harness.raise(Fault::Content {
        detail: "fallback died too".to_string(),
    });
    assert!(
        wait_until(2000, || async {
            engine.active_scene_name() == "Technical Difficulties"
        })
        .await,
        "terminal scene was not activated"
    );
    let event = DowntimeEvent::db_find_open(harness.store.pool(), &session_id)
        .await
        .unwrap()
        .expect("terminal event must stay open");
    assert!(event.requires_operator);
    assert_eq!(event.cause, FailureCause::ContentFailure);

    harness.stop().await;
}

// Graceful shutdown: one final stop, the session record is closed, nothing
// dangles.
#[tokio::test]
async fn shutdown_stops_streaming_and_finalizes_the_session() {
    let engine = MockEngine::new();
    let harness = start(engine.clone(), true, |_| {}).await;
    let session_id = wait_live(&harness).await;

    let store = harness.stop().await;

    assert!(!engine.is_streaming());
    let session = StreamSession::db_find_by_id(store.pool(), &session_id)
        .await
        .unwrap()
        .unwrap();
    assert!(session.ended_at.is_some());
    assert!(StreamSession::db_find_open(store.pool()).await.unwrap().is_none());
}
