// ABOUTME: Tests for the per-tenant watcher and the watcher supervisor
// ABOUTME: Covers cursors, concurrent fan-out isolation, backoff, auth reset and lifecycle

mod common;

use common::{create_test_stores, CountingProvider, MockFacade};
use hookwire_core::backoff::BackoffConfig;
use hookwire_core::event::CURSOR_START;
use hookwire_core::watcher::{CycleOutcome, TenantWatcher, WatcherSettings};
use hookwire_core::{EventPipeline, EventQuery, EventStore, WatcherSupervisor};
use std::sync::Arc;
use std::time::Duration;

fn settings(base_ms: u64, ceiling_ms: u64) -> WatcherSettings {
    WatcherSettings {
        backoff: BackoffConfig {
            base: Duration::from_millis(base_ms),
            ceiling: Duration::from_millis(ceiling_ms),
            multiplier: 2,
        },
        poll_timeout: Duration::from_secs(5),
    }
}

fn watcher_for(facade: &Arc<MockFacade>) -> (TenantWatcher, EventStore, Arc<CountingProvider>) {
    let (events, _) = create_test_stores();
    let provider = CountingProvider::new(facade.clone());
    let pipeline = Arc::new(EventPipeline::store_only(events.clone()));
    let watcher = TenantWatcher::new("alice", provider.clone(), pipeline, settings(100, 1000));
    (watcher, events, provider)
}

// ============================================================================
// Cursor behaviour
// ============================================================================

#[tokio::test]
async fn scenario_a_first_poll_stores_and_advances_cursor() {
    let facade = MockFacade::new();
    facade.set_connections(&["telegram"]);
    facade.push_events("telegram", [1, 2]);
    let (mut watcher, events, _) = watcher_for(&facade);

    let report = watcher.run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::Success);
    assert_eq!(report.stored, 2);
    assert_eq!(facade.polls_for("telegram"), vec![CURSOR_START]);
    assert_eq!(watcher.state().cursor("telegram"), 2);
    assert_eq!(events.count(Some("telegram")).unwrap(), 2);
}

#[tokio::test]
async fn test_next_poll_uses_advanced_cursor() {
    let facade = MockFacade::new();
    facade.set_connections(&["telegram"]);
    facade.push_events("telegram", [1, 2]);
    let (mut watcher, events, _) = watcher_for(&facade);

    watcher.run_cycle().await;
    facade.push_events("telegram", [3]);
    let report = watcher.run_cycle().await;

    assert_eq!(report.stored, 1);
    assert_eq!(facade.polls_for("telegram"), vec![CURSOR_START, 2]);
    assert_eq!(watcher.state().cursor("telegram"), 3);
    assert_eq!(events.count(None).unwrap(), 3);
}

#[tokio::test]
async fn test_cursor_never_regresses_on_stale_response() {
    let facade = MockFacade::new();
    facade.set_connections(&["telegram"]);
    facade.push_events("telegram", [5, 6]);
    let (mut watcher, _, _) = watcher_for(&facade);
    watcher.run_cycle().await;
    assert_eq!(watcher.state().cursor("telegram"), 6);

    // An empty response and a failing poll both leave the cursor alone
    watcher.run_cycle().await;
    assert_eq!(watcher.state().cursor("telegram"), 6);
    facade.fail_poll("telegram", "connection reset");
    watcher.run_cycle().await;
    assert_eq!(watcher.state().cursor("telegram"), 6);
}

#[tokio::test]
async fn scenario_b_connections_are_isolated() {
    let facade = MockFacade::new();
    facade.set_connections(&["a", "b"]);
    facade.push_events("a", 1..=100);
    facade.push_events("b", 1..=2);
    let (mut watcher, events, _) = watcher_for(&facade);

    watcher.run_cycle().await;

    assert_eq!(watcher.state().cursor("a"), 100);
    assert_eq!(watcher.state().cursor("b"), 2);
    assert_eq!(events.count(Some("b")).unwrap(), 2);
    assert_eq!(events.count(Some("a")).unwrap(), 100);
}

#[tokio::test]
async fn test_partial_failure_keeps_healthy_connection_progressing() {
    let facade = MockFacade::new();
    facade.set_connections(&["a", "b"]);
    facade.push_events("a", [1, 2, 3]);
    facade.push_events("b", [1]);
    facade.fail_poll("b", "503 service unavailable");
    let (mut watcher, events, _) = watcher_for(&facade);

    let report = watcher.run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::Partial);
    assert_eq!(report.failed_connections, vec!["b".to_string()]);
    assert_eq!(report.delay, Duration::from_millis(100), "partial cycle stays at base");
    assert_eq!(watcher.state().cursor("a"), 3);
    assert_eq!(watcher.state().cursor("b"), CURSOR_START);
    assert_eq!(events.count(Some("a")).unwrap(), 3);

    facade.heal_poll("b");
    watcher.run_cycle().await;
    assert_eq!(watcher.state().cursor("b"), 1);
}

#[tokio::test]
async fn test_partial_cycle_resets_grown_backoff() {
    let facade = MockFacade::new();
    facade.set_connections(&["a", "b"]);
    facade.fail_poll("a", "connection refused");
    facade.fail_poll("b", "connection refused");
    let (mut watcher, _, _) = watcher_for(&facade);

    assert_eq!(watcher.run_cycle().await.delay, Duration::from_millis(100));
    assert_eq!(watcher.run_cycle().await.delay, Duration::from_millis(200));
    assert_eq!(watcher.state().consecutive_failures(), 2);

    facade.heal_poll("a");
    let report = watcher.run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::Partial);
    assert_eq!(report.delay, Duration::from_millis(100));
    assert_eq!(watcher.state().consecutive_failures(), 0);
}

#[tokio::test]
async fn test_duplicate_keys_across_cycles_store_once() {
    let facade = MockFacade::new();
    facade.set_connections(&["webhook"]);
    {
        let mut events = facade.events.lock().unwrap();
        let list = events.entry("webhook".to_string()).or_default();
        list.push(common::message(1, "webhook", "first").with_idempotency_key("delivery-1"));
        list.push(common::message(2, "webhook", "retry").with_idempotency_key("delivery-1"));
    }
    let (mut watcher, events, _) = watcher_for(&facade);

    let report = watcher.run_cycle().await;

    assert_eq!(report.stored, 1);
    assert_eq!(watcher.state().cursor("webhook"), 2);
    assert_eq!(events.count(None).unwrap(), 1);
    let stored = events.query(&EventQuery::default()).unwrap();
    assert_eq!(stored[0].source_event_id, 1);
}

// ============================================================================
// Backoff and failure handling
// ============================================================================

#[tokio::test]
async fn scenario_e_backoff_doubles_then_resets() {
    let facade = MockFacade::new();
    facade.fail_discovery(Some("connection refused"));
    let (mut watcher, _, _) = watcher_for(&facade);

    let mut delays = Vec::new();
    for _ in 0..5 {
        let report = watcher.run_cycle().await;
        assert_eq!(report.outcome, CycleOutcome::Failed);
        delays.push(report.delay.as_millis() as u64);
    }
    assert_eq!(delays, vec![100, 200, 400, 800, 1000]);
    assert_eq!(watcher.state().consecutive_failures(), 5);

    facade.fail_discovery(None);
    facade.set_connections(&["telegram"]);
    let report = watcher.run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::Success);
    assert_eq!(report.delay, Duration::from_millis(100));
    assert_eq!(watcher.state().consecutive_failures(), 0);
}

#[tokio::test]
async fn test_all_connections_failing_is_tenant_failure() {
    let facade = MockFacade::new();
    facade.set_connections(&["a", "b"]);
    facade.fail_poll("a", "timeout");
    facade.fail_poll("b", "timeout");
    let (mut watcher, _, _) = watcher_for(&facade);

    let first = watcher.run_cycle().await;
    let second = watcher.run_cycle().await;

    assert_eq!(first.outcome, CycleOutcome::Failed);
    assert_eq!(first.delay, Duration::from_millis(100));
    assert_eq!(second.delay, Duration::from_millis(200));
}

#[tokio::test]
async fn test_no_connections_polls_discovery_at_base() {
    let facade = MockFacade::new();
    let (mut watcher, _, _) = watcher_for(&facade);

    for _ in 0..3 {
        let report = watcher.run_cycle().await;
        assert_eq!(report.outcome, CycleOutcome::Idle);
        assert_eq!(report.delay, Duration::from_millis(100));
    }
    assert!(facade.poll_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_auth_failure_resets_facade_before_next_cycle() {
    let facade = MockFacade::new();
    facade.set_connections(&["telegram"]);
    facade.push_events("telegram", [1]);
    facade
        .session_expired
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let (mut watcher, events, provider) = watcher_for(&facade);

    let report = watcher.run_cycle().await;
    assert!(report.auth_failure);
    assert_eq!(report.outcome, CycleOutcome::Failed);
    assert_eq!(provider.reset_count(), 1);

    let report = watcher.run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::Success);
    assert_eq!(events.count(None).unwrap(), 1);
    assert_eq!(provider.reset_count(), 1);
}

#[tokio::test]
async fn test_auth_failure_on_one_connection_also_resets() {
    let facade = MockFacade::new();
    facade.set_connections(&["a", "b"]);
    facade.reject_auth("b");
    let (mut watcher, _, provider) = watcher_for(&facade);

    let report = watcher.run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::Partial);
    assert!(report.auth_failure);
    assert_eq!(provider.reset_count(), 1);
}

#[tokio::test]
async fn test_transport_error_mentioning_status_digits_does_not_reset() {
    let facade = MockFacade::new();
    facade.set_connections(&["shop-4031"]);
    facade.fail_poll(
        "shop-4031",
        "Failed to poll shop-4031: error sending request: connection reset by peer",
    );
    let (mut watcher, _, provider) = watcher_for(&facade);

    let report = watcher.run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::Failed);
    assert!(!report.auth_failure);
    assert_eq!(provider.reset_count(), 0);
}

// ============================================================================
// Supervisor lifecycle
// ============================================================================

fn supervisor_for(facade: &Arc<MockFacade>) -> (WatcherSupervisor, EventStore) {
    let (events, _) = create_test_stores();
    let provider = CountingProvider::new(facade.clone());
    let pipeline = Arc::new(EventPipeline::store_only(events.clone()));
    (
        WatcherSupervisor::new(provider, pipeline, settings(1000, 8000)),
        events,
    )
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_start_is_idempotent() {
    let facade = MockFacade::new();
    facade.set_connections(&["telegram"]);
    facade.push_events("telegram", [1, 2]);
    let (supervisor, events) = supervisor_for(&facade);

    assert!(supervisor.start("alice").await);
    assert!(!supervisor.start("alice").await);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(supervisor.running_tenants().await, vec!["alice".to_string()]);
    assert_eq!(events.count(None).unwrap(), 2);
    assert_eq!(facade.polls_for("telegram"), vec![CURSOR_START]);

    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_loop_rearms_once_per_interval() {
    let facade = MockFacade::new();
    facade.set_connections(&["telegram"]);
    let (supervisor, _) = supervisor_for(&facade);

    supervisor.start("alice").await;
    tokio::time::sleep(Duration::from_millis(3500)).await;

    // Cycles at t=0, 1s, 2s, 3s
    assert_eq!(facade.polls_for("telegram").len(), 4);
    let status = supervisor.status("alice").await.unwrap();
    assert_eq!(status.cycles, 4);
    assert_eq!(status.last_outcome, CycleOutcome::Success);

    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_backoff_spaces_out_failed_cycles() {
    let facade = MockFacade::new();
    facade.fail_discovery(Some("connection refused"));
    let (supervisor, _) = supervisor_for(&facade);

    supervisor.start("alice").await;
    // Failures at t=0, 1s, 3s, 7s; the next is due at 15s
    tokio::time::sleep(Duration::from_millis(8000)).await;

    let status = supervisor.status("alice").await.unwrap();
    assert_eq!(status.cycles, 4);
    assert_eq!(status.consecutive_failures, 4);
    assert_eq!(status.next_delay_ms, 8000);
    assert_eq!(status.last_outcome, CycleOutcome::Failed);

    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_loop_and_is_repeatable() {
    let facade = MockFacade::new();
    facade.set_connections(&["telegram"]);
    let (supervisor, _) = supervisor_for(&facade);

    supervisor.start("alice").await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(supervisor.stop("alice").await);
    assert!(!supervisor.stop("alice").await);

    let polls = facade.polls_for("telegram").len();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(facade.polls_for("telegram").len(), polls, "no polls after stop");
    assert!(supervisor.running_tenants().await.is_empty());
    assert!(supervisor.status("alice").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_restart_begins_with_fresh_cursors() {
    let facade = MockFacade::new();
    facade.set_connections(&["telegram"]);
    facade.push_events("telegram", [1, 2]);
    let (supervisor, _) = supervisor_for(&facade);

    supervisor.start("alice").await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    supervisor.restart("alice").await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(facade.polls_for("telegram"), vec![CURSOR_START, CURSOR_START]);
    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sync_starts_missing_and_stops_removed() {
    let facade = MockFacade::new();
    let (supervisor, _) = supervisor_for(&facade);

    supervisor.start("alice").await;
    supervisor.start("bob").await;

    let report = supervisor
        .sync(&["bob".to_string(), "carol".to_string()])
        .await;

    assert_eq!(report.started, vec!["carol".to_string()]);
    assert_eq!(report.stopped, vec!["alice".to_string()]);
    assert_eq!(
        supervisor.running_tenants().await,
        vec!["bob".to_string(), "carol".to_string()]
    );

    supervisor.shutdown().await;
    assert!(supervisor.running_tenants().await.is_empty());
}
