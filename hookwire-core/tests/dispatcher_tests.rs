// ABOUTME: Tests for trigger dispatch through the ingest pipeline
// ABOUTME: Paused triggers, ordering, template resolution, counters and backtests

mod common;

use common::{create_test_stores, message, RecordingExecutor};
use hookwire_core::trigger::NewTrigger;
use hookwire_core::{
    EventPipeline, Filter, TriggerAction, TriggerDispatcher, TriggerStatus, TriggerStore,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn prompt_trigger(store: &TriggerStore, name: &str, filter: Filter) -> String {
    store
        .create(NewTrigger {
            agent_id: "agent-1".to_string(),
            name: name.to_string(),
            filter,
            action: TriggerAction::StartSession {
                prompt: "{{sender}} said: {{text}}".to_string(),
                session: None,
            },
            status: TriggerStatus::Active,
        })
        .expect("Failed to create trigger")
        .id
}

fn pipeline() -> (EventPipeline, TriggerStore, Arc<RecordingExecutor>) {
    let (events, triggers) = create_test_stores();
    let executor = RecordingExecutor::new();
    let dispatcher = Arc::new(TriggerDispatcher::new(
        triggers.clone(),
        events.clone(),
        executor.clone(),
    ));
    (EventPipeline::new(events, dispatcher), triggers, executor)
}

#[tokio::test]
async fn test_matching_event_fires_resolved_action() {
    let (pipeline, triggers, executor) = pipeline();
    let id = prompt_trigger(&triggers, "outage", Filter::contains("down"));

    let outcome = pipeline
        .ingest("alice", &message(1, "discord", "server is down"))
        .unwrap();
    let actions = executor.wait_for(1).await;

    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].trigger_id, id);
    assert_eq!(actions[0].tenant_id, "alice");
    assert_eq!(actions[0].event_id, outcome.event.event_id);
    assert_eq!(
        actions[0].action,
        TriggerAction::StartSession {
            prompt: "ops said: server is down".to_string(),
            session: None,
        }
    );

    let trigger = triggers.get(&id).unwrap().unwrap();
    assert_eq!(trigger.trigger_count, 1);
    assert!(trigger.last_triggered_at.is_some());
}

#[tokio::test]
async fn test_paused_trigger_never_fires() {
    let (pipeline, triggers, executor) = pipeline();
    let id = prompt_trigger(&triggers, "outage", Filter::contains("down"));
    triggers.set_status(&id, TriggerStatus::Paused).unwrap();

    pipeline
        .ingest("alice", &message(1, "discord", "server is down"))
        .unwrap();
    tokio::task::yield_now().await;

    assert!(executor.wait_for(1).await.is_empty());
    assert_eq!(triggers.get(&id).unwrap().unwrap().trigger_count, 0);
}

#[tokio::test]
async fn test_one_dispatch_per_matching_event_in_order() {
    let (pipeline, triggers, executor) = pipeline();
    prompt_trigger(&triggers, "all", Filter::Any);

    let mut stored_ids = Vec::new();
    for id in 1..=5 {
        let outcome = pipeline
            .ingest("alice", &message(id, "telegram", &format!("msg {}", id)))
            .unwrap();
        stored_ids.push(outcome.event.event_id);
    }
    let actions = executor.wait_for(5).await;

    let dispatched: Vec<String> = actions.iter().map(|a| a.event_id.clone()).collect();
    assert_eq!(dispatched, stored_ids);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_dispatch_order_holds_on_multi_thread_runtime() {
    let (pipeline, triggers, executor) = pipeline();
    prompt_trigger(&triggers, "all", Filter::Any);

    for round in 0..10i64 {
        executor.clear();
        let mut stored_ids = Vec::new();
        for id in 1..=200 {
            let outcome = pipeline
                .ingest("alice", &message(round * 1000 + id, "telegram", "tick"))
                .unwrap();
            stored_ids.push(outcome.event.event_id);
        }

        let actions = executor.wait_until(200, Duration::from_secs(10)).await;
        let dispatched: Vec<String> = actions.iter().map(|a| a.event_id.clone()).collect();
        assert_eq!(dispatched, stored_ids, "executor order diverged in round {}", round);
    }
}

#[tokio::test]
async fn test_duplicates_are_not_dispatched() {
    let (pipeline, triggers, executor) = pipeline();
    prompt_trigger(&triggers, "all", Filter::Any);

    let event = message(1, "webhook", "hello").with_idempotency_key("k1");
    assert!(pipeline.ingest("alice", &event).unwrap().stored);
    assert!(!pipeline.ingest("alice", &event).unwrap().stored);

    assert_eq!(executor.wait_for(2).await.len(), 1);
}

#[tokio::test]
async fn test_non_matching_trigger_is_skipped() {
    let (pipeline, triggers, executor) = pipeline();
    let deploy = prompt_trigger(&triggers, "deploys", Filter::contains("deploy"));
    let down = prompt_trigger(&triggers, "outage", Filter::contains("down"));

    pipeline
        .ingest("alice", &message(1, "discord", "server is down"))
        .unwrap();
    let actions = executor.wait_for(2).await;

    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].trigger_id, down);
    assert_eq!(triggers.get(&deploy).unwrap().unwrap().trigger_count, 0);
}

#[tokio::test]
async fn test_updated_filter_takes_effect() {
    let (pipeline, triggers, executor) = pipeline();
    let id = prompt_trigger(&triggers, "t", Filter::contains("deploy"));

    pipeline.ingest("alice", &message(1, "discord", "down")).unwrap();
    triggers
        .update(
            &id,
            hookwire_core::TriggerUpdate {
                filter: Some(Filter::contains("down")),
                ..Default::default()
            },
        )
        .unwrap();
    pipeline.ingest("alice", &message(2, "discord", "down")).unwrap();

    assert_eq!(executor.wait_for(2).await.len(), 1);
}

#[tokio::test]
async fn test_executor_failure_does_not_block_next_event() {
    let (pipeline, triggers, executor) = pipeline();
    executor.fail.store(true, Ordering::SeqCst);
    let id = prompt_trigger(&triggers, "all", Filter::Any);

    pipeline.ingest("alice", &message(1, "a", "one")).unwrap();
    pipeline.ingest("alice", &message(2, "a", "two")).unwrap();

    assert_eq!(executor.wait_for(2).await.len(), 2);
    assert_eq!(triggers.get(&id).unwrap().unwrap().trigger_count, 2);
}

#[tokio::test]
async fn test_backtest_is_read_only() {
    let (events, triggers) = create_test_stores();
    let executor = RecordingExecutor::new();
    let dispatcher = TriggerDispatcher::new(triggers.clone(), events.clone(), executor.clone());
    let id = prompt_trigger(&triggers, "outage", Filter::contains("down"));

    events.append("alice", &message(1, "discord", "server is down")).unwrap();
    events.append("alice", &message(2, "discord", "all good")).unwrap();
    events.append("alice", &message(3, "discord", "db down too")).unwrap();

    let matches = dispatcher.backtest(&Filter::contains("down"), 10).unwrap();
    let ids: Vec<i64> = matches.iter().map(|e| e.source_event_id).collect();
    assert_eq!(ids, vec![3, 1], "newest first");

    let limited = dispatcher.backtest(&Filter::contains("down"), 1).unwrap();
    assert_eq!(limited.len(), 1);

    assert!(executor.wait_for(1).await.is_empty());
    assert_eq!(triggers.get(&id).unwrap().unwrap().trigger_count, 0);
}

#[tokio::test]
async fn test_backtest_rejects_invalid_filter() {
    let (events, triggers) = create_test_stores();
    let dispatcher = TriggerDispatcher::new(triggers, events, RecordingExecutor::new());
    assert!(dispatcher.backtest(&Filter::regex("(unclosed"), 10).is_err());
}
