// ABOUTME: Integration tests for the event store
// ABOUTME: Concurrent dedup, newest-first paging, source listing and file-backed persistence

mod common;

use common::{create_test_stores, message};
use hookwire_core::{EventQuery, EventStore};
use std::collections::BTreeSet;
use std::sync::Arc;

#[test]
fn test_concurrent_appends_with_same_key_store_once() {
    let (events, _) = create_test_stores();
    let events = Arc::new(events);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let events = Arc::clone(&events);
            std::thread::spawn(move || {
                let event = message(i, "webhook", "payload").with_idempotency_key("delivery-42");
                events.append("alice", &event).unwrap()
            })
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let stored: Vec<_> = outcomes.iter().filter(|o| o.stored).collect();
    assert_eq!(stored.len(), 1);

    let winner = &stored[0].event.event_id;
    assert!(outcomes.iter().all(|o| &o.event.event_id == winner));
    assert_eq!(events.count(None).unwrap(), 1);
}

#[test]
fn test_append_twice_yields_one_row() {
    let (events, _) = create_test_stores();
    let event = message(1, "webhook", "hello").with_idempotency_key("k");

    let first = events.append("alice", &event).unwrap();
    let second = events.append("alice", &event).unwrap();

    assert!(first.stored);
    assert!(!second.stored);
    assert_eq!(first.event.event_id, second.event.event_id);
    assert_eq!(events.count(None).unwrap(), 1);
}

#[test]
fn test_blank_key_is_not_deduplicated() {
    let (events, _) = create_test_stores();
    let event = message(1, "webhook", "hello").with_idempotency_key("  ");

    assert!(events.append("alice", &event).unwrap().stored);
    assert!(events.append("alice", &event).unwrap().stored);
    assert_eq!(events.count(None).unwrap(), 2);
}

#[test]
fn test_query_is_newest_first_with_paging() {
    let (events, _) = create_test_stores();
    for id in 1..=5 {
        events.append("alice", &message(id, "telegram", "m")).unwrap();
    }
    events.append("bob", &message(1, "discord", "m")).unwrap();

    let telegram = events.query(&EventQuery::for_source("telegram")).unwrap();
    let ids: Vec<i64> = telegram.iter().map(|e| e.source_event_id).collect();
    assert_eq!(ids, vec![5, 4, 3, 2, 1]);

    let page = events
        .query(&EventQuery::for_source("telegram").page(2, 1))
        .unwrap();
    let ids: Vec<i64> = page.iter().map(|e| e.source_event_id).collect();
    assert_eq!(ids, vec![4, 3]);

    let all = events.query(&EventQuery::default()).unwrap();
    assert_eq!(all[0].source, "discord");
    assert_eq!(all.len(), 6);

    let bob = events
        .query(&EventQuery {
            tenant_id: Some("bob".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(bob.len(), 1);
}

#[test]
fn test_list_sources() {
    let (events, _) = create_test_stores();
    assert!(events.list_sources().unwrap().is_empty());

    events.append("alice", &message(1, "telegram", "m")).unwrap();
    events.append("alice", &message(2, "telegram", "m")).unwrap();
    events.append("alice", &message(1, "discord", "m")).unwrap();

    let expected: BTreeSet<String> = ["discord", "telegram"].iter().map(|s| s.to_string()).collect();
    assert_eq!(events.list_sources().unwrap(), expected);
}

#[test]
fn test_events_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("hookwire.db");

    {
        let store = EventStore::new(hookwire_core::open_database(&path).unwrap());
        store.initialize_schema().unwrap();
        store
            .append("alice", &message(7, "slack", "kept").with_idempotency_key("k7"))
            .unwrap();
    }

    let store = EventStore::new(hookwire_core::open_database(&path).unwrap());
    store.initialize_schema().unwrap();
    let again = store
        .append("alice", &message(7, "slack", "kept").with_idempotency_key("k7"))
        .unwrap();
    assert!(!again.stored, "dedup must hold across restarts");
    assert_eq!(store.count(Some("slack")).unwrap(), 1);
}
