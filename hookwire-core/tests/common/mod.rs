// ABOUTME: Shared fixtures for hookwire-core integration tests
// ABOUTME: Scriptable mock facade, counting provider, recording executor and store helpers

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use hookwire_core::dispatcher::ActionExecutor;
use hookwire_core::facade::{
    AuthExpired, ConnectionFacade, ControlResult, FacadeProvider, InstanceAction, SharedFacade,
};
use hookwire_core::{EventStore, IngestedEvent, ResolvedAction, TriggerStore};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Facade whose discovery, poll and control responses are set by the test
#[derive(Default)]
pub struct MockFacade {
    pub connections: Mutex<Vec<String>>,
    pub discovery_error: Mutex<Option<String>>,
    pub events: Mutex<HashMap<String, Vec<IngestedEvent>>>,
    pub poll_errors: Mutex<HashMap<String, String>>,
    /// Connections whose polls are rejected with an expired session
    pub auth_rejected: Mutex<HashSet<String>>,
    /// When set, discovery fails with an auth error until the provider resets
    pub session_expired: AtomicBool,
    pub poll_calls: Mutex<Vec<(String, i64)>>,
    pub control_calls: Mutex<Vec<(String, InstanceAction, Option<String>)>>,
    pub fail_start: Mutex<Option<String>>,
}

impl MockFacade {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_connections(&self, connections: &[&str]) {
        *self.connections.lock().unwrap() = connections.iter().map(|c| c.to_string()).collect();
    }

    pub fn push_events(&self, connection: &str, ids: impl IntoIterator<Item = i64>) {
        let mut events = self.events.lock().unwrap();
        let list = events.entry(connection.to_string()).or_default();
        for id in ids {
            list.push(message(id, connection, &format!("message {}", id)));
        }
    }

    pub fn fail_poll(&self, connection: &str, error: &str) {
        self.poll_errors
            .lock()
            .unwrap()
            .insert(connection.to_string(), error.to_string());
    }

    pub fn heal_poll(&self, connection: &str) {
        self.poll_errors.lock().unwrap().remove(connection);
        self.auth_rejected.lock().unwrap().remove(connection);
    }

    pub fn reject_auth(&self, connection: &str) {
        self.auth_rejected
            .lock()
            .unwrap()
            .insert(connection.to_string());
    }

    pub fn fail_discovery(&self, error: Option<&str>) {
        *self.discovery_error.lock().unwrap() = error.map(str::to_string);
    }

    pub fn polls_for(&self, connection: &str) -> Vec<i64> {
        self.poll_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == connection)
            .map(|(_, after)| *after)
            .collect()
    }

    pub fn controls(&self) -> Vec<(String, InstanceAction, Option<String>)> {
        self.control_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionFacade for MockFacade {
    async fn discover_active_connections(&self, _tenant_id: &str) -> Result<Vec<String>> {
        if self.session_expired.load(Ordering::SeqCst) {
            return Err(AuthExpired::new("session expired").into());
        }
        if let Some(error) = self.discovery_error.lock().unwrap().clone() {
            anyhow::bail!(error);
        }
        Ok(self.connections.lock().unwrap().clone())
    }

    async fn poll(
        &self,
        _tenant_id: &str,
        connection_id: &str,
        after_id: i64,
    ) -> Result<Vec<IngestedEvent>> {
        self.poll_calls
            .lock()
            .unwrap()
            .push((connection_id.to_string(), after_id));
        if self.auth_rejected.lock().unwrap().contains(connection_id) {
            return Err(AuthExpired::new("invalid token").into());
        }
        if let Some(error) = self.poll_errors.lock().unwrap().get(connection_id) {
            anyhow::bail!(error.clone());
        }
        Ok(self
            .events
            .lock()
            .unwrap()
            .get(connection_id)
            .map(|events| events.iter().filter(|e| e.id > after_id).cloned().collect())
            .unwrap_or_default())
    }

    async fn control_instance(
        &self,
        _tenant_id: &str,
        connection_id: &str,
        action: InstanceAction,
        instance_id: Option<&str>,
    ) -> Result<ControlResult> {
        self.control_calls.lock().unwrap().push((
            connection_id.to_string(),
            action,
            instance_id.map(str::to_string),
        ));
        if action == InstanceAction::Start {
            if let Some(error) = self.fail_start.lock().unwrap().clone() {
                return Ok(ControlResult::failed(error));
            }
        }
        Ok(ControlResult::ok())
    }
}

/// Provider over one mock facade that counts resets and clears session expiry
pub struct CountingProvider {
    pub facade: Arc<MockFacade>,
    pub resets: AtomicUsize,
}

impl CountingProvider {
    pub fn new(facade: Arc<MockFacade>) -> Arc<Self> {
        Arc::new(Self {
            facade,
            resets: AtomicUsize::new(0),
        })
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FacadeProvider for CountingProvider {
    async fn facade(&self, _tenant_id: &str) -> Result<SharedFacade> {
        let facade: SharedFacade = self.facade.clone();
        Ok(facade)
    }

    async fn reset(&self, _tenant_id: &str) -> Result<SharedFacade> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.facade.session_expired.store(false, Ordering::SeqCst);
        let facade: SharedFacade = self.facade.clone();
        Ok(facade)
    }
}

/// Executor that records every action it receives
#[derive(Default)]
pub struct RecordingExecutor {
    pub actions: Mutex<Vec<ResolvedAction>>,
    pub fail: AtomicBool,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn actions(&self) -> Vec<ResolvedAction> {
        self.actions.lock().unwrap().clone()
    }

    /// Yield until `count` actions arrived or the budget runs out
    pub async fn wait_for(&self, count: usize) -> Vec<ResolvedAction> {
        for _ in 0..200 {
            if self.actions.lock().unwrap().len() >= count {
                break;
            }
            tokio::task::yield_now().await;
        }
        self.actions()
    }

    /// Sleep-poll until `count` actions arrived or `deadline` passes. For
    /// multi-threaded runtimes where yielding does not run other workers' tasks.
    pub async fn wait_until(&self, count: usize, deadline: Duration) -> Vec<ResolvedAction> {
        let started = tokio::time::Instant::now();
        while self.actions.lock().unwrap().len() < count && started.elapsed() < deadline {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        self.actions()
    }

    pub fn clear(&self) {
        self.actions.lock().unwrap().clear();
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, action: &ResolvedAction) -> Result<()> {
        self.actions.lock().unwrap().push(action.clone());
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("downstream unavailable");
        }
        Ok(())
    }
}

/// Event and trigger stores on one fresh in-memory database
pub fn create_test_stores() -> (EventStore, TriggerStore) {
    let db = hookwire_core::open_in_memory().expect("Failed to open in-memory database");
    let events = EventStore::new(db.clone());
    events.initialize_schema().expect("Failed to init events schema");
    let triggers = TriggerStore::new(db);
    triggers
        .initialize_schema()
        .expect("Failed to init triggers schema");
    (events, triggers)
}

pub fn message(id: i64, source: &str, content: &str) -> IngestedEvent {
    IngestedEvent::new(
        id,
        source,
        "message",
        json!({"content": content, "author": {"username": "ops"}, "channel_id": "alerts"}),
    )
}
