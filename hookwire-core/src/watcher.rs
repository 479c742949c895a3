// ABOUTME: Per-tenant watcher: discovers connections, polls them concurrently, stores events
// ABOUTME: Keeps per-connection cursors and backs off exponentially on tenant-level failure

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backoff::{BackoffConfig, BackoffState};
use crate::config::WatcherConfig;
use crate::event::{IngestedEvent, CURSOR_START};
use crate::facade::{is_auth_failure, FacadeProvider, SharedFacade};
use crate::metrics;
use crate::pipeline::EventPipeline;

/// Timing knobs for a watcher loop
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub backoff: BackoffConfig,
    /// Upper bound on a single discovery or poll call
    pub poll_timeout: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            poll_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&WatcherConfig> for WatcherSettings {
    fn from(config: &WatcherConfig) -> Self {
        Self {
            backoff: config.backoff(),
            poll_timeout: config.poll_timeout(),
        }
    }
}

/// How the last poll cycle went
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// No cycle has completed yet
    Pending,
    /// Discovery returned no connections
    Idle,
    /// Every connection polled cleanly
    Success,
    /// Some connections failed, others made progress. Counts as progress:
    /// backoff resets to base just as for a full success.
    Partial,
    /// Discovery failed or every connection failed
    Failed,
}

impl CycleOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Pending => "pending",
            CycleOutcome::Idle => "idle",
            CycleOutcome::Success => "success",
            CycleOutcome::Partial => "partial",
            CycleOutcome::Failed => "failed",
        }
    }
}

/// Read-only snapshot of a watcher for status views
#[derive(Debug, Clone, Serialize)]
pub struct WatcherStatus {
    pub tenant_id: String,
    pub cursors: BTreeMap<String, i64>,
    pub consecutive_failures: u32,
    pub next_delay_ms: u64,
    pub last_outcome: CycleOutcome,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub cycles: u64,
    pub events_stored: u64,
}

impl WatcherStatus {
    fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            cursors: BTreeMap::new(),
            consecutive_failures: 0,
            next_delay_ms: 0,
            last_outcome: CycleOutcome::Pending,
            last_cycle_at: None,
            last_error: None,
            cycles: 0,
            events_stored: 0,
        }
    }
}

pub type SharedStatus = Arc<RwLock<WatcherStatus>>;

/// Result of one poll cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// How long to sleep before the next cycle
    pub delay: Duration,
    /// Newly stored (non-duplicate) events
    pub stored: usize,
    pub failed_connections: Vec<String>,
    pub auth_failure: bool,
}

/// In-memory state owned by exactly one watcher task
#[derive(Debug)]
pub struct WatcherState {
    tenant_id: String,
    cursors: HashMap<String, i64>,
    backoff: BackoffState,
}

impl WatcherState {
    pub fn new(tenant_id: impl Into<String>, backoff: BackoffConfig) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            cursors: HashMap::new(),
            backoff: BackoffState::new(backoff),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Last id seen on a connection, or [`CURSOR_START`]
    pub fn cursor(&self, connection_id: &str) -> i64 {
        self.cursors
            .get(connection_id)
            .copied()
            .unwrap_or(CURSOR_START)
    }

    /// Move a cursor forward to `id`. Never moves it backwards.
    pub fn advance(&mut self, connection_id: &str, id: i64) -> i64 {
        let cursor = self
            .cursors
            .entry(connection_id.to_string())
            .or_insert(CURSOR_START);
        if id > *cursor {
            *cursor = id;
        }
        *cursor
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.backoff.consecutive_failures()
    }
}

/// Poll loop for a single tenant
pub struct TenantWatcher {
    state: WatcherState,
    provider: Arc<dyn FacadeProvider>,
    pipeline: Arc<EventPipeline>,
    poll_timeout: Duration,
    facade: Option<SharedFacade>,
    status: SharedStatus,
}

enum PollFailure {
    Error { message: String, auth: bool },
    Timeout,
}

impl PollFailure {
    fn from_error(e: &anyhow::Error) -> Self {
        PollFailure::Error {
            message: format!("{:#}", e),
            auth: is_auth_failure(e),
        }
    }
}

impl std::fmt::Display for PollFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollFailure::Error { message, .. } => write!(f, "{}", message),
            PollFailure::Timeout => write!(f, "timed out"),
        }
    }
}

impl TenantWatcher {
    pub fn new(
        tenant_id: impl Into<String>,
        provider: Arc<dyn FacadeProvider>,
        pipeline: Arc<EventPipeline>,
        settings: WatcherSettings,
    ) -> Self {
        let tenant_id = tenant_id.into();
        let status = Arc::new(RwLock::new(WatcherStatus::new(&tenant_id)));
        Self {
            state: WatcherState::new(tenant_id, settings.backoff),
            provider,
            pipeline,
            poll_timeout: settings.poll_timeout,
            facade: None,
            status,
        }
    }

    pub fn tenant_id(&self) -> &str {
        self.state.tenant_id()
    }

    pub fn state(&self) -> &WatcherState {
        &self.state
    }

    pub fn status_handle(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    /// Run cycles until `cancel` fires. Cancellation interrupts both the
    /// in-flight fan-out and the sleep between cycles.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(tenant = %self.tenant_id(), "Watcher started");

        loop {
            let report = tokio::select! {
                _ = cancel.cancelled() => break,
                report = self.run_cycle() => report,
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(report.delay) => {}
            }
        }

        tracing::info!(tenant = %self.tenant_id(), "Watcher stopped");
    }

    /// One discovery + fan-out cycle. Never fails: every error is folded into
    /// the report and the backoff.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let tenant_id = self.state.tenant_id.clone();

        let facade = match self.current_facade().await {
            Ok(facade) => facade,
            Err(e) => {
                let message = e.to_string();
                metrics::record_poll_failure("facade");
                tracing::warn!(tenant = %tenant_id, error = %message, "Could not obtain facade");
                return self.finish_failed(message, Vec::new(), false).await;
            }
        };

        let discovery = tokio::time::timeout(
            self.poll_timeout,
            facade.discover_active_connections(&tenant_id),
        )
        .await;
        let connections = match discovery {
            Ok(Ok(connections)) => connections,
            Ok(Err(e)) => {
                let message = format!("{:#}", e);
                let auth = is_auth_failure(&e);
                metrics::record_poll_failure(if auth { "auth" } else { "discovery" });
                tracing::warn!(tenant = %tenant_id, error = %message, "Connection discovery failed");
                return self.finish_failed(message, Vec::new(), auth).await;
            }
            Err(_) => {
                metrics::record_poll_failure("timeout");
                tracing::warn!(tenant = %tenant_id, "Connection discovery timed out");
                return self
                    .finish_failed("discovery timed out".to_string(), Vec::new(), false)
                    .await;
            }
        };

        if connections.is_empty() {
            tracing::debug!(tenant = %tenant_id, "No active connections");
            let delay = self.state.backoff.record_success();
            return self.finish(CycleOutcome::Idle, delay, 0, Vec::new(), false, None);
        }

        let polls = connections.iter().map(|connection| {
            let facade = Arc::clone(&facade);
            let cursor = self.state.cursor(connection);
            let tenant_id = tenant_id.as_str();
            let timeout = self.poll_timeout;
            async move {
                let result =
                    match tokio::time::timeout(timeout, facade.poll(tenant_id, connection, cursor))
                        .await
                    {
                        Ok(Ok(events)) => Ok(events),
                        Ok(Err(e)) => Err(PollFailure::from_error(&e)),
                        Err(_) => Err(PollFailure::Timeout),
                    };
                (connection.clone(), cursor, result)
            }
        });
        let results = join_all(polls).await;

        let mut stored = 0;
        let mut failed = Vec::new();
        let mut auth_failure = false;
        let mut last_error = None;

        for (connection, cursor, result) in results {
            match result {
                Ok(events) => match self.apply_events(&connection, cursor, events) {
                    Ok(count) => stored += count,
                    Err(e) => {
                        let message = format!("{:#}", e);
                        tracing::error!(
                            tenant = %tenant_id,
                            connection = %connection,
                            error = %message,
                            "Failed to store polled events"
                        );
                        last_error = Some(message);
                        failed.push(connection);
                    }
                },
                Err(failure) => {
                    let message = failure.to_string();
                    let kind = match failure {
                        PollFailure::Timeout => "timeout",
                        PollFailure::Error { auth: true, .. } => {
                            auth_failure = true;
                            "auth"
                        }
                        PollFailure::Error { .. } => "poll",
                    };
                    metrics::record_poll_failure(kind);
                    tracing::warn!(
                        tenant = %tenant_id,
                        connection = %connection,
                        error = %message,
                        "Poll failed"
                    );
                    last_error = Some(message);
                    failed.push(connection);
                }
            }
        }

        if failed.len() == connections.len() {
            let message = last_error.unwrap_or_else(|| "all connections failed".to_string());
            return self.finish_failed(message, failed, auth_failure).await;
        }

        let outcome = if failed.is_empty() {
            CycleOutcome::Success
        } else {
            tracing::info!(
                tenant = %tenant_id,
                failed = ?failed,
                total = connections.len(),
                "Partial poll cycle"
            );
            CycleOutcome::Partial
        };

        let delay = self.state.backoff.record_success();
        if auth_failure {
            self.reset_facade().await;
        }
        self.finish(outcome, delay, stored, failed, auth_failure, last_error)
    }

    /// Store events in id order and advance the cursor over what was stored.
    /// A storage error stops the batch; the cursor stays at the last stored id
    /// so the remainder is fetched again next cycle.
    fn apply_events(
        &mut self,
        connection: &str,
        cursor: i64,
        mut events: Vec<IngestedEvent>,
    ) -> Result<usize> {
        events.sort_by_key(|e| e.id);
        let tenant_id = self.state.tenant_id.clone();
        let mut stored = 0;

        for event in events {
            if event.id <= cursor {
                tracing::debug!(
                    tenant = %tenant_id,
                    connection = %connection,
                    id = event.id,
                    cursor,
                    "Skipping event at or behind cursor"
                );
                continue;
            }
            let outcome = self.pipeline.ingest(&tenant_id, &event)?;
            if outcome.stored {
                stored += 1;
            }
            self.state.advance(connection, event.id);
        }

        if stored > 0 {
            tracing::debug!(
                tenant = %tenant_id,
                connection = %connection,
                stored,
                cursor = self.state.cursor(connection),
                "Stored polled events"
            );
        }
        Ok(stored)
    }

    async fn current_facade(&mut self) -> Result<SharedFacade> {
        if let Some(facade) = &self.facade {
            return Ok(Arc::clone(facade));
        }
        let facade = self
            .provider
            .facade(&self.state.tenant_id)
            .await
            .map_err(|e| anyhow!("Failed to create facade: {:#}", e))?;
        self.facade = Some(Arc::clone(&facade));
        Ok(facade)
    }

    async fn reset_facade(&mut self) {
        self.facade = None;
        metrics::record_facade_reset();
        match self.provider.reset(&self.state.tenant_id).await {
            Ok(facade) => {
                tracing::info!(tenant = %self.state.tenant_id, "Facade reset after auth failure");
                self.facade = Some(facade);
            }
            Err(e) => {
                tracing::warn!(
                    tenant = %self.state.tenant_id,
                    error = %e,
                    "Facade reset failed, will retry next cycle"
                );
            }
        }
    }

    async fn finish_failed(
        &mut self,
        message: String,
        failed: Vec<String>,
        auth_failure: bool,
    ) -> CycleReport {
        let delay = self.state.backoff.record_failure();
        if auth_failure {
            self.reset_facade().await;
        }
        tracing::warn!(
            tenant = %self.state.tenant_id,
            consecutive_failures = self.state.consecutive_failures(),
            delay_ms = delay.as_millis() as u64,
            "Poll cycle failed, backing off"
        );
        self.finish(
            CycleOutcome::Failed,
            delay,
            0,
            failed,
            auth_failure,
            Some(message),
        )
    }

    fn finish(
        &mut self,
        outcome: CycleOutcome,
        delay: Duration,
        stored: usize,
        failed_connections: Vec<String>,
        auth_failure: bool,
        last_error: Option<String>,
    ) -> CycleReport {
        metrics::record_poll_cycle(outcome.as_str());

        let mut status = match self.status.write() {
            Ok(status) => status,
            Err(poisoned) => poisoned.into_inner(),
        };
        status.cursors = self
            .state
            .cursors
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        status.consecutive_failures = self.state.consecutive_failures();
        status.next_delay_ms = delay.as_millis() as u64;
        status.last_outcome = outcome;
        status.last_cycle_at = Some(Utc::now());
        status.last_error = last_error;
        status.cycles += 1;
        status.events_stored += stored as u64;

        CycleReport {
            outcome,
            delay,
            stored,
            failed_connections,
            auth_failure,
        }
    }
}
