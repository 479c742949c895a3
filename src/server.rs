// ABOUTME: Server state wiring stores, dispatcher, watcher supervisor and listener controller
// ABOUTME: Shared by the HTTP API, the CLI commands and the retention background task

use anyhow::{Context, Result};
use chrono::Utc;
use hookwire_core::config::Config;
use hookwire_core::dispatcher::{ActionExecutor, TriggerDispatcher};
use hookwire_core::facade::FacadeProvider;
use hookwire_core::watcher::WatcherSettings;
use hookwire_core::{
    EventPipeline, EventStore, ListenerInstanceController, TenantConfigStore, TriggerStore,
    WatcherSupervisor,
};
use hookwire_core::DbHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How often the retention task prunes old events
const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Everything the API and background tasks share
pub struct ServerState {
    pub config: Arc<Config>,
    pub events: EventStore,
    pub triggers: TriggerStore,
    pub dispatcher: Arc<TriggerDispatcher>,
    pub supervisor: Arc<WatcherSupervisor>,
    pub listeners: Arc<ListenerInstanceController>,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("config", &self.config)
            .field("events", &"<EventStore>")
            .field("triggers", &"<TriggerStore>")
            .field("supervisor", &"<WatcherSupervisor>")
            .field("listeners", &"<ListenerInstanceController>")
            .finish()
    }
}

impl ServerState {
    /// Open the configured database and wire every component onto it
    pub fn open(
        config: Config,
        provider: Arc<dyn FacadeProvider>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Result<Self> {
        let db = hookwire_core::open_database(&config.database.path)
            .context("Failed to open database")?;
        Self::with_database(config, db, provider, executor)
    }

    pub fn with_database(
        config: Config,
        db: DbHandle,
        provider: Arc<dyn FacadeProvider>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Result<Self> {
        let events = EventStore::new(db.clone());
        events.initialize_schema()?;
        let triggers = TriggerStore::new(db.clone());
        triggers.initialize_schema()?;
        let tenant_configs = TenantConfigStore::new(db);
        tenant_configs.initialize_schema()?;

        let dispatcher = Arc::new(TriggerDispatcher::new(
            triggers.clone(),
            events.clone(),
            executor,
        ));
        let pipeline = Arc::new(EventPipeline::new(events.clone(), Arc::clone(&dispatcher)));
        let supervisor = Arc::new(WatcherSupervisor::new(
            Arc::clone(&provider),
            pipeline,
            WatcherSettings::from(&config.watcher),
        ));
        let listeners = Arc::new(ListenerInstanceController::new(
            tenant_configs,
            provider,
            config.listeners.multi_instance_set(),
        ));

        Ok(Self {
            config: Arc::new(config),
            events,
            triggers,
            dispatcher,
            supervisor,
            listeners,
        })
    }

    /// Start a watcher for every configured tenant
    pub async fn start_watchers(&self) {
        let report = self.supervisor.sync(&self.config.tenants).await;
        tracing::info!(tenants = report.started.len(), "Tenant watchers started");
    }
}

/// Periodically delete events older than `retention.max_age_days`.
/// Returns immediately when retention is not configured.
pub async fn run_retention(state: Arc<ServerState>, cancel: CancellationToken) {
    let Some(days) = state.config.retention.max_age_days else {
        return;
    };
    tracing::info!(max_age_days = days, "Starting event retention task");

    let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        if let Err(e) = state.events.prune_older_than(cutoff) {
            tracing::error!(error = %e, "Event retention pass failed");
        }
    }
}
