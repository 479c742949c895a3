// ABOUTME: Registry of running tenant watchers with start/stop/restart/sync lifecycle
// ABOUTME: Owns one task and cancellation token per tenant; no global state

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::facade::FacadeProvider;
use crate::metrics;
use crate::pipeline::EventPipeline;
use crate::watcher::{SharedStatus, TenantWatcher, WatcherSettings, WatcherStatus};

/// How long `stop` waits for a watcher task to exit before aborting it
const STOP_GRACE: Duration = Duration::from_secs(5);

struct WatcherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    status: SharedStatus,
}

impl WatcherHandle {
    /// Cancel the loop and wait for it to exit, aborting if it lingers
    async fn stop(self, tenant_id: &str) {
        self.cancel.cancel();
        let mut task = self.task;
        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            tracing::warn!(tenant = %tenant_id, "Watcher did not stop in time, aborting");
            task.abort();
        }
    }

    fn snapshot(&self) -> WatcherStatus {
        match self.status.read() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Tenants started and stopped by a [`WatcherSupervisor::sync`] call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
}

/// Owns one watcher per tenant.
pub struct WatcherSupervisor {
    provider: Arc<dyn FacadeProvider>,
    pipeline: Arc<EventPipeline>,
    settings: WatcherSettings,
    watchers: Mutex<HashMap<String, WatcherHandle>>,
}

impl WatcherSupervisor {
    pub fn new(
        provider: Arc<dyn FacadeProvider>,
        pipeline: Arc<EventPipeline>,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            provider,
            pipeline,
            settings,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Start a watcher for `tenant_id`. Returns false if one is already running.
    pub async fn start(&self, tenant_id: &str) -> bool {
        let mut watchers = self.watchers.lock().await;

        if let Some(existing) = watchers.get(tenant_id) {
            if !existing.task.is_finished() {
                tracing::debug!(tenant = %tenant_id, "Watcher already running");
                return false;
            }
            tracing::warn!(tenant = %tenant_id, "Replacing exited watcher");
            watchers.remove(tenant_id);
        }

        let watcher = TenantWatcher::new(
            tenant_id,
            Arc::clone(&self.provider),
            Arc::clone(&self.pipeline),
            self.settings.clone(),
        );
        let status = watcher.status_handle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watcher.run(cancel.clone()));

        watchers.insert(
            tenant_id.to_string(),
            WatcherHandle {
                cancel,
                task,
                status,
            },
        );
        metrics::set_active_watchers(watchers.len());
        true
    }

    /// Stop the tenant's watcher. Returns false if none was running.
    pub async fn stop(&self, tenant_id: &str) -> bool {
        let handle = {
            let mut watchers = self.watchers.lock().await;
            let handle = watchers.remove(tenant_id);
            metrics::set_active_watchers(watchers.len());
            handle
        };

        match handle {
            Some(handle) => {
                handle.stop(tenant_id).await;
                true
            }
            None => false,
        }
    }

    /// Stop then start with fresh cursors and backoff
    pub async fn restart(&self, tenant_id: &str) {
        self.stop(tenant_id).await;
        self.start(tenant_id).await;
        tracing::info!(tenant = %tenant_id, "Watcher restarted");
    }

    /// Converge the running set onto `tenants`: start missing watchers and
    /// stop those no longer listed.
    pub async fn sync(&self, tenants: &[String]) -> SyncReport {
        let running = self.running_tenants().await;
        let mut report = SyncReport::default();

        for tenant in running.iter().filter(|t| !tenants.contains(t)) {
            if self.stop(tenant).await {
                report.stopped.push(tenant.clone());
            }
        }
        for tenant in tenants {
            if self.start(tenant).await {
                report.started.push(tenant.clone());
            }
        }

        if !report.started.is_empty() || !report.stopped.is_empty() {
            tracing::info!(
                started = ?report.started,
                stopped = ?report.stopped,
                "Watchers synced"
            );
        }
        report
    }

    /// Stop every watcher
    pub async fn shutdown(&self) {
        let handles: Vec<(String, WatcherHandle)> = {
            let mut watchers = self.watchers.lock().await;
            let drained = watchers.drain().collect();
            metrics::set_active_watchers(0);
            drained
        };

        let count = handles.len();
        join_all(
            handles
                .into_iter()
                .map(|(tenant, handle)| async move { handle.stop(&tenant).await }),
        )
        .await;
        tracing::info!(count, "All watchers stopped");
    }

    /// Tenants with a live watcher, sorted
    pub async fn running_tenants(&self) -> Vec<String> {
        let watchers = self.watchers.lock().await;
        let mut tenants: Vec<String> = watchers
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(t, _)| t.clone())
            .collect();
        tenants.sort();
        tenants
    }

    pub async fn is_running(&self, tenant_id: &str) -> bool {
        let watchers = self.watchers.lock().await;
        watchers
            .get(tenant_id)
            .map(|h| !h.task.is_finished())
            .unwrap_or(false)
    }

    pub async fn status(&self, tenant_id: &str) -> Option<WatcherStatus> {
        let watchers = self.watchers.lock().await;
        watchers.get(tenant_id).map(WatcherHandle::snapshot)
    }

    /// Status of every watcher, sorted by tenant
    pub async fn statuses(&self) -> Vec<WatcherStatus> {
        let watchers = self.watchers.lock().await;
        let mut all: Vec<WatcherStatus> = watchers.values().map(WatcherHandle::snapshot).collect();
        all.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        all
    }
}
