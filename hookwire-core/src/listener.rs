// ABOUTME: Listener instance controller: persists per-instance params, then restarts the listener
// ABOUTME: Persistence must succeed; a failed restart is reported as a warning, never rolled back

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::facade::{FacadeProvider, InstanceAction};

/// Instance id of the implicit single instance on non-multi connections
pub const DEFAULT_INSTANCE: &str = "default";

/// Warning returned when params were saved but the live instance did not come back
pub const RESTART_FAILED: &str = "restart failed";

/// Lifecycle of a live listener instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Stopped,
    Starting,
    Connected,
    Error,
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerState::Stopped => write!(f, "stopped"),
            ListenerState::Starting => write!(f, "starting"),
            ListenerState::Connected => write!(f, "connected"),
            ListenerState::Error => write!(f, "error"),
        }
    }
}

/// Persisted settings for one instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub disabled: bool,
}

/// One tenant's listener configuration: connection -> instance id -> settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantListenerDocument {
    #[serde(default)]
    pub listeners: BTreeMap<String, BTreeMap<String, InstanceConfig>>,
}

impl TenantListenerDocument {
    fn instance(&self, connection_id: &str, instance_id: &str) -> Option<&InstanceConfig> {
        self.listeners.get(connection_id)?.get(instance_id)
    }

    /// Remove an instance, dropping the connection entry once it is empty
    fn remove(&mut self, connection_id: &str, instance_id: &str) -> bool {
        let Some(instances) = self.listeners.get_mut(connection_id) else {
            return false;
        };
        let removed = instances.remove(instance_id).is_some();
        if instances.is_empty() {
            self.listeners.remove(connection_id);
        }
        removed
    }
}

/// A configured listener instance as seen by callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListenerInstance {
    pub connection_id: String,
    pub instance_id: String,
    pub params: Map<String, Value>,
    pub disabled: bool,
    pub state: ListenerState,
}

/// Outcome of a config mutation. `success` reflects persistence only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetParamsResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SetParamsResult {
    fn ok() -> Self {
        Self {
            success: true,
            warning: None,
            detail: None,
        }
    }

    fn with_warning(warning: &str, detail: String) -> Self {
        Self {
            success: true,
            warning: Some(warning.to_string()),
            detail: Some(detail),
        }
    }
}

/// SQLite-backed storage for tenant listener documents
#[derive(Clone)]
pub struct TenantConfigStore {
    db: Arc<Mutex<Connection>>,
}

impl TenantConfigStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tenant_configs (
                tenant_id TEXT PRIMARY KEY,
                document TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    pub fn load(&self, tenant_id: &str) -> Result<TenantListenerDocument> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT document FROM tenant_configs WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Corrupt listener config for tenant {}", tenant_id)),
            None => Ok(TenantListenerDocument::default()),
        }
    }

    /// Write the document, or delete the row when nothing is left in it
    pub fn save(&self, tenant_id: &str, document: &TenantListenerDocument) -> Result<()> {
        let conn = self.conn()?;
        if document.listeners.is_empty() {
            conn.execute(
                "DELETE FROM tenant_configs WHERE tenant_id = ?1",
                params![tenant_id],
            )?;
            return Ok(());
        }
        conn.execute(
            "INSERT INTO tenant_configs (tenant_id, document, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(tenant_id) DO UPDATE SET
                document = excluded.document,
                updated_at = excluded.updated_at",
            params![
                tenant_id,
                serde_json::to_string(document)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

type InstanceKey = (String, String, String);

/// Applies listener param changes for all tenants.
pub struct ListenerInstanceController {
    store: TenantConfigStore,
    provider: Arc<dyn FacadeProvider>,
    multi_instance: HashSet<String>,
    tenant_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    states: Mutex<HashMap<InstanceKey, ListenerState>>,
}

impl ListenerInstanceController {
    pub fn new(
        store: TenantConfigStore,
        provider: Arc<dyn FacadeProvider>,
        multi_instance: HashSet<String>,
    ) -> Self {
        Self {
            store,
            provider,
            multi_instance,
            tenant_locks: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_multi_instance(&self, connection_id: &str) -> bool {
        self.multi_instance.contains(connection_id)
    }

    /// Replace an instance's params, then restart it.
    ///
    /// `instance_id: None` targets the connection's default instance. Explicit
    /// ids other than the default are only valid on multi-instance connections,
    /// and ids not yet persisted require `create_if_missing`.
    pub async fn set_params(
        &self,
        tenant_id: &str,
        connection_id: &str,
        instance_id: Option<&str>,
        params: Map<String, Value>,
        create_if_missing: bool,
    ) -> Result<SetParamsResult> {
        let instance_id = self.resolve_instance(connection_id, instance_id)?;
        let lock = self.tenant_lock(tenant_id)?;
        let _guard = lock.lock().await;

        let mut document = self.store.load(tenant_id)?;
        let exists = document.instance(connection_id, &instance_id).is_some();
        let implicit = instance_id == DEFAULT_INSTANCE;
        if !exists && !create_if_missing && !implicit {
            anyhow::bail!(
                "Unknown instance '{}' on connection '{}' (pass create_if_missing to create it)",
                instance_id,
                connection_id
            );
        }

        let entry = document
            .listeners
            .entry(connection_id.to_string())
            .or_default()
            .entry(instance_id.clone())
            .or_default();
        entry.params = params;
        let disabled = entry.disabled;

        self.store
            .save(tenant_id, &document)
            .context("Failed to persist listener params")?;
        tracing::info!(
            tenant = %tenant_id,
            connection = %connection_id,
            instance = %instance_id,
            "Listener params saved"
        );

        if disabled {
            return Ok(SetParamsResult::ok());
        }

        match self.restart(tenant_id, connection_id, &instance_id).await {
            Ok(()) => Ok(SetParamsResult::ok()),
            Err(detail) => Ok(SetParamsResult::with_warning(RESTART_FAILED, detail)),
        }
    }

    /// Stop an instance (best effort) and remove it from persisted config.
    /// Returns false if the instance was not configured.
    pub async fn delete_instance(
        &self,
        tenant_id: &str,
        connection_id: &str,
        instance_id: &str,
    ) -> Result<bool> {
        let lock = self.tenant_lock(tenant_id)?;
        let _guard = lock.lock().await;

        let mut document = self.store.load(tenant_id)?;
        if document.instance(connection_id, instance_id).is_none() {
            return Ok(false);
        }

        if let Err(detail) = self.stop(tenant_id, connection_id, instance_id).await {
            tracing::warn!(
                tenant = %tenant_id,
                connection = %connection_id,
                instance = %instance_id,
                error = %detail,
                "Stop before delete failed, removing anyway"
            );
        }

        document.remove(connection_id, instance_id);
        self.store
            .save(tenant_id, &document)
            .context("Failed to persist listener deletion")?;
        self.forget_state(tenant_id, connection_id, instance_id);
        if document.listeners.is_empty() {
            self.release_tenant_lock(tenant_id, &lock);
        }

        tracing::info!(
            tenant = %tenant_id,
            connection = %connection_id,
            instance = %instance_id,
            "Listener instance deleted"
        );
        Ok(true)
    }

    /// Configured instances for a connection. Non-multi connections always
    /// report their default instance, configured or not.
    pub async fn list_instances(
        &self,
        tenant_id: &str,
        connection_id: &str,
    ) -> Result<Vec<ListenerInstance>> {
        let document = self.store.load(tenant_id)?;
        let mut instances: Vec<ListenerInstance> = document
            .listeners
            .get(connection_id)
            .map(|instances| {
                instances
                    .iter()
                    .map(|(id, config)| ListenerInstance {
                        connection_id: connection_id.to_string(),
                        instance_id: id.clone(),
                        params: config.params.clone(),
                        disabled: config.disabled,
                        state: self.instance_state(tenant_id, connection_id, id),
                    })
                    .collect()
            })
            .unwrap_or_default();

        if instances.is_empty() && !self.is_multi_instance(connection_id) {
            instances.push(ListenerInstance {
                connection_id: connection_id.to_string(),
                instance_id: DEFAULT_INSTANCE.to_string(),
                params: Map::new(),
                disabled: false,
                state: self.instance_state(tenant_id, connection_id, DEFAULT_INSTANCE),
            });
        }
        Ok(instances)
    }

    /// Enable or disable an instance. Disabling stops it; enabling starts it.
    pub async fn set_disabled(
        &self,
        tenant_id: &str,
        connection_id: &str,
        instance_id: Option<&str>,
        disabled: bool,
    ) -> Result<SetParamsResult> {
        let instance_id = self.resolve_instance(connection_id, instance_id)?;
        let lock = self.tenant_lock(tenant_id)?;
        let _guard = lock.lock().await;

        let mut document = self.store.load(tenant_id)?;
        if document.instance(connection_id, &instance_id).is_none()
            && instance_id != DEFAULT_INSTANCE
        {
            anyhow::bail!(
                "Unknown instance '{}' on connection '{}'",
                instance_id,
                connection_id
            );
        }
        document
            .listeners
            .entry(connection_id.to_string())
            .or_default()
            .entry(instance_id.clone())
            .or_default()
            .disabled = disabled;
        self.store
            .save(tenant_id, &document)
            .context("Failed to persist listener state")?;

        let applied = if disabled {
            self.stop(tenant_id, connection_id, &instance_id).await
        } else {
            self.restart(tenant_id, connection_id, &instance_id).await
        };
        match applied {
            Ok(()) => Ok(SetParamsResult::ok()),
            Err(detail) if disabled => Ok(SetParamsResult::with_warning("stop failed", detail)),
            Err(detail) => Ok(SetParamsResult::with_warning(RESTART_FAILED, detail)),
        }
    }

    /// Last known live state of an instance
    pub fn instance_state(
        &self,
        tenant_id: &str,
        connection_id: &str,
        instance_id: &str,
    ) -> ListenerState {
        let states = match self.states.lock() {
            Ok(states) => states,
            Err(poisoned) => poisoned.into_inner(),
        };
        states
            .get(&key(tenant_id, connection_id, instance_id))
            .copied()
            .unwrap_or(ListenerState::Stopped)
    }

    fn resolve_instance(&self, connection_id: &str, instance_id: Option<&str>) -> Result<String> {
        match instance_id.map(str::trim) {
            None | Some("") => Ok(DEFAULT_INSTANCE.to_string()),
            Some(DEFAULT_INSTANCE) => Ok(DEFAULT_INSTANCE.to_string()),
            Some(id) if self.is_multi_instance(connection_id) => Ok(id.to_string()),
            Some(id) => anyhow::bail!(
                "Connection '{}' does not support multiple instances (got instance '{}')",
                connection_id,
                id
            ),
        }
    }

    /// Instance argument sent to the facade: none for the implicit default
    fn facade_instance<'a>(&self, connection_id: &str, instance_id: &'a str) -> Option<&'a str> {
        if instance_id == DEFAULT_INSTANCE && !self.is_multi_instance(connection_id) {
            None
        } else {
            Some(instance_id)
        }
    }

    /// Stop (tolerating failure) then start. Errors carry the start failure.
    async fn restart(
        &self,
        tenant_id: &str,
        connection_id: &str,
        instance_id: &str,
    ) -> std::result::Result<(), String> {
        if let Err(detail) = self.stop(tenant_id, connection_id, instance_id).await {
            tracing::debug!(
                tenant = %tenant_id,
                connection = %connection_id,
                instance = %instance_id,
                error = %detail,
                "Stop during restart failed, continuing"
            );
        }

        self.set_state(tenant_id, connection_id, instance_id, ListenerState::Starting);
        let result = self
            .control(tenant_id, connection_id, instance_id, InstanceAction::Start)
            .await;
        match &result {
            Ok(()) => {
                self.set_state(tenant_id, connection_id, instance_id, ListenerState::Connected);
                tracing::info!(
                    tenant = %tenant_id,
                    connection = %connection_id,
                    instance = %instance_id,
                    "Listener restarted"
                );
            }
            Err(detail) => {
                self.set_state(tenant_id, connection_id, instance_id, ListenerState::Error);
                tracing::warn!(
                    tenant = %tenant_id,
                    connection = %connection_id,
                    instance = %instance_id,
                    error = %detail,
                    "Listener restart failed"
                );
            }
        }
        result
    }

    async fn stop(
        &self,
        tenant_id: &str,
        connection_id: &str,
        instance_id: &str,
    ) -> std::result::Result<(), String> {
        let result = self
            .control(tenant_id, connection_id, instance_id, InstanceAction::Stop)
            .await;
        self.set_state(tenant_id, connection_id, instance_id, ListenerState::Stopped);
        result
    }

    async fn control(
        &self,
        tenant_id: &str,
        connection_id: &str,
        instance_id: &str,
        action: InstanceAction,
    ) -> std::result::Result<(), String> {
        let facade = self
            .provider
            .facade(tenant_id)
            .await
            .map_err(|e| format!("{:#}", e))?;
        let instance = self.facade_instance(connection_id, instance_id);
        match facade
            .control_instance(tenant_id, connection_id, action, instance)
            .await
        {
            Ok(result) if result.success => Ok(()),
            Ok(result) => Err(result
                .error
                .unwrap_or_else(|| format!("{} rejected", action))),
            Err(e) => Err(format!("{:#}", e)),
        }
    }

    fn tenant_lock(&self, tenant_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .tenant_locks
            .lock()
            .map_err(|e| anyhow::anyhow!("Tenant lock map poisoned: {}", e))?;
        Ok(Arc::clone(locks.entry(tenant_id.to_string()).or_default()))
    }

    /// Drop the tenant's lock entry when nobody else holds or waits on it.
    /// Called with the guard still held; the map lock keeps new callers from
    /// cloning the entry while the count is checked.
    fn release_tenant_lock(&self, tenant_id: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        if let Ok(mut locks) = self.tenant_locks.lock() {
            let idle = locks
                .get(tenant_id)
                .is_some_and(|held| Arc::ptr_eq(held, lock) && Arc::strong_count(lock) == 2);
            if idle {
                locks.remove(tenant_id);
            }
        }
    }

    fn set_state(&self, tenant_id: &str, connection_id: &str, instance_id: &str, state: ListenerState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(key(tenant_id, connection_id, instance_id), state);
        }
    }

    fn forget_state(&self, tenant_id: &str, connection_id: &str, instance_id: &str) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(&key(tenant_id, connection_id, instance_id));
        }
    }
}

fn key(tenant_id: &str, connection_id: &str, instance_id: &str) -> InstanceKey {
    (
        tenant_id.to_string(),
        connection_id.to_string(),
        instance_id.to_string(),
    )
}
