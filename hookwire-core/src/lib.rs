// ABOUTME: Event ingestion, deduplication and trigger dispatch for agent event sources
// ABOUTME: Watchers poll connection facades per tenant, store events once, and fire matching triggers

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod event_store;
pub mod facade;
pub mod filter;
pub mod listener;
pub mod metrics;
pub mod paths;
pub mod pipeline;
pub mod supervisor;
pub mod template;
pub mod trigger;
pub mod watcher;

pub use dispatcher::{ActionExecutor, LogExecutor, TriggerDispatcher};
pub use event::{EventQuery, IngestedEvent, StoredEvent};
pub use event_store::{AppendOutcome, EventStore};
pub use facade::{
    AuthExpired, ConnectionFacade, ControlResult, FacadeProvider, InstanceAction, SharedFacade,
    StaticFacadeProvider,
};
pub use filter::Filter;
pub use listener::{ListenerInstanceController, ListenerState, SetParamsResult, TenantConfigStore};
pub use pipeline::EventPipeline;
pub use supervisor::WatcherSupervisor;
pub use trigger::{
    NewTrigger, ResolvedAction, Trigger, TriggerAction, TriggerStatus, TriggerStore, TriggerUpdate,
};
pub use watcher::{TenantWatcher, WatcherSettings, WatcherStatus};

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared SQLite connection used by every store
pub type DbHandle = Arc<Mutex<Connection>>;

/// Open (or create) the shared SQLite database used by every store.
///
/// WAL mode keeps API reads from blocking watcher appends.
pub fn open_database<P: AsRef<Path>>(path: P) -> Result<DbHandle> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    tracing::info!(db = %path.display(), "Database opened");
    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database for tests and dry runs.
pub fn open_in_memory() -> Result<DbHandle> {
    let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
    Ok(Arc::new(Mutex::new(conn)))
}
