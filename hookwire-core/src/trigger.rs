// ABOUTME: Trigger registry: per-agent (filter, action) pairs persisted in SQLite
// ABOUTME: Defines trigger actions as a tagged enum and resolves them against matching events

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::event::StoredEvent;
use crate::filter::Filter;
use crate::template::render;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerStatus {
    Active,
    Paused,
}

impl std::fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerStatus::Active => write!(f, "active"),
            TriggerStatus::Paused => write!(f, "paused"),
        }
    }
}

impl FromStr for TriggerStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(TriggerStatus::Active),
            "paused" => Ok(TriggerStatus::Paused),
            _ => anyhow::bail!("Unknown trigger status: {}", s),
        }
    }
}

/// What a trigger asks the execution layer to do. String fields are
/// templates; see [`crate::template::render`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerAction {
    /// Wake the agent with a prompt, optionally in a named session
    StartSession {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    /// Send a message out through a connection
    SendMessage {
        connection: String,
        /// Defaults to the channel the event came from
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        text: String,
    },
    RunCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
    },
}

impl TriggerAction {
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerAction::StartSession { .. } => "start_session",
            TriggerAction::SendMessage { .. } => "send_message",
            TriggerAction::RunCommand { .. } => "run_command",
        }
    }

    /// Interpolate every template field with values from `event`.
    pub fn resolve(&self, event: &StoredEvent) -> TriggerAction {
        match self {
            TriggerAction::StartSession { prompt, session } => TriggerAction::StartSession {
                prompt: render(prompt, event),
                session: session.as_deref().map(|s| render(s, event)),
            },
            TriggerAction::SendMessage {
                connection,
                channel,
                text,
            } => TriggerAction::SendMessage {
                connection: render(connection, event),
                channel: match channel {
                    Some(c) => Some(render(c, event)),
                    None => event.channel(),
                },
                text: render(text, event),
            },
            TriggerAction::RunCommand { command, args } => TriggerAction::RunCommand {
                command: render(command, event),
                args: args.iter().map(|a| render(a, event)).collect(),
            },
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            TriggerAction::StartSession { prompt, .. } if prompt.trim().is_empty() => {
                anyhow::bail!("start_session action needs a prompt")
            }
            TriggerAction::SendMessage {
                connection, text, ..
            } if connection.trim().is_empty() || text.trim().is_empty() => {
                anyhow::bail!("send_message action needs a connection and text")
            }
            TriggerAction::RunCommand { command, .. } if command.trim().is_empty() => {
                anyhow::bail!("run_command action needs a command")
            }
            _ => Ok(()),
        }
    }
}

/// A stored trigger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    pub id: String,
    pub agent_id: String,
    pub name: String,
    pub filter: Filter,
    pub action: TriggerAction,
    pub status: TriggerStatus,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub trigger_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    pub fn is_active(&self) -> bool {
        self.status == TriggerStatus::Active
    }
}

/// Fields needed to create a trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrigger {
    pub agent_id: String,
    pub name: String,
    pub filter: Filter,
    pub action: TriggerAction,
    #[serde(default = "default_status")]
    pub status: TriggerStatus,
}

fn default_status() -> TriggerStatus {
    TriggerStatus::Active
}

/// Partial update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub filter: Option<Filter>,
    #[serde(default)]
    pub action: Option<TriggerAction>,
    #[serde(default)]
    pub status: Option<TriggerStatus>,
}

/// An action ready for the execution layer, with every template resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedAction {
    pub trigger_id: String,
    pub trigger_name: String,
    pub agent_id: String,
    pub tenant_id: String,
    pub event_id: String,
    pub action: TriggerAction,
    pub resolved_at: DateTime<Utc>,
}

const TRIGGER_COLUMNS: &str = "id, agent_id, name, filter, action, status,
     last_triggered_at, trigger_count, created_at, updated_at";

/// Trigger store for database operations
#[derive(Clone)]
pub struct TriggerStore {
    db: Arc<Mutex<Connection>>,
}

impl TriggerStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }

    /// Initialize the database schema
    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS triggers (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                name TEXT NOT NULL,
                filter TEXT NOT NULL,
                action TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                last_triggered_at TEXT,
                trigger_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_triggers_agent ON triggers(agent_id)",
            [],
        )?;

        Ok(())
    }

    /// Create a trigger after validating its filter and action
    pub fn create(&self, new: NewTrigger) -> Result<Trigger> {
        if new.agent_id.trim().is_empty() {
            anyhow::bail!("agent_id is required");
        }
        if new.name.trim().is_empty() {
            anyhow::bail!("Trigger name is required");
        }
        new.filter.validate()?;
        new.action.validate()?;

        let now = now_micros();
        let trigger = Trigger {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: new.agent_id,
            name: new.name,
            filter: new.filter,
            action: new.action,
            status: new.status,
            last_triggered_at: None,
            trigger_count: 0,
            created_at: now,
            updated_at: now,
        };

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO triggers (
                id, agent_id, name, filter, action, status,
                last_triggered_at, trigger_count, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, 0, ?7, ?7)",
            params![
                trigger.id,
                trigger.agent_id,
                trigger.name,
                serde_json::to_string(&trigger.filter)?,
                serde_json::to_string(&trigger.action)?,
                trigger.status.to_string(),
                format_ts(&trigger.created_at),
            ],
        )?;

        tracing::info!(
            trigger_id = %trigger.id,
            agent_id = %trigger.agent_id,
            name = %trigger.name,
            "Trigger created"
        );
        Ok(trigger)
    }

    pub fn get(&self, id: &str) -> Result<Option<Trigger>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {TRIGGER_COLUMNS} FROM triggers WHERE id = ?1");
        Ok(conn.query_row(&sql, [id], row_to_trigger).optional()?)
    }

    /// List triggers, optionally for one agent, oldest first
    pub fn list(&self, agent_id: Option<&str>) -> Result<Vec<Trigger>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers
             WHERE (?1 IS NULL OR agent_id = ?1)
             ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let triggers = stmt
            .query_map(params![agent_id], row_to_trigger)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(triggers)
    }

    /// Active triggers across all agents, in a stable order
    pub fn list_active(&self) -> Result<Vec<Trigger>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers
             WHERE status = 'active'
             ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let triggers = stmt
            .query_map([], row_to_trigger)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(triggers)
    }

    /// Apply a partial update. Returns the updated trigger, or None if it doesn't exist.
    pub fn update(&self, id: &str, update: TriggerUpdate) -> Result<Option<Trigger>> {
        let Some(mut trigger) = self.get(id)? else {
            return Ok(None);
        };

        if let Some(name) = update.name {
            if name.trim().is_empty() {
                anyhow::bail!("Trigger name cannot be empty");
            }
            trigger.name = name;
        }
        if let Some(filter) = update.filter {
            filter.validate()?;
            trigger.filter = filter;
        }
        if let Some(action) = update.action {
            action.validate()?;
            trigger.action = action;
        }
        if let Some(status) = update.status {
            trigger.status = status;
        }
        trigger.updated_at = now_micros();

        let conn = self.conn()?;
        conn.execute(
            "UPDATE triggers
             SET name = ?1, filter = ?2, action = ?3, status = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                trigger.name,
                serde_json::to_string(&trigger.filter)?,
                serde_json::to_string(&trigger.action)?,
                trigger.status.to_string(),
                format_ts(&trigger.updated_at),
                id,
            ],
        )?;
        Ok(Some(trigger))
    }

    /// Pause or resume a trigger
    pub fn set_status(&self, id: &str, status: TriggerStatus) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE triggers SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.to_string(), format_ts(&Utc::now()), id],
        )?;
        Ok(rows > 0)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn.execute("DELETE FROM triggers WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Bump the fire counter and last-fired timestamp
    pub fn record_fire(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE triggers
             SET trigger_count = trigger_count + 1, last_triggered_at = ?1
             WHERE id = ?2",
            params![format_ts(&at), id],
        )
        .with_context(|| format!("Failed to record fire for trigger {}", id))?;
        Ok(())
    }
}

fn row_to_trigger(row: &Row<'_>) -> rusqlite::Result<Trigger> {
    let filter: String = row.get(3)?;
    let action: String = row.get(4)?;
    let status: String = row.get(5)?;
    let last: Option<String> = row.get(6)?;
    let created: String = row.get(8)?;
    let updated: String = row.get(9)?;
    Ok(Trigger {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        name: row.get(2)?,
        filter: serde_json::from_str(&filter).map_err(|e| conversion_error(3, e))?,
        action: serde_json::from_str(&action).map_err(|e| conversion_error(4, e))?,
        status: status
            .parse::<TriggerStatus>()
            .map_err(|e| conversion_error(5, e))?,
        last_triggered_at: last
            .as_deref()
            .map(parse_ts)
            .transpose()
            .map_err(|e| conversion_error(6, e))?,
        trigger_count: row.get(7)?,
        created_at: parse_ts(&created).map_err(|e| conversion_error(8, e))?,
        updated_at: parse_ts(&updated).map_err(|e| conversion_error(9, e))?,
    })
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time truncated to the precision stored in the database.
fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}
