// ABOUTME: Append-only, deduplicated event log backed by SQLite
// ABOUTME: Dedups on idempotency key, serves newest-first queries by source and tenant

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::event::{EventQuery, IngestedEvent, StoredEvent, MAX_QUERY_LIMIT};
use crate::metrics;

/// Result of an append: whether a new row was written, and the stored event
/// (the pre-existing one when the idempotency key was already recorded).
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub stored: bool,
    pub event: StoredEvent,
}

const EVENT_COLUMNS: &str = "event_id, tenant_id, source_event_id, idempotency_key,
     received_at, stored_at, source, event_type, data";

/// Event store for database operations
#[derive(Clone)]
pub struct EventStore {
    db: Arc<Mutex<Connection>>,
}

impl EventStore {
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
            "CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL UNIQUE,
                tenant_id TEXT NOT NULL,
                source_event_id INTEGER NOT NULL,
                idempotency_key TEXT,
                received_at TEXT NOT NULL,
                stored_at TEXT NOT NULL,
                source TEXT NOT NULL,
                event_type TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            [],
        )?;

        // Backstop for the dedup check in append()
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_events_idempotency_key
             ON events(idempotency_key)
             WHERE idempotency_key IS NOT NULL",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_source
             ON events(source, stored_at)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_stored_at
             ON events(stored_at)",
            [],
        )?;

        Ok(())
    }

    /// Append an event for a tenant.
    ///
    /// The dedup lookup and the insert run under the same connection lock, so
    /// concurrent appends with the same idempotency key yield exactly one row.
    /// `stored_at` never goes backwards, which keeps stored_at order equal to
    /// insertion order.
    pub fn append(&self, tenant_id: &str, event: &IngestedEvent) -> Result<AppendOutcome> {
        let conn = self.conn()?;
        let key = event.dedup_key();

        if let Some(key) = key {
            if let Some(existing) = select_by_key(&conn, key)? {
                metrics::record_event_duplicate(&event.source);
                tracing::debug!(
                    tenant = %tenant_id,
                    source = %event.source,
                    idempotency_key = %key,
                    "Duplicate event absorbed"
                );
                return Ok(AppendOutcome {
                    stored: false,
                    event: existing,
                });
            }
        }

        let last: Option<String> = conn
            .query_row(
                "SELECT stored_at FROM events ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let mut stored_at = Utc::now();
        if let Some(last) = last.as_deref().and_then(|s| parse_ts(s).ok()) {
            if last > stored_at {
                stored_at = last;
            }
        }

        let stored = StoredEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            source_event_id: event.id,
            idempotency_key: key.map(str::to_string),
            received_at: event.received_at,
            stored_at,
            source: event.source.clone(),
            event_type: event.event_type.clone(),
            data: event.data.clone(),
        };

        let rows = conn.execute(
            "INSERT OR IGNORE INTO events (
                event_id, tenant_id, source_event_id, idempotency_key,
                received_at, stored_at, source, event_type, data
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                stored.event_id,
                stored.tenant_id,
                stored.source_event_id,
                stored.idempotency_key,
                format_ts(&stored.received_at),
                format_ts(&stored.stored_at),
                stored.source,
                stored.event_type,
                serde_json::to_string(&stored.data)?,
            ],
        )?;

        if rows == 0 {
            // Another process won the race on the unique index
            if let Some(key) = key {
                if let Some(existing) = select_by_key(&conn, key)? {
                    metrics::record_event_duplicate(&event.source);
                    return Ok(AppendOutcome {
                        stored: false,
                        event: existing,
                    });
                }
            }
            anyhow::bail!("Event insert was ignored for source {}", event.source);
        }

        metrics::record_event_ingested(&event.source);
        Ok(AppendOutcome {
            stored: true,
            event: stored,
        })
    }

    /// Newest-first page of events, optionally restricted to a source and tenant.
    pub fn query(&self, query: &EventQuery) -> Result<Vec<StoredEvent>> {
        let conn = self.conn()?;
        let limit = query.limit.min(MAX_QUERY_LIMIT) as i64;
        let offset = query.offset as i64;

        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE (?1 IS NULL OR source = ?1)
               AND (?2 IS NULL OR tenant_id = ?2)
             ORDER BY stored_at DESC, seq DESC
             LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(
                params![query.source, query.tenant_id, limit, offset],
                row_to_event,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// The most recent `limit` events across all sources, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        self.query(&EventQuery::default().page(limit, 0))
    }

    /// Distinct connection ids that have produced at least one event.
    pub fn list_sources(&self) -> Result<BTreeSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT source FROM events")?;
        let sources = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(sources)
    }

    /// Get an event by its durable id
    pub fn get(&self, event_id: &str) -> Result<Option<StoredEvent>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = ?1");
        let event = conn
            .query_row(&sql, [event_id], row_to_event)
            .optional()?;
        Ok(event)
    }

    pub fn count(&self, source: Option<&str>) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE (?1 IS NULL OR source = ?1)",
            params![source],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Delete events stored before `cutoff`. Returns the number of rows removed.
    ///
    /// Pruning also forgets the idempotency keys of removed rows, so a source
    /// redelivering very old events after pruning will store them again.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "DELETE FROM events WHERE stored_at < ?1",
                params![format_ts(&cutoff)],
            )
            .context("Failed to prune events")?;
        if rows > 0 {
            tracing::info!(rows, cutoff = %cutoff, "Pruned old events");
        }
        Ok(rows)
    }
}

fn select_by_key(conn: &Connection, key: &str) -> Result<Option<StoredEvent>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE idempotency_key = ?1");
    Ok(conn.query_row(&sql, [key], row_to_event).optional()?)
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<StoredEvent> {
    let received_at: String = row.get(4)?;
    let stored_at: String = row.get(5)?;
    let data: String = row.get(8)?;
    Ok(StoredEvent {
        event_id: row.get(0)?,
        tenant_id: row.get(1)?,
        source_event_id: row.get(2)?,
        idempotency_key: row.get(3)?,
        received_at: parse_ts(&received_at).map_err(|e| conversion_error(4, e))?,
        stored_at: parse_ts(&stored_at).map_err(|e| conversion_error(5, e))?,
        source: row.get(6)?,
        event_type: row.get(7)?,
        data: serde_json::from_str(&data).map_err(|e| conversion_error(8, e))?,
    })
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}
