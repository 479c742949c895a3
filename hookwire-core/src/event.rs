// ABOUTME: Event types flowing through the ingestion pipeline
// ABOUTME: IngestedEvent comes from a connection facade, StoredEvent is what the event store persists

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cursor value meaning "nothing seen yet, start from the beginning".
pub const CURSOR_START: i64 = -1;

/// An event as returned by a connection facade poll.
///
/// `id` is monotonic only within one (tenant, connection) pair. Ids from
/// different connections must never be compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedEvent {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub received_at: DateTime<Utc>,
    /// Connection id the event came from
    pub source: String,
    pub event_type: String,
    /// Opaque payload; interpreted only by filters and action templates
    #[serde(default)]
    pub data: serde_json::Value,
}

impl IngestedEvent {
    pub fn new(
        id: i64,
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id,
            idempotency_key: None,
            received_at: Utc::now(),
            source: source.into(),
            event_type: event_type.into(),
            data,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// The idempotency key if it can be used for dedup (present and non-blank).
    pub fn dedup_key(&self) -> Option<&str> {
        self.idempotency_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
    }
}

/// A persisted event. `event_id` is the durable identity assigned by the store;
/// `source_event_id` is the facade's per-connection id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: String,
    pub tenant_id: String,
    pub source_event_id: i64,
    pub idempotency_key: Option<String>,
    pub received_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
    pub source: String,
    pub event_type: String,
    pub data: serde_json::Value,
}

impl StoredEvent {
    /// Look up a dotted path inside the event.
    ///
    /// Top-level names (`source`, `event_type`, `tenant_id`, `event_id`) resolve
    /// to the envelope; `data.x.y` (or a bare `x.y`) walks the payload.
    pub fn field(&self, path: &str) -> Option<serde_json::Value> {
        match path {
            "source" => return Some(self.source.clone().into()),
            "event_type" | "type" => return Some(self.event_type.clone().into()),
            "tenant_id" | "tenant" => return Some(self.tenant_id.clone().into()),
            "event_id" => return Some(self.event_id.clone().into()),
            "id" | "source_event_id" => return Some(self.source_event_id.into()),
            "idempotency_key" => return self.idempotency_key.clone().map(Into::into),
            "received_at" => return Some(self.received_at.to_rfc3339().into()),
            "stored_at" => return Some(self.stored_at.to_rfc3339().into()),
            _ => {}
        }
        let rest = path.strip_prefix("data.").unwrap_or(path);
        if rest == "data" {
            return Some(self.data.clone());
        }
        let mut current = &self.data;
        for segment in rest.split('.') {
            current = match current {
                serde_json::Value::Object(map) => map.get(segment)?,
                serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }

    /// Best-effort message text used for keyword matching.
    ///
    /// Chat sources disagree on naming, so the first of the common text fields
    /// wins. Falls back to the whole payload serialized when none is present.
    pub fn text(&self) -> String {
        const TEXT_FIELDS: &[&str] = &[
            "content",
            "text",
            "body",
            "message.text",
            "message.content",
            "message",
        ];
        for path in TEXT_FIELDS {
            if let Some(serde_json::Value::String(s)) = self.field(path) {
                return s;
            }
        }
        match &self.data {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// Sender identity, if the payload carries one.
    pub fn sender(&self) -> Option<String> {
        const SENDER_FIELDS: &[&str] = &[
            "sender",
            "author.username",
            "author.id",
            "author",
            "from.username",
            "from.id",
            "from",
            "user",
        ];
        first_scalar(self, SENDER_FIELDS)
    }

    /// Channel / room / chat identity, if the payload carries one.
    pub fn channel(&self) -> Option<String> {
        const CHANNEL_FIELDS: &[&str] = &[
            "channel_id",
            "channel",
            "chat.id",
            "chat_id",
            "room_id",
            "room",
        ];
        first_scalar(self, CHANNEL_FIELDS)
    }
}

fn first_scalar(event: &StoredEvent, paths: &[&str]) -> Option<String> {
    paths
        .iter()
        .filter_map(|p| event.field(p))
        .find_map(|v| scalar_to_string(&v))
}

/// Render a JSON scalar as a plain string (no quotes). Objects and arrays yield None.
pub fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Query parameters for listing stored events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventQuery {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

/// Upper bound on page size for event listings.
pub const MAX_QUERY_LIMIT: usize = 500;

fn default_limit() -> usize {
    50
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            source: None,
            tenant_id: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

impl EventQuery {
    pub fn for_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::default()
        }
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}
