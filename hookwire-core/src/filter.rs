// ABOUTME: Declarative trigger filters: keyword, sender/channel equality, regex, AND/OR/NOT
// ABOUTME: Pure evaluation over stored events, usable for live dispatch and offline backtests

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::event::{scalar_to_string, StoredEvent};

/// Boolean expression over event fields.
///
/// Serialized as a tagged object, e.g.
/// `{"op":"and","filters":[{"op":"contains","value":"down"},{"op":"source","equals":"discord"}]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    /// Matches every event
    Any,
    /// Keyword containment in the message text (or in `field` when given)
    Contains {
        value: String,
        #[serde(default)]
        case_sensitive: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    Sender {
        equals: String,
    },
    Channel {
        equals: String,
    },
    EventType {
        equals: String,
    },
    Source {
        equals: String,
    },
    /// Equality on an arbitrary dotted path (see [`StoredEvent::field`])
    Field {
        path: String,
        equals: serde_json::Value,
    },
    /// Regex search over the message text (or `field`)
    Regex {
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    /// All sub-filters match. Empty means true.
    And {
        filters: Vec<Filter>,
    },
    /// At least one sub-filter matches. Empty means false.
    Or {
        filters: Vec<Filter>,
    },
    Not {
        filter: Box<Filter>,
    },
}

impl Filter {
    pub fn contains(value: impl Into<String>) -> Self {
        Filter::Contains {
            value: value.into(),
            case_sensitive: false,
            field: None,
        }
    }

    pub fn sender(equals: impl Into<String>) -> Self {
        Filter::Sender {
            equals: equals.into(),
        }
    }

    pub fn channel(equals: impl Into<String>) -> Self {
        Filter::Channel {
            equals: equals.into(),
        }
    }

    pub fn event_type(equals: impl Into<String>) -> Self {
        Filter::EventType {
            equals: equals.into(),
        }
    }

    pub fn source(equals: impl Into<String>) -> Self {
        Filter::Source {
            equals: equals.into(),
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Filter::Regex {
            pattern: pattern.into(),
            field: None,
        }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And { filters }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or { filters }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not {
            filter: Box::new(filter),
        }
    }

    /// Compile regexes once so the filter can be evaluated many times.
    pub fn compile(&self) -> Result<CompiledFilter> {
        Ok(CompiledFilter {
            node: Node::build(self)?,
        })
    }

    /// Reject filters that can never be evaluated (bad regex, empty keyword).
    pub fn validate(&self) -> Result<()> {
        self.compile().map(|_| ())
    }

    /// One-off evaluation. An invalid filter matches nothing.
    pub fn matches(&self, event: &StoredEvent) -> bool {
        match self.compile() {
            Ok(compiled) => compiled.matches(event),
            Err(e) => {
                tracing::warn!(error = %e, "Invalid filter evaluated as no-match");
                false
            }
        }
    }
}

/// Filter with regexes pre-compiled.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    node: Node,
}

impl CompiledFilter {
    pub fn matches(&self, event: &StoredEvent) -> bool {
        self.node.matches(event)
    }
}

#[derive(Debug, Clone)]
enum Node {
    Any,
    Contains {
        needle: String,
        case_sensitive: bool,
        field: Option<String>,
    },
    Sender(String),
    Channel(String),
    EventType(String),
    Source(String),
    Field {
        path: String,
        equals: serde_json::Value,
    },
    Regex {
        re: Regex,
        field: Option<String>,
    },
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
}

impl Node {
    fn build(filter: &Filter) -> Result<Node> {
        Ok(match filter {
            Filter::Any => Node::Any,
            Filter::Contains {
                value,
                case_sensitive,
                field,
            } => {
                if value.is_empty() {
                    anyhow::bail!("contains filter needs a non-empty value");
                }
                Node::Contains {
                    needle: if *case_sensitive {
                        value.clone()
                    } else {
                        value.to_lowercase()
                    },
                    case_sensitive: *case_sensitive,
                    field: field.clone(),
                }
            }
            Filter::Sender { equals } => Node::Sender(equals.clone()),
            Filter::Channel { equals } => Node::Channel(equals.clone()),
            Filter::EventType { equals } => Node::EventType(equals.clone()),
            Filter::Source { equals } => Node::Source(equals.clone()),
            Filter::Field { path, equals } => Node::Field {
                path: path.clone(),
                equals: equals.clone(),
            },
            Filter::Regex { pattern, field } => Node::Regex {
                re: Regex::new(pattern)
                    .with_context(|| format!("Invalid regex in filter: {}", pattern))?,
                field: field.clone(),
            },
            Filter::And { filters } => {
                Node::And(filters.iter().map(Node::build).collect::<Result<_>>()?)
            }
            Filter::Or { filters } => {
                Node::Or(filters.iter().map(Node::build).collect::<Result<_>>()?)
            }
            Filter::Not { filter } => Node::Not(Box::new(Node::build(filter)?)),
        })
    }

    fn matches(&self, event: &StoredEvent) -> bool {
        match self {
            Node::Any => true,
            Node::Contains {
                needle,
                case_sensitive,
                field,
            } => {
                let haystack = target_text(event, field.as_deref());
                if *case_sensitive {
                    haystack.contains(needle.as_str())
                } else {
                    haystack.to_lowercase().contains(needle.as_str())
                }
            }
            Node::Sender(expected) => event.sender().as_deref() == Some(expected.as_str()),
            Node::Channel(expected) => event.channel().as_deref() == Some(expected.as_str()),
            Node::EventType(expected) => event.event_type == *expected,
            Node::Source(expected) => event.source == *expected,
            Node::Field { path, equals } => match event.field(path) {
                Some(actual) => values_equal(&actual, equals),
                None => equals.is_null(),
            },
            Node::Regex { re, field } => re.is_match(&target_text(event, field.as_deref())),
            Node::And(nodes) => nodes.iter().all(|n| n.matches(event)),
            Node::Or(nodes) => nodes.iter().any(|n| n.matches(event)),
            Node::Not(node) => !node.matches(event),
        }
    }
}

fn target_text(event: &StoredEvent, field: Option<&str>) -> String {
    match field {
        None => event.text(),
        Some(path) => match event.field(path) {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        },
    }
}

/// Scalars compare by their string form so `"42"` equals `42`.
fn values_equal(actual: &serde_json::Value, expected: &serde_json::Value) -> bool {
    if actual == expected {
        return true;
    }
    match (scalar_to_string(actual), scalar_to_string(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Evaluate a filter against a batch of events, returning the matches in input order.
///
/// Pure: the same inputs always produce the same output, so it can validate a
/// filter against historical events before the trigger is activated.
pub fn evaluate(filter: &Filter, events: &[StoredEvent]) -> Result<Vec<StoredEvent>> {
    let compiled = filter.compile()?;
    Ok(events
        .iter()
        .filter(|e| compiled.matches(e))
        .cloned()
        .collect())
}
