// ABOUTME: `{{placeholder}}` interpolation of event fields into trigger action templates
// ABOUTME: Resolves envelope fields, payload paths and the text/sender/channel helpers

use regex::{Captures, Regex};
use std::sync::OnceLock;

use crate::event::StoredEvent;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex is valid")
    })
}

/// Replace every `{{name}}` in `template` with the matching event value.
///
/// Names are resolved in this order: `text`, `sender`, `channel`, `event.<x>`
/// (alias for the envelope field `<x>`), then [`StoredEvent::field`].
/// Unknown names render as an empty string; objects and arrays render as JSON.
pub fn render(template: &str, event: &StoredEvent) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &Captures<'_>| resolve(&caps[1], event))
        .into_owned()
}

fn resolve(name: &str, event: &StoredEvent) -> String {
    match name {
        "text" => return event.text(),
        "sender" => return event.sender().unwrap_or_default(),
        "channel" => return event.channel().unwrap_or_default(),
        _ => {}
    }
    let path = name.strip_prefix("event.").unwrap_or(name);
    match event.field(path) {
        Some(serde_json::Value::String(s)) => s,
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Placeholder names used by a template, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    placeholder_regex()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}
