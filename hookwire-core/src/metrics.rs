// ABOUTME: Prometheus metrics for the ingestion pipeline
// ABOUTME: Counters for ingest, dedup, poll failures and trigger fires; gauge for live watchers

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once; later calls
/// return the handle from the first install.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    Ok(HANDLE.get_or_init(|| handle).clone())
}

pub fn record_event_ingested(source: &str) {
    counter!("hookwire_events_ingested_total", "source" => source.to_string()).increment(1);
}

pub fn record_event_duplicate(source: &str) {
    counter!("hookwire_events_duplicate_total", "source" => source.to_string()).increment(1);
}

pub fn record_poll_failure(kind: &'static str) {
    counter!("hookwire_poll_failures_total", "kind" => kind).increment(1);
}

pub fn record_poll_cycle(outcome: &'static str) {
    counter!("hookwire_poll_cycles_total", "outcome" => outcome).increment(1);
}

pub fn record_trigger_fired(action: &'static str) {
    counter!("hookwire_triggers_fired_total", "action" => action).increment(1);
}

pub fn record_action_failure() {
    counter!("hookwire_action_failures_total").increment(1);
}

pub fn record_facade_reset() {
    counter!("hookwire_facade_resets_total").increment(1);
}

pub fn set_active_watchers(count: usize) {
    gauge!("hookwire_active_watchers").set(count as f64);
}
