// ABOUTME: Tracing subscriber setup: env filter, console layer and a daily rolling log file
// ABOUTME: The returned guard must be held for the life of the process so file writes flush

use anyhow::{Context, Result};
use hookwire_core::paths;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "hookwire.log";

/// Install the global subscriber. Console output is JSON when `json` is set.
/// Logs also go to a daily file under the data directory.
pub fn init(json: bool) -> Result<WorkerGuard> {
    init_in(&paths::log_dir(), json)
}

pub fn init_in(log_dir: &Path, json: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let console = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    let file = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Request spans from tower-http are noisy at info
            "info,tower_http=warn".into()
        }))
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
