// ABOUTME: Main entry point: parses the CLI, sets up logging and config, dispatches the command
// ABOUTME: `start` wires watchers, dispatcher, retention and the HTTP API and runs until Ctrl+C

use anyhow::{Context, Result};
use clap::Parser;
use hookwire::{
    api,
    cli::{Cli, Command},
    config::Config,
    executor,
    facade_http::HttpFacadeProvider,
    logging, metrics, server,
};
use hookwire_core::{EventQuery, EventStore, TriggerStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        std::env::set_var("HOOKWIRE_CONFIG_PATH", path);
    }

    let _log_guard = logging::init(cli.json)?;
    let config = Config::load()?;

    match cli.command() {
        Command::Start => run_server(config).await,
        Command::Config => {
            println!("{:#?}", config);
            Ok(())
        }
        Command::Events {
            source,
            tenant,
            limit,
        } => list_events(&config, source, tenant, limit),
        Command::Triggers { agent } => list_triggers(&config, agent.as_deref()),
    }
}

async fn run_server(config: Config) -> Result<()> {
    tracing::info!(
        database = %config.database.path,
        port = config.server.port,
        tenants = config.tenants.len(),
        facade = %config.facade.base_url,
        "Starting hookwire"
    );

    let prometheus = metrics::init_metrics()?;
    let provider = Arc::new(HttpFacadeProvider::new(&config.facade)?);
    let executor = executor::build_executor(&config.executor)?;
    let state = Arc::new(server::ServerState::open(config, provider, executor)?);

    state.start_watchers().await;

    let cancel = CancellationToken::new();
    let retention = tokio::spawn(server::run_retention(Arc::clone(&state), cancel.clone()));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C, shutting down"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C"),
        }
        shutdown.cancel();
    });

    let served = api::serve(Arc::clone(&state), prometheus, cancel.clone()).await;
    cancel.cancel();

    state.supervisor.shutdown().await;
    if let Err(e) = retention.await {
        tracing::warn!(error = %e, "Retention task ended abnormally");
    }
    tracing::info!("Shutdown complete");
    served
}

fn open_stores(config: &Config) -> Result<(EventStore, TriggerStore)> {
    let db = hookwire_core::open_database(&config.database.path)
        .with_context(|| format!("Failed to open database {}", config.database.path))?;
    let events = EventStore::new(db.clone());
    events.initialize_schema()?;
    let triggers = TriggerStore::new(db);
    triggers.initialize_schema()?;
    Ok((events, triggers))
}

fn list_events(
    config: &Config,
    source: Option<String>,
    tenant: Option<String>,
    limit: usize,
) -> Result<()> {
    let (events, _) = open_stores(config)?;
    let query = EventQuery {
        source,
        tenant_id: tenant,
        ..EventQuery::default()
    }
    .page(limit, 0);

    for event in events.query(&query)? {
        println!(
            "{}  {:<12} {:<16} {:<10} {}",
            event.stored_at.format("%Y-%m-%d %H:%M:%S"),
            event.source,
            event.event_type,
            event.tenant_id,
            truncate(&event.text(), 60)
        );
    }
    Ok(())
}

fn list_triggers(config: &Config, agent: Option<&str>) -> Result<()> {
    let (_, triggers) = open_stores(config)?;
    for trigger in triggers.list(agent)? {
        println!(
            "{}  {:<8} {:<16} {:<14} fired {}",
            trigger.id,
            trigger.status.to_string(),
            trigger.agent_id,
            trigger.action.kind(),
            trigger.trigger_count
        );
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max {
        return line.to_string();
    }
    let mut cut: String = line.chars().take(max.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}
