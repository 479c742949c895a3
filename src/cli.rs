// ABOUTME: Command-line interface definition
// ABOUTME: `start` runs the service; the rest inspect configuration and stored data

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Per-tenant event watchers and trigger dispatch for agents
#[derive(Parser, Debug)]
#[command(name = "hookwire", version)]
#[command(about = "Watch tenant connections, store events and fire agent triggers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to config.toml (overrides HOOKWIRE_CONFIG_PATH)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit console logs as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run watchers, the dispatcher and the HTTP API (default)
    Start,
    /// Print the effective configuration with secrets redacted
    Config,
    /// List stored events, newest first
    Events {
        #[arg(short, long)]
        source: Option<String>,
        #[arg(short, long)]
        tenant: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// List triggers
    Triggers {
        /// Only triggers owned by this agent
        #[arg(short, long)]
        agent: Option<String>,
    },
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Start)
    }
}
