// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates watcher timing and tenant ids, provides defaults for everything optional
use crate::backoff::BackoffConfig;
use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub facade: FacadeConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub listeners: ListenersConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Tenants (caller aliases) to watch at startup
    #[serde(default)]
    pub tenants: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Bearer token required on /api routes when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

// Custom Debug impl to redact api_key
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Delay between healthy poll cycles
    #[serde(default = "default_base_interval_ms")]
    pub base_interval_ms: u64,
    /// Ceiling for the failure backoff
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Upper bound on a single discovery or poll call
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: default_base_interval_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl WatcherConfig {
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(self.base_interval_ms),
            ceiling: Duration::from_millis(self.max_backoff_ms),
            multiplier: 2,
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct FacadeConfig {
    /// Base URL of the connection vault service
    #[serde(default = "default_facade_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
}

// Custom Debug impl to redact api_token
impl std::fmt::Debug for FacadeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacadeConfig")
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            base_url: default_facade_url(),
            api_token: None,
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Where resolved trigger actions are POSTed. Actions are only logged when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

// Custom Debug impl to redact api_key
impl std::fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorConfig")
            .field("webhook_url", &self.webhook_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenersConfig {
    /// Connections that support multiple independently configured instances
    #[serde(default)]
    pub multi_instance: Vec<String>,
}

impl ListenersConfig {
    pub fn multi_instance_set(&self) -> HashSet<String> {
        self.multi_instance.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Drop stored events older than this many days. Keep forever when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u32>,
}

fn default_database_path() -> String {
    paths::database_file().to_string_lossy().to_string()
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    13100
}

fn default_base_interval_ms() -> u64 {
    5_000
}

fn default_max_backoff_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_facade_url() -> String {
    "http://127.0.0.1:13200".to_string()
}

/// Expand tilde (~) to home directory in paths
/// Logs a warning if expansion fails and falls back to the original path
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(stripped)
                .to_string_lossy()
                .to_string();
        }
        tracing::warn!(
            path = %path,
            "Failed to expand tilde in path: could not determine home directory"
        );
    }
    path.to_string()
}

fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Find the config file, checking multiple locations in order:
    /// 1. HOOKWIRE_CONFIG_PATH env var (if set)
    /// 2. ./config.toml (current directory - for development)
    /// 3. ~/.config/hookwire/config.toml (XDG config dir)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("HOOKWIRE_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Parse a TOML document without env overrides or validation
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str::<Config>(content).context("Failed to parse configuration")
    }

    /// Load configuration from config.toml with environment variable overrides
    pub fn load() -> Result<Self> {
        let mut config = if let Some(config_path) = Self::find_config_file() {
            tracing::info!(
                path = %config_path.display(),
                "Loading configuration from file"
            );
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            tracing::info!("No config file found, using environment variables and defaults");
            Config::default()
        };

        config.apply_env_overrides()?;
        config.database.path = expand_tilde(&config.database.path);
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("HOOKWIRE_DATABASE_PATH") {
            self.database.path = val;
        }
        if let Ok(val) = std::env::var("HOOKWIRE_SERVER_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = std::env::var("HOOKWIRE_SERVER_PORT") {
            self.server.port = val.parse().with_context(|| {
                format!("HOOKWIRE_SERVER_PORT must be a valid port number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("HOOKWIRE_API_KEY") {
            self.server.api_key = Some(val);
        }
        if let Ok(val) = std::env::var("HOOKWIRE_FACADE_URL") {
            self.facade.base_url = val;
        }
        if let Ok(val) = std::env::var("HOOKWIRE_FACADE_TOKEN") {
            self.facade.api_token = Some(val);
            // Clear from environment to prevent exposure via /proc or ps
            std::env::remove_var("HOOKWIRE_FACADE_TOKEN");
        }
        if let Ok(val) = std::env::var("HOOKWIRE_EXECUTOR_URL") {
            self.executor.webhook_url = Some(val);
        }
        if let Ok(val) = std::env::var("HOOKWIRE_TENANTS") {
            self.tenants = split_list(&val);
        }
        if let Ok(val) = std::env::var("HOOKWIRE_POLL_INTERVAL_MS") {
            self.watcher.base_interval_ms = val.parse().with_context(|| {
                format!("HOOKWIRE_POLL_INTERVAL_MS must be a number, got: {}", val)
            })?;
        }
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&mut self) -> Result<()> {
        if self.watcher.base_interval_ms == 0 {
            anyhow::bail!("watcher.base_interval_ms must be greater than zero");
        }
        if self.watcher.max_backoff_ms < self.watcher.base_interval_ms {
            anyhow::bail!(
                "watcher.max_backoff_ms ({}) must be >= watcher.base_interval_ms ({})",
                self.watcher.max_backoff_ms,
                self.watcher.base_interval_ms
            );
        }
        if self.watcher.poll_timeout_secs == 0 {
            anyhow::bail!("watcher.poll_timeout_secs must be greater than zero");
        }

        self.tenants = self
            .tenants
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        let mut seen = HashSet::new();
        self.tenants.retain(|t| seen.insert(t.clone()));
        for tenant in &self.tenants {
            if tenant.contains('/') || tenant.chars().any(char::is_whitespace) {
                anyhow::bail!("Invalid tenant id '{}': no slashes or whitespace", tenant);
            }
        }

        if self.facade.base_url.trim().is_empty() {
            anyhow::bail!("facade.base_url is required");
        }
        Ok(())
    }
}
