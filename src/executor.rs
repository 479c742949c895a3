// ABOUTME: Action executors that hand resolved trigger actions to the agent runtime
// ABOUTME: WebhookExecutor POSTs the action JSON; LogExecutor is the fallback when no URL is set

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use hookwire_core::config::ExecutorConfig;
use hookwire_core::dispatcher::{ActionExecutor, LogExecutor};
use hookwire_core::ResolvedAction;
use std::sync::Arc;
use std::time::Duration;

const EXECUTOR_TIMEOUT: Duration = Duration::from_secs(30);

/// POSTs each resolved action to a configured endpoint
pub struct WebhookExecutor {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl WebhookExecutor {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(EXECUTOR_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl ActionExecutor for WebhookExecutor {
    async fn execute(&self, action: &ResolvedAction) -> Result<()> {
        let mut request = self.client.post(&self.url).json(action);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to deliver action to {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail: String = body.chars().take(200).collect();
            bail!("Executor rejected action ({}): {}", status, detail);
        }

        tracing::debug!(
            trigger_id = %action.trigger_id,
            event_id = %action.event_id,
            "Action delivered"
        );
        Ok(())
    }
}

/// Pick the executor for the configuration
pub fn build_executor(config: &ExecutorConfig) -> Result<Arc<dyn ActionExecutor>> {
    match &config.webhook_url {
        Some(url) if !url.trim().is_empty() => {
            tracing::info!(url = %url, "Delivering trigger actions by webhook");
            Ok(Arc::new(WebhookExecutor::new(url.clone(), config.api_key.clone())?))
        }
        _ => {
            tracing::info!("No executor URL configured, trigger actions will only be logged");
            Ok(Arc::new(LogExecutor))
        }
    }
}
