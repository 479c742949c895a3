// ABOUTME: HTTP client for the connection vault service, implementing the connection facade
// ABOUTME: One session per tenant; 401/403 surface as AuthExpired so watchers reset the session

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use hookwire_core::config::FacadeConfig;
use hookwire_core::facade::{
    AuthExpired, ConnectionFacade, ControlResult, FacadeProvider, InstanceAction, SharedFacade,
};
use hookwire_core::IngestedEvent;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct SessionResponse {
    token: String,
}

#[derive(Debug, Serialize)]
struct ControlRequest<'a> {
    action: InstanceAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_id: Option<&'a str>,
}

/// Facade bound to one tenant's vault session
pub struct HttpFacade {
    client: reqwest::Client,
    base_url: Url,
    session_token: String,
}

impl HttpFacade {
    /// Perform the session handshake for `tenant_id`
    pub async fn connect(
        client: reqwest::Client,
        base_url: &str,
        api_token: Option<&str>,
        tenant_id: &str,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid facade base URL: {}", base_url))?;
        let url = endpoint(&base_url, &["tenants", tenant_id, "session"])?;

        let mut request = client.post(url);
        if let Some(token) = api_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .context("Failed to reach connection vault")?;
        let session: SessionResponse = check(response, "session handshake")
            .await?
            .json()
            .await
            .context("Failed to parse session response")?;

        tracing::info!(tenant = %tenant_id, "Vault session established");
        Ok(Self {
            client,
            base_url,
            session_token: session.token,
        })
    }
}

#[async_trait]
impl ConnectionFacade for HttpFacade {
    async fn discover_active_connections(&self, tenant_id: &str) -> Result<Vec<String>> {
        let url = endpoint(&self.base_url, &["tenants", tenant_id, "connections"])?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.session_token)
            .send()
            .await
            .context("Failed to list connections")?;
        check(response, "connection discovery")
            .await?
            .json()
            .await
            .context("Failed to parse connection list")
    }

    async fn poll(
        &self,
        tenant_id: &str,
        connection_id: &str,
        after_id: i64,
    ) -> Result<Vec<IngestedEvent>> {
        let mut url = endpoint(
            &self.base_url,
            &["tenants", tenant_id, "connections", connection_id, "events"],
        )?;
        url.query_pairs_mut()
            .append_pair("after", &after_id.to_string());

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.session_token)
            .send()
            .await
            .with_context(|| format!("Failed to poll {}", connection_id))?;
        check(response, "poll")
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse events from {}", connection_id))
    }

    async fn control_instance(
        &self,
        tenant_id: &str,
        connection_id: &str,
        action: InstanceAction,
        instance_id: Option<&str>,
    ) -> Result<ControlResult> {
        let url = endpoint(
            &self.base_url,
            &["tenants", tenant_id, "connections", connection_id, "control"],
        )?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.session_token)
            .json(&ControlRequest {
                action,
                instance_id,
            })
            .send()
            .await
            .with_context(|| format!("Failed to send {} to {}", action, connection_id))?;
        check(response, "instance control")
            .await?
            .json()
            .await
            .context("Failed to parse control response")
    }
}

/// `base` with `segments` appended as escaped path segments
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Facade base URL cannot be a base: {}", base))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Map non-success statuses to errors. Auth rejections become [`AuthExpired`].
async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => Err(auth_rejected(what, status)),
        status => {
            let body = response.text().await.unwrap_or_default();
            let detail: String = body.chars().take(200).collect();
            bail!("{} failed ({}): {}", what, status, detail)
        }
    }
}

fn auth_rejected(what: &str, status: StatusCode) -> anyhow::Error {
    AuthExpired::new(format!("{} rejected by vault ({})", what, status)).into()
}

/// Creates and caches one [`HttpFacade`] per tenant
pub struct HttpFacadeProvider {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    sessions: Mutex<HashMap<String, SharedFacade>>,
}

impl HttpFacadeProvider {
    pub fn new(config: &FacadeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Url::parse(&config.base_url)
            .with_context(|| format!("Invalid facade base URL: {}", config.base_url))?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_token: config.api_token.clone(),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    async fn connect(&self, tenant_id: &str) -> Result<SharedFacade> {
        let facade = HttpFacade::connect(
            self.client.clone(),
            &self.base_url,
            self.api_token.as_deref(),
            tenant_id,
        )
        .await?;
        let facade: SharedFacade = Arc::new(facade);
        Ok(facade)
    }
}

#[async_trait]
impl FacadeProvider for HttpFacadeProvider {
    async fn facade(&self, tenant_id: &str) -> Result<SharedFacade> {
        let mut sessions = self.sessions.lock().await;
        if let Some(facade) = sessions.get(tenant_id) {
            return Ok(Arc::clone(facade));
        }
        let facade = self.connect(tenant_id).await?;
        sessions.insert(tenant_id.to_string(), Arc::clone(&facade));
        Ok(facade)
    }

    async fn reset(&self, tenant_id: &str) -> Result<SharedFacade> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(tenant_id);
        tracing::info!(tenant = %tenant_id, "Re-establishing vault session");
        let facade = self.connect(tenant_id).await?;
        sessions.insert(tenant_id.to_string(), Arc::clone(&facade));
        Ok(facade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_escapes_segments() {
        let base = Url::parse("http://vault.local/api/").unwrap();
        let url = endpoint(&base, &["tenants", "alice smith", "connections"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://vault.local/api/tenants/alice%20smith/connections"
        );
    }

    #[test]
    fn test_control_request_omits_default_instance() {
        let body = serde_json::to_value(ControlRequest {
            action: InstanceAction::Restart,
            instance_id: None,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"action": "restart"}));
    }

    #[test]
    fn test_auth_statuses_are_typed() {
        let err = auth_rejected("poll", StatusCode::UNAUTHORIZED);
        assert!(hookwire_core::facade::is_auth_failure(&err));
        assert!(err.to_string().contains("401"));
    }

    #[test]
    fn test_provider_rejects_invalid_url() {
        let config = FacadeConfig {
            base_url: "not a url".to_string(),
            api_token: None,
        };
        assert!(HttpFacadeProvider::new(&config).is_err());
    }
}
