// ABOUTME: Connection facade traits consumed by watchers and the listener controller
// ABOUTME: Discovery, cursor-based polling and instance control, plus per-tenant handle creation

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::event::IngestedEvent;

/// Lifecycle command sent to a running listener instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceAction {
    Start,
    Stop,
    Restart,
}

impl std::fmt::Display for InstanceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceAction::Start => write!(f, "start"),
            InstanceAction::Stop => write!(f, "stop"),
            InstanceAction::Restart => write!(f, "restart"),
        }
    }
}

/// Outcome of an instance control call. A transport error is an `Err`; a
/// listener that refused the command is `success: false` with a reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Pull interface onto the credential vault / transport layer for one tenant.
///
/// Implementations hold whatever session state the transport needs. A facade
/// whose session has expired should fail with [`AuthExpired`] so callers can
/// recreate it through [`FacadeProvider::reset`].
#[async_trait]
pub trait ConnectionFacade: Send + Sync {
    /// Connections currently active for the tenant
    async fn discover_active_connections(&self, tenant_id: &str) -> Result<Vec<String>>;

    /// Events with id strictly greater than `after_id` (−1 for everything)
    async fn poll(
        &self,
        tenant_id: &str,
        connection_id: &str,
        after_id: i64,
    ) -> Result<Vec<IngestedEvent>>;

    async fn control_instance(
        &self,
        tenant_id: &str,
        connection_id: &str,
        action: InstanceAction,
        instance_id: Option<&str>,
    ) -> Result<ControlResult>;
}

pub type SharedFacade = Arc<dyn ConnectionFacade>;

/// Hands out facade handles per tenant and recreates them after auth failures.
#[async_trait]
pub trait FacadeProvider: Send + Sync {
    /// Current handle for the tenant, creating one if needed
    async fn facade(&self, tenant_id: &str) -> Result<SharedFacade>;

    /// Drop the tenant's handle and perform a fresh handshake
    async fn reset(&self, tenant_id: &str) -> Result<SharedFacade>;
}

/// Provider that always returns the same facade. Reset is a no-op.
pub struct StaticFacadeProvider {
    facade: SharedFacade,
}

impl StaticFacadeProvider {
    pub fn new(facade: SharedFacade) -> Self {
        Self { facade }
    }
}

#[async_trait]
impl FacadeProvider for StaticFacadeProvider {
    async fn facade(&self, _tenant_id: &str) -> Result<SharedFacade> {
        Ok(Arc::clone(&self.facade))
    }

    async fn reset(&self, _tenant_id: &str) -> Result<SharedFacade> {
        Ok(Arc::clone(&self.facade))
    }
}

/// A facade call rejected because the tenant's session is missing, expired or
/// revoked. Facades return this (possibly under added context) so watchers can
/// tell it apart from transport errors and re-handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthExpired {
    pub detail: String,
}

impl AuthExpired {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for AuthExpired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unauthorized: {}", self.detail)
    }
}

impl std::error::Error for AuthExpired {}

/// Whether any cause in the error chain is an [`AuthExpired`].
pub fn is_auth_failure(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<AuthExpired>())
}
