// ABOUTME: HTTP API for events, triggers, listener instances and watchers
// ABOUTME: JSON over axum with optional bearer key on /api routes, plus /health and /metrics

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hookwire_core::dispatcher::MAX_BACKTEST_SAMPLE;
use hookwire_core::listener::ListenerInstance;
use hookwire_core::supervisor::SyncReport;
use hookwire_core::trigger::{NewTrigger, TriggerUpdate};
use hookwire_core::watcher::WatcherStatus;
use hookwire_core::{EventQuery, Filter, SetParamsResult, StoredEvent, Trigger, TriggerStatus};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::server::ServerState;

const DEFAULT_BACKTEST_SAMPLE: usize = 100;

/// Error body, same shape for every failing route
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(what: &str, id: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{} not found: {}", what, id))
    }

    fn bad_request(e: anyhow::Error) -> Self {
        Self::new(StatusCode::BAD_REQUEST, format!("{:#}", e))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        tracing::error!(error = %e, "API request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiResponse {
                success: false,
                message: self.message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

type AppState = Arc<ServerState>;

/// Build the full router. `/metrics` is only mounted when a Prometheus
/// handle is supplied.
pub fn router(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    let api = Router::new()
        .route("/events", get(list_events))
        .route("/events/sources", get(list_sources))
        .route("/events/{id}", get(get_event))
        .route("/triggers", get(list_triggers).post(create_trigger))
        .route(
            "/triggers/{id}",
            get(get_trigger).patch(update_trigger).delete(delete_trigger),
        )
        .route("/triggers/{id}/pause", post(pause_trigger))
        .route("/triggers/{id}/resume", post(resume_trigger))
        .route("/triggers/{id}/backtest", post(backtest_trigger))
        .route(
            "/tenants/{tenant}/listeners/{connection}",
            get(list_listeners).put(set_listener_params),
        )
        .route(
            "/tenants/{tenant}/listeners/{connection}/{instance}",
            axum::routing::delete(delete_listener),
        )
        .route(
            "/tenants/{tenant}/listeners/{connection}/{instance}/enable",
            post(enable_listener),
        )
        .route(
            "/tenants/{tenant}/listeners/{connection}/{instance}/disable",
            post(disable_listener),
        )
        .route("/watchers", get(list_watchers))
        .route("/watchers/sync", post(sync_watchers))
        .route("/watchers/{tenant}/start", post(start_watcher))
        .route("/watchers/{tenant}/stop", post(stop_watcher))
        .route("/watchers/{tenant}/restart", post(restart_watcher))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_api_key,
        ));

    let mut app = Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .with_state(state);

    if let Some(handle) = metrics {
        let metrics_routes = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(Arc::new(handle));
        app = app.merge(metrics_routes);
    }

    app.layer(TraceLayer::new_for_http())
}

/// Serve the API until `cancel` fires
pub async fn serve(state: AppState, metrics: PrometheusHandle, cancel: CancellationToken) -> Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let app = router(state, Some(metrics));

    tracing::info!(addr = %addr, "Starting API server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("API server failed")?;
    Ok(())
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    let Some(expected) = state.config.server.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    let headers = request.headers();
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let api_key = headers.get("X-API-Key").and_then(|v| v.to_str().ok());

    if bearer == Some(expected) || api_key == Some(expected) {
        return Ok(next.run(request).await);
    }

    tracing::warn!(path = %request.uri().path(), "API access denied: invalid or missing key");
    Err(ApiError::new(
        StatusCode::UNAUTHORIZED,
        "Invalid or missing API key",
    ))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let watchers = state.supervisor.running_tenants().await.len();
    Json(serde_json::json!({ "status": "ok", "watchers": watchers }))
}

async fn metrics_handler(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Deserialize)]
struct EventsParams {
    source: Option<String>,
    tenant: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
) -> ApiResult<Vec<StoredEvent>> {
    let defaults = EventQuery::default();
    let query = EventQuery {
        source: params.source,
        tenant_id: params.tenant,
        limit: params.limit.unwrap_or(defaults.limit),
        offset: params.offset.unwrap_or(0),
    };
    Ok(Json(state.events.query(&query)?))
}

async fn list_sources(State(state): State<AppState>) -> ApiResult<Vec<String>> {
    Ok(Json(state.events.list_sources()?.into_iter().collect()))
}

async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StoredEvent> {
    state
        .events
        .get(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Event", &id))
}

// ============================================================================
// Triggers
// ============================================================================

#[derive(Debug, Deserialize)]
struct TriggerListParams {
    agent_id: Option<String>,
}

async fn list_triggers(
    State(state): State<AppState>,
    Query(params): Query<TriggerListParams>,
) -> ApiResult<Vec<Trigger>> {
    Ok(Json(state.triggers.list(params.agent_id.as_deref())?))
}

async fn create_trigger(
    State(state): State<AppState>,
    Json(new): Json<NewTrigger>,
) -> std::result::Result<(StatusCode, Json<Trigger>), ApiError> {
    let trigger = state.triggers.create(new).map_err(ApiError::bad_request)?;
    tracing::info!(
        trigger_id = %trigger.id,
        agent_id = %trigger.agent_id,
        "Trigger created"
    );
    Ok((StatusCode::CREATED, Json(trigger)))
}

async fn get_trigger(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Trigger> {
    state
        .triggers
        .get(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Trigger", &id))
}

async fn update_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<TriggerUpdate>,
) -> ApiResult<Trigger> {
    state
        .triggers
        .update(&id, update)
        .map_err(ApiError::bad_request)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Trigger", &id))
}

async fn delete_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ApiResponse> {
    if !state.triggers.delete(&id)? {
        return Err(ApiError::not_found("Trigger", &id));
    }
    Ok(Json(ApiResponse {
        success: true,
        message: format!("Trigger {} deleted", id),
    }))
}

async fn pause_trigger(state: State<AppState>, id: Path<String>) -> ApiResult<Trigger> {
    set_trigger_status(state, id, TriggerStatus::Paused).await
}

async fn resume_trigger(state: State<AppState>, id: Path<String>) -> ApiResult<Trigger> {
    set_trigger_status(state, id, TriggerStatus::Active).await
}

async fn set_trigger_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    status: TriggerStatus,
) -> ApiResult<Trigger> {
    if !state.triggers.set_status(&id, status)? {
        return Err(ApiError::not_found("Trigger", &id));
    }
    tracing::info!(trigger_id = %id, status = %status, "Trigger status changed");
    state
        .triggers
        .get(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Trigger", &id))
}

#[derive(Debug, Default, Deserialize)]
struct BacktestRequest {
    /// Filter to try instead of the trigger's own
    #[serde(default)]
    filter: Option<Filter>,
    #[serde(default)]
    sample_size: Option<usize>,
}

#[derive(Debug, Serialize)]
struct BacktestResponse {
    sample_size: usize,
    matched: usize,
    matches: Vec<StoredEvent>,
}

async fn backtest_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<BacktestRequest>>,
) -> ApiResult<BacktestResponse> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let trigger = state
        .triggers
        .get(&id)?
        .ok_or_else(|| ApiError::not_found("Trigger", &id))?;
    let filter = request.filter.unwrap_or(trigger.filter);
    let sample_size = request
        .sample_size
        .unwrap_or(DEFAULT_BACKTEST_SAMPLE)
        .min(MAX_BACKTEST_SAMPLE);

    let matches = state
        .dispatcher
        .backtest(&filter, sample_size)
        .map_err(ApiError::bad_request)?;
    Ok(Json(BacktestResponse {
        sample_size,
        matched: matches.len(),
        matches,
    }))
}

// ============================================================================
// Listener instances
// ============================================================================

async fn list_listeners(
    State(state): State<AppState>,
    Path((tenant, connection)): Path<(String, String)>,
) -> ApiResult<Vec<ListenerInstance>> {
    Ok(Json(state.listeners.list_instances(&tenant, &connection).await?))
}

#[derive(Debug, Deserialize)]
struct SetParamsRequest {
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    params: Map<String, Value>,
    #[serde(default)]
    create_if_missing: bool,
}

async fn set_listener_params(
    State(state): State<AppState>,
    Path((tenant, connection)): Path<(String, String)>,
    Json(request): Json<SetParamsRequest>,
) -> ApiResult<SetParamsResult> {
    let result = state
        .listeners
        .set_params(
            &tenant,
            &connection,
            request.instance_id.as_deref(),
            request.params,
            request.create_if_missing,
        )
        .await
        .map_err(ApiError::bad_request)?;
    Ok(Json(result))
}

async fn delete_listener(
    State(state): State<AppState>,
    Path((tenant, connection, instance)): Path<(String, String, String)>,
) -> ApiResult<ApiResponse> {
    if !state
        .listeners
        .delete_instance(&tenant, &connection, &instance)
        .await?
    {
        return Err(ApiError::not_found("Listener instance", &instance));
    }
    Ok(Json(ApiResponse {
        success: true,
        message: format!("Instance {} removed from {}", instance, connection),
    }))
}

async fn enable_listener(
    state: State<AppState>,
    path: Path<(String, String, String)>,
) -> ApiResult<SetParamsResult> {
    set_listener_disabled(state, path, false).await
}

async fn disable_listener(
    state: State<AppState>,
    path: Path<(String, String, String)>,
) -> ApiResult<SetParamsResult> {
    set_listener_disabled(state, path, true).await
}

async fn set_listener_disabled(
    State(state): State<AppState>,
    Path((tenant, connection, instance)): Path<(String, String, String)>,
    disabled: bool,
) -> ApiResult<SetParamsResult> {
    let result = state
        .listeners
        .set_disabled(&tenant, &connection, Some(&instance), disabled)
        .await
        .map_err(ApiError::bad_request)?;
    Ok(Json(result))
}

// ============================================================================
// Watchers
// ============================================================================

#[derive(Debug, Serialize)]
struct WatchersResponse {
    running: Vec<String>,
    watchers: Vec<WatcherStatus>,
}

async fn list_watchers(State(state): State<AppState>) -> ApiResult<WatchersResponse> {
    Ok(Json(WatchersResponse {
        running: state.supervisor.running_tenants().await,
        watchers: state.supervisor.statuses().await,
    }))
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
    tenants: Vec<String>,
}

async fn sync_watchers(
    State(state): State<AppState>,
    Json(request): Json<SyncRequest>,
) -> ApiResult<SyncReport> {
    Ok(Json(state.supervisor.sync(&request.tenants).await))
}

async fn start_watcher(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<ApiResponse> {
    let started = state.supervisor.start(&tenant).await;
    let message = if started {
        format!("Watcher started for {}", tenant)
    } else {
        format!("Watcher already running for {}", tenant)
    };
    Ok(Json(ApiResponse {
        success: true,
        message,
    }))
}

async fn stop_watcher(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<ApiResponse> {
    if !state.supervisor.stop(&tenant).await {
        return Err(ApiError::not_found("Watcher", &tenant));
    }
    Ok(Json(ApiResponse {
        success: true,
        message: format!("Watcher stopped for {}", tenant),
    }))
}

async fn restart_watcher(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<ApiResponse> {
    state.supervisor.restart(&tenant).await;
    Ok(Json(ApiResponse {
        success: true,
        message: format!("Watcher restarted for {}", tenant),
    }))
}
