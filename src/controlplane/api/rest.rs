//! REST API Handlers
//!
//! Implements the REST API endpoints for pool lifecycle, client membership
//! and eviction.

use crate::controlplane::service::{CreatePoolRequest, PoolService};
use crate::domain::{parse_size, ClientIdentity, HandleId, Permission, PoolMode, PoolUuid, ServerGroup};
use crate::error::{Error, Result};
use crate::membership::{ConnectionHandle, EvictionReport, EvictionRequest, EvictionScope};
use axum::{
    body::Bytes,
    extract::{Json, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Pool create request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePoolBody {
    pub uid: u32,
    pub gid: u32,
    /// Octal mode string (e.g., "0731")
    pub mode: String,
    /// Size (e.g., "1gb", "512M")
    pub size: String,
    /// Server group, defaults to the first configured group
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub level: u32,
}

/// Connect request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectBody {
    #[serde(default)]
    pub group: Option<String>,
    pub uid: u32,
    pub gid: u32,
    /// ro, rw or ex
    pub permission: String,
    #[serde(default)]
    pub session: Option<String>,
}

/// Evict request. No filter evicts every handle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EvictBody {
    #[serde(default)]
    pub group: Option<String>,
    /// Evict only this handle
    #[serde(default)]
    pub handle: Option<String>,
    /// Evict every handle of this uid (requires gid)
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub level: u32,
}

impl EvictBody {
    /// Decode an evict request body. Only a truly empty body means "no
    /// filter"; anything else must be a well-formed JSON object.
    fn from_request_body(headers: &HeaderMap, body: &[u8]) -> Result<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let is_json = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
            .unwrap_or(false);
        if !is_json {
            return Err(Error::InvalidParameter(
                "evict body must be sent as application/json".into(),
            ));
        }

        serde_json::from_slice(body)
            .map_err(|e| Error::InvalidParameter(format!("malformed evict body: {}", e)))
    }

    fn scope(&self) -> Result<EvictionScope> {
        match (&self.handle, self.uid, self.gid) {
            (Some(handle), None, None) => Ok(EvictionScope::Handle {
                handle: HandleId::parse(handle)?,
            }),
            (None, Some(uid), Some(gid)) => Ok(EvictionScope::Client { uid, gid }),
            (None, None, None) => Ok(EvictionScope::All),
            _ => Err(Error::InvalidParameter(
                "evict takes either a handle or a uid/gid pair".into(),
            )),
        }
    }
}

/// Query string of pool lookups and destroy
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolQuery {
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub force: bool,
}

/// Created pool response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePoolResponse {
    pub uuid: PoolUuid,
    pub server_group: ServerGroup,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    service: Arc<PoolService>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(service: Arc<PoolService>) -> Self {
        Self { service }
    }

    /// Build the Axum router
    pub fn build(self) -> Result<Router> {
        let default_group = self
            .service
            .config()
            .server_groups
            .first()
            .cloned()
            .ok_or_else(|| Error::Configuration("no server groups configured".into()))
            .and_then(ServerGroup::new)?;

        let state = AppState {
            service: self.service,
            default_group,
        };

        Ok(Router::new()
            // Pool endpoints
            .route("/v1/pools", post(create_pool).get(list_pools))
            .route("/v1/pools/:uuid", get(query_pool).delete(destroy_pool))
            .route("/v1/pools/:uuid/connect", post(connect_pool))
            .route("/v1/pools/:uuid/evict", post(evict_pool))
            .route("/v1/pools/:uuid/handles", get(list_handles))
            // Handle endpoints
            .route("/v1/handles/:id", get(validate_handle).delete(disconnect_handle))
            // Maintenance
            .route("/v1/gc", post(collect_garbage))
            .route("/v1/status", get(status))
            // Health and metrics
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics))
            .with_state(state))
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    service: Arc<PoolService>,
    default_group: ServerGroup,
}

impl AppState {
    fn group(&self, name: Option<&str>) -> Result<ServerGroup> {
        match name {
            Some(name) => ServerGroup::new(name),
            None => Ok(self.default_group.clone()),
        }
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

/// HTTP status for an error kind
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidParameter(_) | Error::CapacityParse(_) => StatusCode::BAD_REQUEST,
        Error::AccessDenied { .. } => StatusCode::FORBIDDEN,
        Error::PoolNotFound { .. } => StatusCode::NOT_FOUND,
        Error::ServerGroupMismatch { .. } | Error::PoolNotEmpty { .. } => StatusCode::CONFLICT,
        Error::HandleEvicted { .. } => StatusCode::GONE,
        Error::ServerGroupUnreachable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(kind = err.kind(), "request failed: {}", err);
    } else {
        debug!(kind = err.kind(), "request rejected: {}", err);
    }
    (
        status,
        Json(ApiErrorResponse {
            error: err.kind().into(),
            message: err.to_string(),
        }),
    )
        .into_response()
}

fn respond<T: Serialize>(status: StatusCode, result: Result<T>) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Create a pool
async fn create_pool(State(state): State<AppState>, Json(body): Json<CreatePoolBody>) -> Response {
    respond(StatusCode::CREATED, do_create_pool(&state, body).await)
}

async fn do_create_pool(state: &AppState, body: CreatePoolBody) -> Result<CreatePoolResponse> {
    let request = CreatePoolRequest {
        owner: ClientIdentity::new(body.uid, body.gid),
        mode: PoolMode::parse_octal(&body.mode)?,
        size_bytes: parse_size(&body.size)?,
        server_group: state.group(body.group.as_deref())?,
        level: body.level,
    };
    let pool = state.service.create_pool(request).await?;
    Ok(CreatePoolResponse {
        uuid: pool.uuid,
        server_group: pool.server_group,
    })
}

/// Connect a client
async fn connect_pool(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(body): Json<ConnectBody>,
) -> Response {
    respond(StatusCode::CREATED, do_connect(&state, &uuid, body))
}

fn do_connect(state: &AppState, uuid: &str, body: ConnectBody) -> Result<ConnectionHandle> {
    let uuid = PoolUuid::address(uuid)?;
    let group = state.group(body.group.as_deref())?;
    let permission: Permission = body.permission.parse()?;
    let mut client = ClientIdentity::new(body.uid, body.gid);
    if let Some(session) = body.session {
        client = client.with_session(session);
    }
    state.service.connect(uuid, &group, client, permission)
}

/// Evict handles. An empty body evicts every handle on the pool.
async fn evict_pool(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = match EvictBody::from_request_body(&headers, &body) {
        Ok(body) => do_evict(&state, &uuid, body).await,
        Err(e) => Err(e),
    };
    respond(StatusCode::OK, result)
}

async fn do_evict(state: &AppState, uuid: &str, body: EvictBody) -> Result<EvictionReport> {
    let request = EvictionRequest {
        pool: PoolUuid::address(uuid)?,
        server_group: state.group(body.group.as_deref())?,
        scope: body.scope()?,
        level: body.level,
    };
    state.service.evict(request).await
}

/// Destroy a pool
async fn destroy_pool(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(query): Query<PoolQuery>,
) -> Response {
    match do_destroy(&state, &uuid, query).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn do_destroy(state: &AppState, uuid: &str, query: PoolQuery) -> Result<()> {
    let uuid = PoolUuid::address(uuid)?;
    let group = state.group(query.group.as_deref())?;
    state.service.destroy(uuid, &group, query.force).await
}

/// Get pool info
async fn query_pool(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(query): Query<PoolQuery>,
) -> Response {
    let result = PoolUuid::address(&uuid).and_then(|uuid| {
        let group = state.group(query.group.as_deref())?;
        state.service.query(uuid, &group)
    });
    respond(StatusCode::OK, result)
}

/// List pools of a group
async fn list_pools(State(state): State<AppState>, Query(query): Query<PoolQuery>) -> Response {
    let result = state
        .group(query.group.as_deref())
        .map(|group| state.service.list_pools(&group));
    respond(StatusCode::OK, result)
}

/// List handles of a pool
async fn list_handles(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(query): Query<PoolQuery>,
) -> Response {
    let result = PoolUuid::address(&uuid).and_then(|uuid| {
        let group = state.group(query.group.as_deref())?;
        state.service.handles(uuid, &group)
    });
    respond(StatusCode::OK, result)
}

/// Check a handle is still connected
async fn validate_handle(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let result = HandleId::parse(&id).and_then(|id| state.service.validate(id));
    respond(StatusCode::OK, result)
}

/// Disconnect a handle
async fn disconnect_handle(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let result = HandleId::parse(&id).map(|id| {
        serde_json::json!({
            "removed": state.service.disconnect(id)
        })
    });
    respond(StatusCode::OK, result)
}

/// Drop destroyed pool records
async fn collect_garbage(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "collected": state.service.collect_garbage()
        })),
    )
}

/// Service counters
async fn status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.service.status()))
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.probe_groups().await {
        Ok(()) => (StatusCode::OK, "ready".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// Prometheus metrics
async fn metrics(State(state): State<AppState>) -> Response {
    match state.service.metrics_text() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}
