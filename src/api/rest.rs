//! REST API Handlers
//!
//! Implements the REST endpoints for routers, interfaces, passthrough
//! operations, health and metrics.

use crate::domain::ports::{RequestContext, RouterQuery, RouterRequest, SortKey};
use crate::error::{Error, ErrorKind, Result};
use crate::router::RequestRouter;
use axum::{
    extract::{Json, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Header carrying the caller's correlation id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Header carrying the tenant on whose behalf the call is made
pub const TENANT_ID_HEADER: &str = "x-tenant-id";

// =============================================================================
// Request/Response Types
// =============================================================================

/// Router count response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: usize,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// HTTP status for a broker error
pub fn status_for(err: &Error) -> StatusCode {
    match err.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Exhausted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Connectivity => match err {
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        },
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(ctx: &RequestContext, err: Error) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("[{}] Request failed: {}", ctx.request_id, err);
    } else {
        warn!("[{}] Request rejected: {}", ctx.request_id, err);
    }

    (
        status,
        Json(ApiErrorResponse {
            error: err.code().into(),
            message: err.to_string(),
            details: None,
        }),
    )
        .into_response()
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiErrorResponse {
            error: "invalid_query".into(),
            message,
            details: None,
        }),
    )
        .into_response()
}

/// Build the per-call context from request headers
fn request_context(headers: &HeaderMap) -> RequestContext {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let mut ctx = match header_value(REQUEST_ID_HEADER) {
        Some(request_id) => RequestContext::new(request_id),
        None => RequestContext::new(format!("req-{}", uuid::Uuid::new_v4())),
    };
    if let Some(tenant_id) = header_value(TENANT_ID_HEADER) {
        ctx = ctx.with_tenant(tenant_id);
    }
    ctx
}

/// Run an allocating or releasing router call on its own task.
///
/// The request future may be dropped on timeout or client disconnect; the
/// spawned task still runs to completion, including any rollback.
async fn detached<F, Fut, T>(router: &Arc<RequestRouter>, ctx: &RequestContext, call: F) -> Result<T>
where
    F: FnOnce(Arc<RequestRouter>, RequestContext) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(call(router.clone(), ctx.clone()))
        .await
        .unwrap_or_else(|e| Err(Error::Internal(format!("router task failed: {}", e))))
}

// =============================================================================
// Query Parsing
// =============================================================================

/// Turn query-string pairs into a router query.
///
/// `fields`, `sort_key`, `sort_dir`, `limit`, `marker` and `page_reverse` are
/// reserved; every other key is a filter and may repeat.
pub fn parse_router_query(pairs: &[(String, String)]) -> std::result::Result<RouterQuery, String> {
    let mut query = RouterQuery::default();
    let mut sort_keys = Vec::new();
    let mut sort_dirs = Vec::new();

    for (key, value) in pairs {
        match key.as_str() {
            "fields" => query
                .fields
                .get_or_insert_with(Vec::new)
                .push(value.clone()),
            "sort_key" => sort_keys.push(value.clone()),
            "sort_dir" => sort_dirs.push(match value.as_str() {
                "asc" => true,
                "desc" => false,
                other => return Err(format!("invalid sort_dir: {}", other)),
            }),
            "limit" => {
                query.limit = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid limit: {}", value))?,
                )
            }
            "marker" => query.marker = Some(value.clone()),
            "page_reverse" => {
                query.page_reverse = value
                    .parse()
                    .map_err(|_| format!("invalid page_reverse: {}", value))?
            }
            _ => query
                .filters
                .entry(key.clone())
                .or_default()
                .push(value.clone()),
        }
    }

    if !sort_dirs.is_empty() && sort_dirs.len() != sort_keys.len() {
        return Err("sort_key and sort_dir must be given in pairs".into());
    }
    query.sorts = sort_keys
        .into_iter()
        .enumerate()
        .map(|(i, key)| SortKey {
            key,
            ascending: sort_dirs.get(i).copied().unwrap_or(true),
        })
        .collect();

    Ok(query)
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    router: Arc<RequestRouter>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(router: Arc<RequestRouter>) -> Self {
        Self { router }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            router: self.router,
        };

        Router::new()
            // Router endpoints
            .route("/v1/routers", post(create_router).get(list_routers))
            .route("/v1/routers/count", get(count_routers))
            .route(
                "/v1/routers/:id",
                get(get_router).put(update_router).delete(delete_router),
            )
            .route(
                "/v1/routers/:id/add_router_interface",
                put(add_router_interface),
            )
            .route(
                "/v1/routers/:id/remove_router_interface",
                put(remove_router_interface),
            )
            // Default backend
            .route("/v1/passthrough/:operation", post(passthrough))
            // Health and metrics
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    router: Arc<RequestRouter>,
}

// =============================================================================
// Handlers
// =============================================================================

/// Create a router on a freshly allocated resource
async fn create_router(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RouterRequest>,
) -> Response {
    let ctx = request_context(&headers);
    debug!("[{}] Creating router {:?}", ctx.request_id, request.name);

    let created = detached(&state.router, &ctx, |router, ctx| async move {
        router.create_router(&ctx, request).await
    })
    .await;

    match created {
        Ok(router) => (StatusCode::CREATED, Json(router)).into_response(),
        Err(e) => error_response(&ctx, e),
    }
}

/// List routers across all bound backends
async fn list_routers(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let ctx = request_context(&headers);
    let query = match parse_router_query(&pairs) {
        Ok(query) => query,
        Err(message) => return bad_request(message),
    };

    match state.router.get_routers(&ctx, &query).await {
        Ok(routers) => (StatusCode::OK, Json(routers)).into_response(),
        Err(e) => error_response(&ctx, e),
    }
}

/// Count routers matching the filters
async fn count_routers(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let ctx = request_context(&headers);
    let filters = match parse_router_query(&pairs) {
        Ok(query) => query.filters,
        Err(message) => return bad_request(message),
    };

    match state.router.get_routers_count(&ctx, filters).await {
        Ok(count) => (StatusCode::OK, Json(CountResponse { count })).into_response(),
        Err(e) => error_response(&ctx, e),
    }
}

async fn get_router(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let ctx = request_context(&headers);
    let fields = match parse_router_query(&pairs) {
        Ok(query) => query.fields,
        Err(message) => return bad_request(message),
    };

    match state.router.get_router(&ctx, &id, fields.as_deref()).await {
        Ok(router) => (StatusCode::OK, Json(router)).into_response(),
        Err(e) => error_response(&ctx, e),
    }
}

async fn update_router(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<RouterRequest>,
) -> Response {
    let ctx = request_context(&headers);

    match state.router.update_router(&ctx, &id, request).await {
        Ok(router) => (StatusCode::OK, Json(router)).into_response(),
        Err(e) => error_response(&ctx, e),
    }
}

/// Delete a router and release its resource
async fn delete_router(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let ctx = request_context(&headers);

    let deleted = detached(&state.router, &ctx, |router, ctx| async move {
        router.delete_router(&ctx, &id).await
    })
    .await;

    match deleted {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&ctx, e),
    }
}

async fn add_router_interface(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(interface_info): Json<Value>,
) -> Response {
    let ctx = request_context(&headers);

    match state
        .router
        .add_router_interface(&ctx, &id, interface_info)
        .await
    {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => error_response(&ctx, e),
    }
}

async fn remove_router_interface(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(interface_info): Json<Value>,
) -> Response {
    let ctx = request_context(&headers);

    match state
        .router
        .remove_router_interface(&ctx, &id, interface_info)
        .await
    {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => error_response(&ctx, e),
    }
}

/// Forward an operation to the default backend
async fn passthrough(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(operation): Path<String>,
    Json(args): Json<Value>,
) -> Response {
    let ctx = request_context(&headers);

    match state.router.passthrough(&ctx, &operation, args).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => error_response(&ctx, e),
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.router.broker().store().health_check().await {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(e) => {
            warn!("Binding store not ready: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "binding store unavailable")
        }
    }
}

/// Prometheus exposition
async fn metrics(State(state): State<AppState>) -> Response {
    match state.router.broker().metrics().render() {
        Ok((content_type, body)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "metrics", "message": e.to_string() })),
        )
            .into_response(),
    }
}
