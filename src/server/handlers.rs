//! HTTP Transport Handlers
//!
//! Thin JSON adapters over the facade: decode the request, delegate, map the
//! outcome to a status code. No business logic lives here.

use crate::facade::{HealthCheckRequest, LifecycleState, ResourceServer};
use crate::index::types::{
    CountManagedObjectsRequest, ListManagedObjectsRequest, ResourceStatsRequest, SearchRequest,
};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use std::sync::Arc;

use super::auth::{Authenticator, Identity, require_identity};

pub const ENDPOINT_SEARCH: &str = "/search";
pub const ENDPOINT_STATS: &str = "/stats";
pub const ENDPOINT_MANAGED_LIST: &str = "/managed/list";
pub const ENDPOINT_MANAGED_COUNT: &str = "/managed/count";
pub const ENDPOINT_HEALTHZ: &str = "/healthz";
pub const ENDPOINT_HEALTH: &str = "/health";
pub const ENDPOINT_ROUTES: &str = "/routes";

const ALL_ENDPOINTS: &[&str] = &[
    ENDPOINT_SEARCH,
    ENDPOINT_STATS,
    ENDPOINT_MANAGED_LIST,
    ENDPOINT_MANAGED_COUNT,
    ENDPOINT_HEALTHZ,
    ENDPOINT_HEALTH,
    ENDPOINT_ROUTES,
];

fn error_response(status: StatusCode, err: anyhow::Error) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

fn subject(identity: &Identity) -> &'static str {
    match identity {
        Identity::Service => "service",
        Identity::Anonymous => "anonymous",
    }
}

fn check_access(server: &ResourceServer, identity: &Identity, action: &str) -> Option<Response> {
    if server.access_client().allow(subject(identity), action) {
        None
    } else {
        Some(
            (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({ "error": "access denied" })),
            )
                .into_response(),
        )
    }
}

pub async fn handle_search(
    Extension(server): Extension<Arc<ResourceServer>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SearchRequest>,
) -> Response {
    if let Some(denied) = check_access(&server, &identity, "search") {
        return denied;
    }
    match server.search(&req).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => {
            tracing::debug!("search failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

pub async fn handle_stats(
    Extension(server): Extension<Arc<ResourceServer>>,
    Json(req): Json<ResourceStatsRequest>,
) -> Response {
    match server.get_stats(&req).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

pub async fn handle_list_managed(
    Extension(server): Extension<Arc<ResourceServer>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<ListManagedObjectsRequest>,
) -> Response {
    if let Some(denied) = check_access(&server, &identity, "list") {
        return denied;
    }
    match server.list_managed_objects(&req).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

pub async fn handle_count_managed(
    Extension(server): Extension<Arc<ResourceServer>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<CountManagedObjectsRequest>,
) -> Response {
    if let Some(denied) = check_access(&server, &identity, "count") {
        return denied;
    }
    match server.count_managed_objects(&req).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Liveness probe: answerable even when indexing failed.
pub async fn handle_healthz(
    Extension(server): Extension<Arc<ResourceServer>>,
) -> Response {
    match server.is_healthy(&HealthCheckRequest::default()).await {
        Ok(resp) if resp.healthy => (StatusCode::OK, Json(resp)).into_response(),
        Ok(resp) => (StatusCode::SERVICE_UNAVAILABLE, Json(resp)).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

/// Detailed health: the liveness verdict plus the facade lifecycle state.
pub async fn handle_health(
    Extension(server): Extension<Arc<ResourceServer>>,
) -> Response {
    let healthy = server
        .is_healthy(&HealthCheckRequest::default())
        .await
        .map(|r| r.healthy)
        .unwrap_or(false);
    let state = match server.lifecycle_state() {
        LifecycleState::Uninitialized => "uninitialized".to_string(),
        LifecycleState::Initializing => "initializing".to_string(),
        LifecycleState::Ready => "ready".to_string(),
        LifecycleState::Failed(msg) => format!("failed: {}", msg),
        LifecycleState::Stopped(msg) => format!("stopped: {}", msg),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "healthy": healthy,
            "state": state,
            "resource_version": server.resource_version(),
        })),
    )
        .into_response()
}

/// Lists the service's endpoints so clients can discover the surface.
pub async fn handle_routes() -> (StatusCode, Json<Vec<&'static str>>) {
    (StatusCode::OK, Json(ALL_ENDPOINTS.to_vec()))
}

/// Assembles the full HTTP surface with authentication applied to every
/// route.
pub fn router(server: Arc<ResourceServer>, auth: Arc<Authenticator>) -> Router {
    Router::new()
        .route(ENDPOINT_SEARCH, post(handle_search))
        .route(ENDPOINT_STATS, post(handle_stats))
        .route(ENDPOINT_MANAGED_LIST, post(handle_list_managed))
        .route(ENDPOINT_MANAGED_COUNT, post(handle_count_managed))
        .route(ENDPOINT_HEALTHZ, get(handle_healthz))
        .route(ENDPOINT_HEALTH, get(handle_health))
        .route(ENDPOINT_ROUTES, get(handle_routes))
        .layer(axum::middleware::from_fn(require_identity))
        .layer(Extension(server))
        .layer(Extension(auth))
}
