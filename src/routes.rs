use std::sync::Arc;

use axum::{
    Json,
    Router,
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    events::{CloudEvent, EventHandler, HandlerResponse},
    http_objects::{ApiError, HealthResponse, TenantServices},
};

#[derive(Clone)]
pub struct RouteState {
    pub handler: Arc<EventHandler>,
    /// Cancelled on shutdown; every request works under a child of it.
    pub shutdown: CancellationToken,
}

pub fn create_routes(route_state: RouteState) -> Router {
    Router::new()
        .route("/", post(ingest_event).with_state(route_state.clone()))
        .route("/events", post(ingest_event).with_state(route_state.clone()))
        .route("/health", get(health).with_state(route_state.clone()))
        .route(
            "/v1/tenants/{tenant_id}/services",
            get(list_tenant_services)
                .delete(delete_tenant_services)
                .with_state(route_state),
        )
}

async fn ingest_event(
    State(state): State<RouteState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<HandlerResponse>, ApiError> {
    let event = CloudEvent::from_http(&headers, &body)?;
    let cancel = state.shutdown.child_token();
    let response = state.handler.handle(&cancel, event).await?;
    Ok(Json(response))
}

async fn health(State(state): State<RouteState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        namespace: state.handler.manager().namespace().to_string(),
    })
}

async fn list_tenant_services(
    Path(tenant_id): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<TenantServices>, ApiError> {
    let cancel = state.shutdown.child_token();
    let services = state
        .handler
        .manager()
        .list_services(&cancel, &tenant_id)
        .await?;
    Ok(Json(TenantServices::new(&tenant_id, services)))
}

async fn delete_tenant_services(
    Path(tenant_id): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<TenantServices>, ApiError> {
    let cancel = state.shutdown.child_token();
    let deleted = state
        .handler
        .manager()
        .delete_tenant_services(&cancel, &tenant_id)
        .await?;
    Ok(Json(TenantServices::new(&tenant_id, deleted)))
}
