//! Health endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tracing::warn;
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_health))]
pub struct HealthApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/healthz", get(get_health))
}

/// Reports the selected backends, storage reachability and uptime.
///
/// `status` is `"ok"`, or `"degraded"` while storage is unreachable. Always
/// HTTP 200 so load balancers keep routing status queries.
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "health",
    responses((status = 200, description = "Service health", body = Value))
)]
pub async fn get_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let service = &state.service;
    let storage_ok = match service.storage().check().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "storage health check failed");
            false
        }
    };

    Json(json!({
        "status": if storage_ok { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "status_backend": service.store().backend_name(),
        "dispatcher_backend": service.dispatcher().backend_name(),
        "storage": if storage_ok { "ok" } else { "unreachable" },
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}
