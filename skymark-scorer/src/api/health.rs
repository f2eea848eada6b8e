//! Health check endpoint

use axum::{routing::get, Json, Router};
use skymark_common::api::{HealthResponse, HEALTH_PATH};

use crate::AppState;

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        module: "skymark-scorer".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route(HEALTH_PATH, get(health_check))
}
