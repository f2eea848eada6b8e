//! skymark-scorer library - Scoring authority
//!
//! Issues per-match tag -> points tables and answers point lookups for the
//! relay. All state is in memory and lives as long as the process.

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod error;
pub mod points;
pub mod store;

pub use error::{ApiError, ApiResult};
pub use points::PointsPolicy;
pub use store::{MatchStore, MatchTable};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Registered matches
    pub store: Arc<MatchStore>,
    /// Point generation rules for new matches
    pub policy: Arc<PointsPolicy>,
}

impl AppState {
    pub fn new(policy: PointsPolicy) -> Self {
        Self {
            store: Arc::new(MatchStore::new()),
            policy: Arc::new(policy),
        }
    }
}

/// Build application router
///
/// Browser-based match tools call the service directly, so CORS is open.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::match_routes())
        .merge(api::health_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
