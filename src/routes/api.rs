use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::{api, speak, stats};
use crate::state::AppState;
use std::sync::Arc;

/// Create the API router
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/speak", post(speak::speak_handler))
        .route("/stats", get(stats::get_stats))
        .route("/stats/reset", post(stats::reset_stats))
        .route("/admin/recycle", post(stats::recycle))
        .layer(TraceLayer::new_for_http())
}

/// Public routes (health check)
pub fn create_public_router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(api::health_check))
}
