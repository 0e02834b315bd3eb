use axum::{Json, extract::State};
use serde::Serialize;
use std::sync::Arc;

use crate::core::pool::PoolHealth;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pool: PoolHealth,
}

/// Health check
///
/// Always answers `OK` while the process serves requests; `pool` reports
/// whether synthesis is fully available, degraded to fewer backends, or down.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK",
        pool: state.pipeline.health(),
    })
}
