use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::core::cache::CacheStats;
use crate::core::pool::{PoolStatus, RecycleOutcome, UtilizationSnapshot};
use crate::core::watchdog::WatchdogStats;
use crate::errors::AppResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub utilization: UtilizationSnapshot,
    pub watchdog: WatchdogStats,
    pub pool: PoolStatus,
    /// Absent when the segment cache is disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}

/// Utilization, watchdog and cache statistics
pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let pipeline = &state.pipeline;
    Json(StatsResponse {
        utilization: pipeline.get_utilization_stats(),
        watchdog: pipeline.get_watchdog_stats(),
        pool: pipeline.pool_status(),
        cache: pipeline.cache_stats(),
    })
}

/// Reset utilization counters
pub async fn reset_stats(State(state): State<Arc<AppState>>) -> StatusCode {
    state.pipeline.reset_utilization_stats();
    info!("Utilization stats reset");
    StatusCode::NO_CONTENT
}

/// Recycle the backend pool now
///
/// Returns `{"status": "already_running"}` when a recycle is in progress.
pub async fn recycle(State(state): State<Arc<AppState>>) -> AppResult<Json<RecycleOutcome>> {
    info!("Manual recycle requested");
    Ok(Json(state.pipeline.recycle().await?))
}
