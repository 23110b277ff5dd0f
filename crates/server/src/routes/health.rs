use axum::{Json, extract::State};
use serde::Serialize;
use supervisor::reliability::ReliabilitySnapshot;

use crate::{AppState, response::ApiResponse};

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: &'static str,
    pub active_runs: usize,
    pub active_flows: usize,
    pub alive_connections: usize,
    pub active_alerts: usize,
    pub reliability: ReliabilitySnapshot,
}

pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthStatus>> {
    let active_alerts = state.monitor.active_alerts().await.len();
    Json(ApiResponse::success(HealthStatus {
        status: if active_alerts == 0 { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        active_runs: state.engine.active_run_ids().len(),
        active_flows: state.engine.flows().len(),
        alive_connections: state.connections.stats().alive_connections,
        active_alerts,
        reliability: state.engine.reliability().snapshot(),
    }))
}
