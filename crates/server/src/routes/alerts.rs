use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::Deserialize;
use supervisor::Alert;

use crate::{AppState, error::ApiError, response::ApiResponse};

#[derive(Debug, Default, Deserialize)]
pub struct AlertsQuery {
    /// Include resolved alerts not yet swept
    #[serde(default)]
    pub all: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/alerts", get(list_alerts))
        .route("/alerts/{metric_name}/resolve", post(resolve_alert))
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Json<ApiResponse<Vec<Alert>>> {
    let alerts = if query.all {
        state.monitor.all_alerts().await
    } else {
        state.monitor.active_alerts().await
    };
    Json(ApiResponse::success(alerts))
}

async fn resolve_alert(
    State(state): State<AppState>,
    Path(metric_name): Path<String>,
) -> Result<Json<ApiResponse<String>>, ApiError> {
    if !state.monitor.resolve(&metric_name).await {
        return Err(ApiError::NotFound(format!(
            "No active alert for {}",
            metric_name
        )));
    }
    Ok(Json(ApiResponse::success(metric_name)))
}
