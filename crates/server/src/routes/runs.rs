//! Start and stop runs over HTTP. Progress is observed through the flow's
//! event stream.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use supervisor::{ExecutionPlan, RunRequest};

use crate::{AppState, error::ApiError, middleware::RequestId, response::ApiResponse};

#[derive(Debug, Deserialize)]
pub struct StartRunPayload {
    pub user_id: String,
    pub input: Value,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub plan: Option<ExecutionPlan>,
}

#[derive(Debug, Serialize)]
pub struct StartedRun {
    pub run_id: String,
    pub flow_id: String,
    pub request_id: String,
    pub thread_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelledRun {
    pub run_id: String,
    pub cancelled: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/runs", get(list_runs).post(start_run))
        .route("/runs/{run_id}/cancel", post(cancel_run))
}

async fn list_runs(State(state): State<AppState>) -> Json<ApiResponse<Vec<String>>> {
    Json(ApiResponse::success(state.engine.active_run_ids()))
}

async fn start_run(
    State(state): State<AppState>,
    request_id: RequestId,
    Json(payload): Json<StartRunPayload>,
) -> Result<(StatusCode, Json<ApiResponse<StartedRun>>), ApiError> {
    let mut request =
        RunRequest::new(payload.user_id, payload.input).with_request_id(request_id.as_str());
    if let Some(thread_id) = payload.thread_id {
        request = request.with_thread(thread_id);
    }
    if let Some(plan) = payload.plan {
        request = request.with_plan(plan);
    }
    request.title = payload.title;

    let handle = state.engine.start_run(request).await?;
    let started = StartedRun {
        run_id: handle.run_id().to_string(),
        flow_id: handle.flow_id().to_string(),
        request_id: request_id.0,
        thread_id: handle.context().await.thread_id().map(str::to_string),
    };

    tokio::spawn(async move {
        if let Err(e) = handle.wait().await {
            tracing::warn!("[RUNS] Run ended abnormally: {}", e);
        }
    });

    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(started))))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<ApiResponse<CancelledRun>>, ApiError> {
    if !state.engine.cancel_run(&run_id) {
        return Err(ApiError::NotFound(format!("No active run {}", run_id)));
    }
    Ok(Json(ApiResponse::success(CancelledRun {
        run_id,
        cancelled: true,
    })))
}
