use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use supervisor::SupervisorError;
use thiserror::Error;

use crate::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Internal Server Error: {0}")]
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = match &self {
            ApiError::Supervisor(err) => match err {
                SupervisorError::FlowNotFound(_) | SupervisorError::ConnectionNotFound(_) => {
                    (StatusCode::NOT_FOUND, "NotFound")
                }
                SupervisorError::Validation(_) => (StatusCode::BAD_REQUEST, "ValidationError"),
                SupervisorError::InvalidTransition { .. } => {
                    (StatusCode::CONFLICT, "InvalidTransition")
                }
                SupervisorError::ConnectionDead(_) => (StatusCode::GONE, "ConnectionDead"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "SupervisorError"),
            },
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        };

        let error_message = match &self {
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) | ApiError::InternalError(msg) => {
                msg.clone()
            }
            ApiError::Supervisor(err) => format!("{}: {}", error_type, err),
        };

        if status_code.is_server_error() {
            tracing::error!("[API] {}", error_message);
        }

        let response = ApiResponse::<()>::error(&error_message);
        (status_code, Json(response)).into_response()
    }
}
