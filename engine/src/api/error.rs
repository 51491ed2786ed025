use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sdk::errors::{EngineError, ErrorExt};
use serde_json::json;

/// Error returned by API handlers
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::CampaignNotFound(id) => {
                ApiError::NotFound(format!("Unknown campaign '{}'", id))
            }
            e @ EngineError::ConcurrentRefreshRejected { .. } => ApiError::Conflict(e.to_string()),
            e => {
                tracing::error!("API request failed: {} ({})", e, e.user_hint());
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match self {
            ApiError::NotFound(message) => json!({ "status": "not_found", "error": message }),
            ApiError::Conflict(message) => json!({ "status": "conflict", "error": message }),
            ApiError::Internal(message) => json!({ "status": "error", "error": message }),
        };
        (status, Json(body)).into_response()
    }
}
