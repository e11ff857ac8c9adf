//! API-facing error type: translates [`EngineError`] and request-validation
//! failures into HTTP status codes and a `{"error": "..."}` body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use engine::EngineError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            ApiError::Engine(e) => (engine_status(e), e.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn engine_status(e: &EngineError) -> StatusCode {
    match e {
        EngineError::TaskNotFound(_) | EngineError::ItemNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidState(_) => StatusCode::CONFLICT,
        EngineError::Cancelled => StatusCode::GONE,
        EngineError::Classified { .. } | EngineError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
