use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;

use crate::response::ApiResponse;

/// Grounded on the teacher's `ApiError`: one variant per downstream error source, each mapped to
/// a status code and a user-facing message in `IntoResponse`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    State(#[from] state::StateError),
    #[error(transparent)]
    Queue(#[from] queue::QueueError),
    #[error("task {0} not found")]
    TaskNotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::State(_) | ApiError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ApiResponse::<()>::error(&self.to_string());
        (status, Json(body)).into_response()
    }
}
