//! Error types for skymark-scorer

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use skymark_common::api::ErrorResponse;
use thiserror::Error;

use crate::store::{LookupError, StoreError};

/// API error type
///
/// Rendered as `{"error": "<message>"}` with the matching status code.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or empty parameters (400)
    #[error("{0}")]
    BadRequest(String),

    /// Unknown or expired match key (403)
    #[error("{0}")]
    Forbidden(String),

    /// Unknown resource (404)
    #[error("{0}")]
    NotFound(String),

    /// Match key already registered (409)
    #[error("{0}")]
    Conflict(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
        }
    }
}

impl From<LookupError> for ApiError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::UnknownMatch => ApiError::Forbidden(err.to_string()),
            LookupError::UnknownTag => ApiError::NotFound(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists(_) => ApiError::Conflict(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");

        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

/// Convenience Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
