//! API error type and HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Internal(String),
}

impl From<caresync_core::Error> for ApiError {
    fn from(err: caresync_core::Error) -> Self {
        use caresync_core::Error;
        match err {
            Error::Forbidden(msg) => Self::Forbidden(msg),
            Error::IllegalInput(msg) => Self::BadRequest(msg),
            Error::NotFound(msg) => Self::NotFound(msg),
            Error::Database(msg) => Self::Internal(msg),
        }
    }
}

impl From<caresync_storage_sqlite::StorageError> for ApiError {
    fn from(err: caresync_storage_sqlite::StorageError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Internal(msg) => {
                error!("internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
