//! Service-specific error types
//!
//! Per-call upstream failures never surface here: the proxy client folds them
//! into a `ProxyResponse`. These are the failures a handler answers with a
//! non-200 status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use session_refresh::RefreshError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("refresh failed: {0}")]
    Refresh(#[from] RefreshError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Refresh(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error body: `{"success":false,"error":"..."}`
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": self.to_string(),
        });
        (self.status(), axum::Json(body)).into_response()
    }
}
