//! Error-to-HTTP response conversion.
//!
//! Implements `IntoResponse` for [`rf_core::Error`] so that route handlers
//! can return `Result<T, AppError>` and use `?` on core results.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Wrapper so we can implement `IntoResponse` for an external type.
pub struct AppError(rf_core::Error);

impl AppError {
    pub fn code(&self) -> &'static str {
        match &self.0 {
            rf_core::Error::NotFound { .. } => "not_found",
            rf_core::Error::Validation(_) => "validation_error",
            rf_core::Error::Conflict(_) => "conflict",
            rf_core::Error::CapabilityDenied { .. } => "capability_denied",
            rf_core::Error::Database { .. } => "database_error",
            rf_core::Error::Io { .. } => "io_error",
            rf_core::Error::Storage(_) => "storage_error",
            rf_core::Error::Stage(_) => "stage_error",
            rf_core::Error::Internal(_) => "internal_error",
        }
    }
}

impl From<rf_core::Error> for AppError {
    fn from(e: rf_core::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(
                status = %status,
                error = %self.0,
                "Server error in API handler"
            );
        }

        let body = json!({
            "error": self.0.to_string(),
            "code": self.code(),
        });

        (status, axum::Json(body)).into_response()
    }
}
