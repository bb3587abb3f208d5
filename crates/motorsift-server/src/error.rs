use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use motorsift_core::error::AppError;

use crate::dto::ErrorResponse;

/// Wrapper so we can implement `IntoResponse` for `AppError`.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Response {
        let body = ErrorResponse {
            error: "not_found".to_string(),
            message: message.into(),
        };
        (StatusCode::NOT_FOUND, axum::Json(body)).into_response()
    }

    pub fn conflict(message: impl Into<String>) -> Response {
        let body = ErrorResponse {
            error: "conflict".to_string(),
            message: message.into(),
        };
        (StatusCode::CONFLICT, axum::Json(body)).into_response()
    }
}

fn classify(err: &AppError) -> (StatusCode, &'static str) {
    match err {
        AppError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        AppError::SerializationError(_) => (StatusCode::BAD_REQUEST, "serialization_error"),
        AppError::ConfigError(_) => (StatusCode::SERVICE_UNAVAILABLE, "config_error"),
        AppError::DatabaseError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
        AppError::SourceRateLimited(_) | AppError::DailyQuotaExceeded { .. } => {
            (StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded")
        }
        AppError::SourceTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        AppError::SourceCircuitOpen { .. } | AppError::SourceUpstream { .. } => {
            (StatusCode::BAD_GATEWAY, "upstream_error")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = classify(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.0.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}
