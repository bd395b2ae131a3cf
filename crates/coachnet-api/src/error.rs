//! Mapping of [`GatewayError`] onto HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use coachnet_types::GatewayError;
use serde::Serialize;

pub type ApiResult<T> = Result<T, ApiError>;

/// A [`GatewayError`] on its way out of a handler.
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl ApiError {
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            GatewayError::Blocked { .. } => (StatusCode::LOCKED, "BLOCKED"),
            GatewayError::Unauthorized(_) => (StatusCode::FORBIDDEN, "UNAUTHORIZED"),
            GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            GatewayError::UnknownBus(_) => (StatusCode::NOT_FOUND, "UNKNOWN_BUS"),
            GatewayError::InvalidFrame(_) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_FRAME"),
            GatewayError::Filtered { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "FILTERED"),
            GatewayError::VerificationRequired(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "VERIFICATION_REQUIRED")
            }
            GatewayError::InvalidTransition { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_TRANSITION")
            }
            GatewayError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            GatewayError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self.0, code, "request failed");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(err: GatewayError) -> StatusCode {
        ApiError(err).status_and_code().0
    }

    #[test]
    fn safety_errors_map_to_distinct_statuses() {
        assert_eq!(
            status(GatewayError::Blocked { reason: "x".into() }),
            StatusCode::LOCKED
        );
        assert_eq!(status(GatewayError::Unauthorized("eve".into())), StatusCode::FORBIDDEN);
        assert_eq!(status(GatewayError::UnknownBus("aux".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status(GatewayError::InvalidFrame("too long".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status(GatewayError::Persistence("disk full".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
