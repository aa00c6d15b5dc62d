//! Mapping of [`SecurityError`] onto HTTP responses.
//!
//! Cross-tenant denials, cache outages and cancelled operations produce the
//! same status and body, so a caller cannot tell which one it hit. The real
//! reason goes to the log only.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tablefence_core::SecurityError;
use tracing::{error, warn};

#[derive(Debug)]
pub struct ApiError(pub SecurityError);

impl From<SecurityError> for ApiError {
    fn from(err: SecurityError) -> Self {
        Self(err)
    }
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            SecurityError::Authentication { .. } => StatusCode::UNAUTHORIZED,
            SecurityError::Authorization { .. }
            | SecurityError::ServiceUnavailable { .. }
            | SecurityError::Cancelled => StatusCode::FORBIDDEN,
            SecurityError::OperationFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SecurityError::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.0.kind(), error = %self.0, "request failed");
        } else {
            warn!(kind = self.0.kind(), error = %self.0, "request refused");
        }
        (status, Json(json!({ "error": self.0.public_message() }))).into_response()
    }
}
