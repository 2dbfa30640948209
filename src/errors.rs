use axum::{http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::store::StoreError;

/// Handler rejection: status plus `{"error": "..."}` body.
pub type ApiError = (StatusCode, Json<Value>);

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

pub fn unauthorized() -> ApiError {
    api_error(StatusCode::UNAUTHORIZED, "Authentication required")
}

/// Validation problems go back to the client verbatim; everything else is
/// logged and reported as `fallback`.
pub fn store_failure(err: StoreError, fallback: &str) -> ApiError {
    match err {
        StoreError::Validation(msg) => api_error(StatusCode::BAD_REQUEST, msg),
        StoreError::Conflict(msg) => {
            warn!(conflict = %msg, "{fallback}");
            api_error(StatusCode::CONFLICT, fallback)
        }
        other => {
            error!(error = %other, "{fallback}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, fallback)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn validation_is_client_error_and_timeout_is_generic() {
        let (status, Json(body)) = store_failure(StoreError::Validation("invalid url".into()), "Failed");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid url");

        let (status, Json(body)) = store_failure(StoreError::Timeout(Duration::from_secs(1)), "Failed to fetch QR codes");
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to fetch QR codes");

        let (status, _) = store_failure(StoreError::Conflict("users_provider_provider_id_key".into()), "Failed");
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
