//! HTTP mapping of relay errors.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use genrelay_core::api::ErrorBody;
use tracing::{debug, error};

use crate::relay::RelayError;

impl RelayError {
    /// Status code and machine-readable code of this error.
    pub const fn http_status(&self) -> (StatusCode, &'static str) {
        match self {
            Self::LockBusy { .. } => (StatusCode::CONFLICT, "lock_busy"),
            Self::PoolExhausted { .. } => (StatusCode::SERVICE_UNAVAILABLE, "pool_exhausted"),
            Self::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::UnknownMode(_) => (StatusCode::BAD_REQUEST, "unknown_mode"),
            Self::CommandNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, code) = self.http_status();
        if status.is_server_error() {
            error!(code, error = %self, "Request failed");
        } else {
            debug!(code, error = %self, "Request rejected");
        }
        let body = ErrorBody {
            error: self.to_string(),
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::DatabaseError;

    #[test]
    fn statuses_follow_error_kind() {
        let busy = RelayError::LockBusy {
            session_id: "chat_a".into(),
            response_id: "r1".into(),
        };
        assert_eq!(busy.http_status(), (StatusCode::CONFLICT, "lock_busy"));
        assert_eq!(
            RelayError::PoolExhausted { max: 2 }.http_status().0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RelayError::InvalidRequest("x".into()).http_status().0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::CommandNotFound("x".into()).http_status(),
            (StatusCode::NOT_FOUND, "not_found")
        );
        assert_eq!(
            RelayError::Storage(DatabaseError::Query("x".into()))
                .http_status()
                .0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn response_carries_status() {
        let response = RelayError::ShuttingDown.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
