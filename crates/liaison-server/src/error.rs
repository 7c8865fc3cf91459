use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use liaison_engine::RelayError;
use liaison_store::StoreError;

/// Errors returned by HTTP handlers, each mapped to one status code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "INVALID_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let message = err.to_string();
        match err {
            RelayError::InvalidRequest(_) => Self::BadRequest(message),
            RelayError::ConflictActiveSession(_) => Self::Conflict(message),
            RelayError::ContactResolution(_) | RelayError::ChatCreation(_) => {
                Self::Upstream(message)
            }
            RelayError::NotFound(_) => Self::NotFound(message),
            RelayError::ShuttingDown => Self::Unavailable(message),
            RelayError::Store(_) => Self::Internal(message),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        if err.is_not_found() {
            Self::NotFound(err.to_string())
        } else {
            Self::Internal(err.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            tracing::warn!(error = %self, code = self.code(), "request failed");
        }
        let body = json!({ "error": { "code": self.code(), "message": self.to_string() } });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liaison_core::{ChatError, ConversationKey, RequestError};

    #[test]
    fn relay_errors_map_to_status_codes() {
        let cases = [
            (
                RelayError::InvalidRequest(RequestError::Missing("userId")),
                StatusCode::BAD_REQUEST,
            ),
            (
                RelayError::ConflictActiveSession(ConversationKey::from_raw("u:s")),
                StatusCode::CONFLICT,
            ),
            (
                RelayError::ChatCreation(ChatError::from_status(500, "")),
                StatusCode::BAD_GATEWAY,
            ),
            (
                RelayError::ContactResolution(ChatError::Network("down".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (RelayError::NotFound(ConversationKey::from_raw("u:s")), StatusCode::NOT_FOUND),
            (RelayError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn store_not_found_is_404() {
        let err = ApiError::from(StoreError::NotFound("session u:s".into()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
