use liaison_core::{ChatError, ConversationKey, RequestError};
use liaison_store::StoreError;

/// Errors surfaced synchronously by the session manager. Worker failures
/// never become a `RelayError`; they turn into transitions and log lines.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("an active session already exists for {0}")]
    ConflictActiveSession(ConversationKey),

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("contact resolution failed: {0}")]
    ContactResolution(ChatError),

    #[error("agent chat creation failed: {0}")]
    ChatCreation(ChatError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("session not found: {0}")]
    NotFound(ConversationKey),

    #[error("session manager is shutting down")]
    ShuttingDown,
}

impl RelayError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConflictActiveSession(_) => "conflict",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ContactResolution(_) => "contact_resolution",
            Self::ChatCreation(_) => "chat_creation",
            Self::Store(_) => "store",
            Self::NotFound(_) => "not_found",
            Self::ShuttingDown => "shutting_down",
        }
    }

    /// Whether the failure came from an external collaborator.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::ContactResolution(_) | Self::ChatCreation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_kind() {
        let err = RelayError::ConflictActiveSession(ConversationKey::from_raw("u:s"));
        assert_eq!(err.to_string(), "an active session already exists for u:s");
        assert_eq!(err.error_kind(), "conflict");
        assert!(!err.is_upstream());
    }

    #[test]
    fn invalid_request_names_the_field() {
        let err: RelayError = RequestError::Separator("userId").into();
        assert_eq!(err.to_string(), "invalid request: userId must not contain ':'");
        assert_eq!(err.error_kind(), "invalid_request");
    }

    #[test]
    fn upstream_errors() {
        let err = RelayError::ChatCreation(ChatError::from_status(503, "down"));
        assert!(err.is_upstream());
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn store_error_converts() {
        let err: RelayError = StoreError::Database("locked".into()).into();
        assert!(matches!(err, RelayError::Store(_)));
    }
}
