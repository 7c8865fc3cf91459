use std::time::Duration;

/// Failure reported by one of the external collaborators (agent chat,
/// bot channel, contact resolver).
#[derive(Clone, Debug, thiserror::Error)]
pub enum ChatError {
    #[error("upstream returned {code}: {body}")]
    Status { code: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

/// How the polling loop should treat a failed poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing queued yet; keep polling.
    NoContent,
    Forbidden,
    ServiceUnavailable,
    Other,
}

impl PollOutcome {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoContent)
    }
}

impl ChatError {
    pub fn from_status(code: u16, body: impl Into<String>) -> Self {
        Self::Status {
            code,
            body: body.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn poll_outcome(&self) -> PollOutcome {
        match self.status() {
            Some(204) => PollOutcome::NoContent,
            Some(403) => PollOutcome::Forbidden,
            Some(503) => PollOutcome::ServiceUnavailable,
            _ => PollOutcome::Other,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Status { code: 204, .. } => "no_content",
            Self::Status { code: 403, .. } => "forbidden",
            Self::Status { code: 503, .. } => "service_unavailable",
            Self::Status { .. } => "status",
            Self::Network(_) => "network_error",
            Self::Decode(_) => "decode_error",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}
