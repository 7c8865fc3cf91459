use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{
    CaseId, ChannelSessionId, ChatSessionId, ContactId, ConversationKey, UserId, KEY_SEPARATOR,
};

/// Lifecycle status of a bridged conversation.
///
/// `OnHold` is always the initial state. `Closed` and `Failed` are terminal:
/// nothing leaves them, and a new conversation under the same key has to be
/// created from scratch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    OnHold,
    Active,
    Closed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether `self -> next` is an edge of the session state machine.
    /// Self-loops are only legal on the non-terminal states.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (OnHold, OnHold) | (OnHold, Active) | (OnHold, Failed) | (OnHold, Closed)
                | (Active, Active) | (Active, Closed)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OnHold => write!(f, "ON_HOLD"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ON_HOLD" => Ok(Self::OnHold),
            "ACTIVE" => Ok(Self::Active),
            "CLOSED" => Ok(Self::Closed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("illegal session transition {from} -> {to}")]
pub struct TransitionError {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// Credentials issued by the agent-chat backend when a chat session is opened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatCredentials {
    pub affinity_token: String,
    pub session_key: String,
}

/// Why a [`StartChatRequest`] was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("{0} must not contain '{sep}'", sep = KEY_SEPARATOR)]
    Separator(&'static str),
}

/// Inbound "start chat" request as received from the bot front end.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartChatRequest {
    pub user_id: String,
    pub session_id: String,
    pub provider: String,
    pub bot_id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StartChatRequest {
    /// Check that the identity fields are present, and that the two halves
    /// of the conversation key cannot run into each other.
    pub fn validate(&self) -> Result<(), RequestError> {
        let required = [
            ("userId", &self.user_id),
            ("sessionId", &self.session_id),
            ("provider", &self.provider),
            ("botId", &self.bot_id),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(RequestError::Missing(field));
            }
        }
        for (field, value) in [("userId", &self.user_id), ("sessionId", &self.session_id)] {
            if value.contains(KEY_SEPARATOR) {
                return Err(RequestError::Separator(field));
            }
        }
        Ok(())
    }

    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(
            &UserId::from_raw(self.user_id.as_str()),
            &ChannelSessionId::from_raw(self.session_id.as_str()),
        )
    }

    /// Display name shown to agents; falls back to the user id.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.user_id
        } else {
            &self.name
        }
    }
}

/// One conversation bridge between a bot-channel user and the agent chat.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub key: ConversationKey,
    pub user_id: UserId,
    pub channel_session_id: ChannelSessionId,
    pub client_scope: String,
    pub provider: String,
    pub bot_id: String,
    pub display_name: String,
    pub email: String,
    pub phone: String,
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub contact_id: ContactId,
    pub chat_session_id: ChatSessionId,
    credentials: ChatCredentials,
    pub case_id: Option<CaseId>,
    offset: i64,
    status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Build the record for a freshly opened chat. Always starts `OnHold`.
    pub fn on_hold(
        request: &StartChatRequest,
        client_scope: &str,
        contact_id: ContactId,
        chat_session_id: ChatSessionId,
        credentials: ChatCredentials,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: request.conversation_key(),
            user_id: UserId::from_raw(request.user_id.as_str()),
            channel_session_id: ChannelSessionId::from_raw(request.session_id.as_str()),
            client_scope: client_scope.to_string(),
            provider: request.provider.clone(),
            bot_id: request.bot_id.clone(),
            display_name: request.display_name().to_string(),
            email: request.email.clone(),
            phone: request.phone.clone(),
            extra: request.extra.clone(),
            contact_id,
            chat_session_id,
            credentials,
            case_id: None,
            offset: 0,
            status: SessionStatus::OnHold,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn credentials(&self) -> &ChatCredentials {
        &self.credentials
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn transition(&mut self, next: SessionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        if self.status != next {
            self.status = next;
            self.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Move the poll cursor forward. Returns false (and keeps the old value)
    /// if `offset` would move it backwards or not at all.
    pub fn advance_offset(&mut self, offset: i64) -> bool {
        if offset > self.offset {
            self.offset = offset;
            true
        } else {
            false
        }
    }

    /// Record the case id the first time one is reported.
    pub fn set_case_id(&mut self, case_id: CaseId) -> bool {
        if self.case_id.is_some() || case_id.is_empty() {
            return false;
        }
        self.case_id = Some(case_id);
        true
    }

    /// Swap credentials after an explicit reconnect. The offset is kept.
    pub fn reconnect(&mut self, credentials: ChatCredentials) {
        self.credentials = credentials;
        self.updated_at = Utc::now();
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.to_std().map(|age| age > max_age).unwrap_or(false)
    }
}
