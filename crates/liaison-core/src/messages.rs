use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ContactId, ConversationKey, UserId};
use crate::session::ChatCredentials;

/// Payload of a message sent to or received from the end user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Media {
        url: String,
        mime_type: Option<String>,
        caption: Option<String>,
    },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Plain-text rendering used in transcripts: media collapses to its URL.
    pub fn as_plain_text(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Media { url, caption, .. } => match caption {
                Some(caption) if !caption.is_empty() => format!("{caption} ({url})"),
                _ => url.clone(),
            },
        }
    }
}

/// A message bound for the end user on their origin channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotMessage {
    pub conversation_key: ConversationKey,
    pub user_id: UserId,
    pub provider: String,
    pub bot_id: String,
    pub content: MessageContent,
}

/// A visitor message bound for the agent chat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub conversation_key: ConversationKey,
    pub credentials: ChatCredentials,
    pub text: String,
}

/// Everything the agent-chat backend needs to route a new chat request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub contact_id: ContactId,
    pub visitor_name: String,
    pub email: String,
    pub phone: String,
    pub provider: String,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextOrigin {
    User,
    Bot,
}

impl std::fmt::Display for ContextOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Bot => write!(f, "bot"),
        }
    }
}

impl std::str::FromStr for ContextOrigin {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "bot" => Ok(Self::Bot),
            other => Err(format!("unknown context origin: {other}")),
        }
    }
}

/// One transcript line kept for handing the conversation to a human agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub origin: ContextOrigin,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
}

impl ContextEntry {
    pub fn now(origin: ContextOrigin, content: MessageContent) -> Self {
        Self {
            origin,
            content,
            timestamp: Utc::now(),
        }
    }
}
