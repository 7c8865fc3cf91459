use serde::{Deserialize, Serialize};

use crate::ids::CaseId;

/// Events delivered by the agent-chat backend on a poll.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentChatEvent {
    /// The chat request was queued for routing to an agent.
    #[serde(rename = "chat_request_success")]
    ChatRequestSuccess {
        queue_position: Option<u32>,
        estimated_wait_secs: Option<u64>,
        case_id: Option<CaseId>,
    },

    #[serde(rename = "queue_update")]
    QueueUpdate {
        position: Option<u32>,
        estimated_wait_secs: Option<u64>,
    },

    #[serde(rename = "chat_established")]
    ChatEstablished { agent_name: String },

    /// No agent could take the chat.
    #[serde(rename = "chat_request_fail")]
    ChatRequestFail { reason: Option<String> },

    #[serde(rename = "chat_message")]
    ChatMessage { agent_name: String, text: String },

    #[serde(rename = "agent_typing")]
    AgentTyping,

    #[serde(rename = "agent_not_typing")]
    AgentNotTyping,

    #[serde(rename = "chat_ended")]
    ChatEnded { reason: Option<String> },

    #[serde(rename = "unknown")]
    Unknown { kind: String },
}

impl AgentChatEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ChatRequestSuccess { .. } => "chat_request_success",
            Self::QueueUpdate { .. } => "queue_update",
            Self::ChatEstablished { .. } => "chat_established",
            Self::ChatRequestFail { .. } => "chat_request_fail",
            Self::ChatMessage { .. } => "chat_message",
            Self::AgentTyping => "agent_typing",
            Self::AgentNotTyping => "agent_not_typing",
            Self::ChatEnded { .. } => "chat_ended",
            Self::Unknown { .. } => "unknown",
        }
    }
}

/// Result of one successful poll: events in arrival order plus the new cursor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PollBatch {
    pub events: Vec<AgentChatEvent>,
    pub offset: i64,
}
