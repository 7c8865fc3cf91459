use async_trait::async_trait;

use crate::errors::ChatError;
use crate::events::PollBatch;
use crate::ids::{ChatSessionId, ContactId};
use crate::messages::{BotMessage, ChatRequest};
use crate::session::ChatCredentials;

/// A chat session opened on the agent-chat backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenedChatSession {
    pub id: ChatSessionId,
    pub credentials: ChatCredentials,
}

/// The live-agent backend. Every call after `create_session` carries the
/// credentials it issued.
#[async_trait]
pub trait AgentChatClient: Send + Sync {
    async fn create_session(&self) -> Result<OpenedChatSession, ChatError>;

    async fn create_chat(
        &self,
        credentials: &ChatCredentials,
        request: &ChatRequest,
    ) -> Result<(), ChatError>;

    /// Long-poll for queued events after `ack`. A backend with nothing to
    /// report answers with a 204 status error.
    async fn poll(&self, credentials: &ChatCredentials, ack: i64) -> Result<PollBatch, ChatError>;

    async fn send_message(
        &self,
        credentials: &ChatCredentials,
        text: &str,
    ) -> Result<(), ChatError>;

    async fn end_chat(&self, credentials: &ChatCredentials, reason: &str) -> Result<(), ChatError>;

    /// Re-attach to an existing chat, returning refreshed credentials.
    async fn reconnect(
        &self,
        credentials: &ChatCredentials,
        offset: i64,
    ) -> Result<ChatCredentials, ChatError>;
}

/// Delivers messages back to the end user on their origin channel.
#[async_trait]
pub trait BotChannelClient: Send + Sync {
    async fn send_message(&self, message: &BotMessage) -> Result<(), ChatError>;
}

/// Looks up the CRM contact for a visitor, creating one if needed.
#[async_trait]
pub trait ContactResolver: Send + Sync {
    async fn get_or_create_contact(
        &self,
        name: &str,
        email: &str,
        phone: &str,
    ) -> Result<ContactId, ChatError>;
}
