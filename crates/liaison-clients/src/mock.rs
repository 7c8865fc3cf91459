//! In-process collaborators for deterministic tests without network calls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use liaison_core::ids::{ChatSessionId, ContactId};
use liaison_core::messages::{BotMessage, ChatRequest};
use liaison_core::{
    AgentChatClient, AgentChatEvent, BotChannelClient, ChatCredentials, ChatError, ContactResolver,
    OpenedChatSession, PollBatch,
};

/// One pre-programmed answer to `poll`.
pub enum PollStep {
    Batch(PollBatch),
    Fail(ChatError),
    /// Wait, then answer with the inner step.
    Delay(Duration, Box<PollStep>),
}

impl PollStep {
    pub fn events(offset: i64, events: Vec<AgentChatEvent>) -> Self {
        Self::Batch(PollBatch { events, offset })
    }

    pub fn no_content() -> Self {
        Self::status(204)
    }

    pub fn status(code: u16) -> Self {
        Self::Fail(ChatError::from_status(code, ""))
    }

    pub fn delayed(delay: Duration, inner: PollStep) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Agent-chat backend that answers polls from a script and records every call.
///
/// Sessions get credentials `aff-N`/`key-N` in creation order. Polls for a
/// session key with its own script consume that script; otherwise the shared
/// script is used. An exhausted script never answers.
#[derive(Default)]
pub struct ScriptedAgentChat {
    shared: Mutex<VecDeque<PollStep>>,
    per_session: Mutex<HashMap<String, VecDeque<PollStep>>>,
    created: AtomicUsize,
    create_delay: Option<Duration>,
    fail_create_session: Option<ChatError>,
    fail_create_chat: Option<ChatError>,
    fail_reconnect: Option<ChatError>,
    fail_send: AtomicBool,
    chat_requests: Mutex<Vec<ChatRequest>>,
    acks: Mutex<Vec<i64>>,
    sent: Mutex<Vec<(String, String)>>,
    ended: Mutex<Vec<(String, String)>>,
    reconnects: Mutex<Vec<(String, i64)>>,
}

impl ScriptedAgentChat {
    pub fn new(script: Vec<PollStep>) -> Self {
        Self {
            shared: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub fn with_session_script(self, session_key: &str, script: Vec<PollStep>) -> Self {
        self.per_session.lock().insert(session_key.to_string(), script.into());
        self
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn failing_create_session(mut self, err: ChatError) -> Self {
        self.fail_create_session = Some(err);
        self
    }

    pub fn failing_create_chat(mut self, err: ChatError) -> Self {
        self.fail_create_chat = Some(err);
        self
    }

    pub fn failing_reconnect(mut self, err: ChatError) -> Self {
        self.fail_reconnect = Some(err);
        self
    }

    pub fn set_send_failure(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn sessions_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn chat_requests(&self) -> Vec<ChatRequest> {
        self.chat_requests.lock().clone()
    }

    pub fn poll_count(&self) -> usize {
        self.acks.lock().len()
    }

    /// `ack` values seen by `poll`, in call order.
    pub fn acks(&self) -> Vec<i64> {
        self.acks.lock().clone()
    }

    /// Texts sent to the agent, in order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, text)| text.clone()).collect()
    }

    /// `(session_key, reason)` for every `end_chat`.
    pub fn ended(&self) -> Vec<(String, String)> {
        self.ended.lock().clone()
    }

    /// `(session_key, offset)` for every `reconnect`.
    pub fn reconnects(&self) -> Vec<(String, i64)> {
        self.reconnects.lock().clone()
    }

    fn next_step(&self, session_key: &str) -> Option<PollStep> {
        if let Some(script) = self.per_session.lock().get_mut(session_key) {
            return script.pop_front();
        }
        self.shared.lock().pop_front()
    }
}

#[async_trait]
impl AgentChatClient for ScriptedAgentChat {
    async fn create_session(&self) -> Result<OpenedChatSession, ChatError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.fail_create_session {
            return Err(err.clone());
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(OpenedChatSession {
            id: ChatSessionId::from_raw(format!("chat-{n}")),
            credentials: ChatCredentials {
                affinity_token: format!("aff-{n}"),
                session_key: format!("key-{n}"),
            },
        })
    }

    async fn create_chat(
        &self,
        _credentials: &ChatCredentials,
        request: &ChatRequest,
    ) -> Result<(), ChatError> {
        if let Some(err) = &self.fail_create_chat {
            return Err(err.clone());
        }
        self.chat_requests.lock().push(request.clone());
        Ok(())
    }

    async fn poll(&self, credentials: &ChatCredentials, ack: i64) -> Result<PollBatch, ChatError> {
        self.acks.lock().push(ack);
        let mut step = match self.next_step(&credentials.session_key) {
            Some(step) => step,
            None => return std::future::pending().await,
        };
        loop {
            match step {
                PollStep::Batch(batch) => return Ok(batch),
                PollStep::Fail(err) => return Err(err),
                PollStep::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    step = *inner;
                }
            }
        }
    }

    async fn send_message(
        &self,
        credentials: &ChatCredentials,
        text: &str,
    ) -> Result<(), ChatError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(ChatError::from_status(500, "send rejected"));
        }
        self.sent
            .lock()
            .push((credentials.session_key.clone(), text.to_string()));
        Ok(())
    }

    async fn end_chat(&self, credentials: &ChatCredentials, reason: &str) -> Result<(), ChatError> {
        self.ended
            .lock()
            .push((credentials.session_key.clone(), reason.to_string()));
        Ok(())
    }

    async fn reconnect(
        &self,
        credentials: &ChatCredentials,
        offset: i64,
    ) -> Result<ChatCredentials, ChatError> {
        self.reconnects
            .lock()
            .push((credentials.session_key.clone(), offset));
        if let Some(err) = &self.fail_reconnect {
            return Err(err.clone());
        }
        Ok(ChatCredentials {
            affinity_token: format!("{}-re", credentials.affinity_token),
            session_key: credentials.session_key.clone(),
        })
    }
}

/// Bot channel that keeps every delivered message.
#[derive(Default)]
pub struct RecordingBotChannel {
    messages: Mutex<Vec<BotMessage>>,
    fail: AtomicBool,
    delay: Option<Duration>,
}

impl RecordingBotChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send sleeps this long first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failure(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<BotMessage> {
        self.messages.lock().clone()
    }

    /// Plain-text rendering of every delivered message, in order.
    pub fn texts(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .map(|m| m.content.as_plain_text())
            .collect()
    }
}

#[async_trait]
impl BotChannelClient for RecordingBotChannel {
    async fn send_message(&self, message: &BotMessage) -> Result<(), ChatError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChatError::Network("channel unreachable".into()));
        }
        self.messages.lock().push(message.clone());
        Ok(())
    }
}

/// Contact resolver that always answers with the same id (or error).
pub struct StaticContactResolver {
    result: Result<ContactId, ChatError>,
    calls: AtomicUsize,
}

impl StaticContactResolver {
    pub fn new(contact_id: &str) -> Self {
        Self {
            result: Ok(ContactId::from_raw(contact_id)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: ChatError) -> Self {
        Self {
            result: Err(err),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContactResolver for StaticContactResolver {
    async fn get_or_create_contact(
        &self,
        _name: &str,
        _email: &str,
        _phone: &str,
    ) -> Result<ContactId, ChatError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}
