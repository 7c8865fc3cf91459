//! One polling loop per live session.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use liaison_core::messages::{AgentMessage, BotMessage, ContextOrigin, MessageContent};
use liaison_core::{
    AgentChatClient, AgentChatEvent, ConversationKey, PollBatch, SessionRecord, SessionStatus,
};
use liaison_settings::{render, MessageTemplates};
use liaison_store::{ContextCache, SessionStore};

use crate::dispatch::Dispatcher;
use crate::state::{self, Effect};

/// A registered session: the record plus the token that stops its worker.
///
/// The record lock is only ever held for short, synchronous sections.
pub struct SessionHandle {
    record: RwLock<SessionRecord>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(record: SessionRecord, cancel: CancellationToken) -> Self {
        Self {
            record: RwLock::new(record),
            cancel,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.record.read().status()
    }

    pub fn snapshot(&self) -> SessionRecord {
        self.record.read().clone()
    }

    pub fn key(&self) -> ConversationKey {
        self.record.read().key.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Force a status from outside the worker (user-initiated end).
    /// Returns false if the transition is not a legal edge.
    pub(crate) fn close(&self) -> bool {
        self.record.write().transition(SessionStatus::Closed).is_ok()
    }
}

/// How a worker stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// Reached a terminal status and signalled the finish queue.
    Finished(SessionStatus),
    /// Stopped by cancellation; the session was left as it was.
    Cancelled,
}

/// Collaborators every worker uses.
#[derive(Clone)]
pub struct WorkerDeps {
    pub agent_chat: Arc<dyn AgentChatClient>,
    pub store: Arc<dyn SessionStore>,
    pub context: Arc<dyn ContextCache>,
    pub dispatcher: Dispatcher,
    pub templates: Arc<MessageTemplates>,
    pub poll_interval: Duration,
    pub finish_tx: mpsc::UnboundedSender<ConversationKey>,
}

pub struct PollingWorker {
    handle: Arc<SessionHandle>,
    deps: WorkerDeps,
}

impl PollingWorker {
    pub fn new(handle: Arc<SessionHandle>, deps: WorkerDeps) -> Self {
        Self { handle, deps }
    }

    /// Future for the whole loop, wrapped in a span carrying the conversation key.
    pub fn instrumented(self) -> impl std::future::Future<Output = WorkerExit> + Send + 'static {
        let span = tracing::info_span!("session_worker", conversation_key = %self.handle.key());
        self.run().instrument(span)
    }

    pub async fn run(self) -> WorkerExit {
        let cancel = self.handle.cancel.clone();
        info!("polling started");

        loop {
            if cancel.is_cancelled() {
                return self.cancelled();
            }

            let (credentials, ack) = {
                let record = self.handle.record.read();
                (record.credentials().clone(), record.offset())
            };

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancelled(),
                polled = self.deps.agent_chat.poll(&credentials, ack) => polled,
            };

            match polled {
                Ok(batch) => self.apply_batch(batch).await,
                Err(e) => {
                    let outcome = e.poll_outcome();
                    let current = self.handle.status();
                    match state::on_poll_failure(current, outcome) {
                        None => debug!(ack, "no content"),
                        Some(next) => {
                            warn!(
                                error = %e,
                                error_kind = e.error_kind(),
                                "poll failed, closing session"
                            );
                            self.set_status(next);
                            self.persist().await;
                        }
                    }
                }
            }

            let status = self.handle.status();
            if status.is_terminal() {
                info!(%status, "session reached terminal state");
                if self.deps.finish_tx.send(self.handle.key()).is_err() {
                    warn!("finish queue closed");
                }
                return WorkerExit::Finished(status);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancelled(),
                _ = tokio::time::sleep(self.deps.poll_interval) => {}
            }
        }
    }

    fn cancelled(&self) -> WorkerExit {
        debug!("polling cancelled");
        WorkerExit::Cancelled
    }

    async fn apply_batch(&self, batch: PollBatch) {
        let mut dirty = self.handle.record.write().advance_offset(batch.offset);

        for event in &batch.events {
            let current = self.handle.status();
            let Some(transition) = state::on_event(current, event, &self.deps.templates) else {
                match event {
                    AgentChatEvent::AgentTyping | AgentChatEvent::AgentNotTyping => {}
                    _ => warn!(
                        status = %current,
                        event = event.event_type(),
                        "event not valid in current state, ignored"
                    ),
                }
                continue;
            };
            debug!(
                event = event.event_type(),
                from = %current,
                to = %transition.next,
                "applying event"
            );

            let snapshot = {
                let mut record = self.handle.record.write();
                if record.status() != transition.next {
                    if let Err(e) = record.transition(transition.next) {
                        warn!(error = %e, "rejected transition");
                        continue;
                    }
                    dirty = true;
                }
                for effect in &transition.effects {
                    if let Effect::RecordCaseId(case_id) = effect {
                        dirty |= record.set_case_id(case_id.clone());
                    }
                }
                record.clone()
            };

            for effect in transition.effects {
                match effect {
                    Effect::ToUser(content) => self.to_user(&snapshot, content),
                    Effect::Greet => self.greet(&snapshot).await,
                    Effect::RecordCaseId(_) => {}
                }
            }
        }

        if dirty {
            self.persist().await;
        }
    }

    fn set_status(&self, next: SessionStatus) {
        if let Err(e) = self.handle.record.write().transition(next) {
            warn!(error = %e, "rejected transition");
        }
    }

    fn to_user(&self, record: &SessionRecord, content: MessageContent) {
        let queued = self.deps.dispatcher.to_user(BotMessage {
            conversation_key: record.key.clone(),
            user_id: record.user_id.clone(),
            provider: record.provider.clone(),
            bot_id: record.bot_id.clone(),
            content,
        });
        if !queued {
            warn!("bot channel queue closed, message dropped");
        }
    }

    fn to_agent(&self, record: &SessionRecord, text: String) {
        let queued = self.deps.dispatcher.to_agent(AgentMessage {
            conversation_key: record.key.clone(),
            credentials: record.credentials().clone(),
            text,
        });
        if !queued {
            warn!("agent chat queue closed, message dropped");
        }
    }

    /// Greeting line, then the stored transcript oldest first.
    async fn greet(&self, record: &SessionRecord) {
        let templates = &self.deps.templates;
        self.to_agent(
            record,
            render(
                &templates.greeting,
                &[("name", &record.display_name), ("provider", &record.provider)],
            ),
        );

        match self.deps.context.entries(&record.user_id).await {
            Ok(entries) => {
                for entry in entries {
                    let prefix = match entry.origin {
                        ContextOrigin::User => &templates.user_prefix,
                        ContextOrigin::Bot => &templates.bot_prefix,
                    };
                    self.to_agent(record, format!("{prefix}: {}", entry.content.as_plain_text()));
                }
            }
            Err(e) => warn!(error = %e, "could not load conversation context"),
        }
    }

    async fn persist(&self) {
        let snapshot = self.handle.snapshot();
        if let Err(e) = self.deps.store.put(&snapshot).await {
            warn!(error = %e, "failed to persist session snapshot");
        }
    }
}
