//! Session manager: registry of live sessions, creation, routing, teardown
//! and restart recovery.
//!
//! The registry is the single authority on which sessions are live in this
//! process. Registry entries are touched only in short synchronous sections;
//! no DashMap guard is ever held across an external call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use liaison_core::messages::{AgentMessage, ChatRequest};
use liaison_core::{
    AgentChatClient, BotChannelClient, ChatCredentials, ContactResolver, ConversationKey,
    SessionRecord, SessionStatus, StartChatRequest,
};
use liaison_settings::{LiaisonSettings, MessageTemplates};
use liaison_store::{ContextCache, SessionStore};

use crate::dispatch::{DispatchRouter, DispatchStats, Dispatcher};
use crate::error::RelayError;
use crate::worker::{PollingWorker, SessionHandle, WorkerDeps};

/// Reason sent to the agent-chat backend when we end a chat ourselves.
const END_REASON_CLIENT: &str = "client";

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub client_scope: String,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub dispatch_timeout: Duration,
    pub templates: MessageTemplates,
}

impl ManagerConfig {
    pub fn from_settings(settings: &LiaisonSettings) -> Self {
        Self {
            client_scope: settings.session.client_scope.clone(),
            poll_interval: settings.session.poll_interval(),
            stale_after: settings.session.stale_after(),
            dispatch_timeout: settings.session.dispatch_timeout(),
            templates: settings.messages.clone(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_settings(&LiaisonSettings::default())
    }
}

/// External systems the manager talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub agent_chat: Arc<dyn AgentChatClient>,
    pub bot_channel: Arc<dyn BotChannelClient>,
    pub contacts: Arc<dyn ContactResolver>,
    pub store: Arc<dyn SessionStore>,
    pub context: Arc<dyn ContextCache>,
}

/// What happened to an inbound user message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Queued for the agent chat.
    Enqueued,
    /// The session exists but is not `ACTIVE`; nothing was sent.
    NotActive(SessionStatus),
    /// No live session under that key.
    Unknown,
}

impl RouteOutcome {
    pub fn delivered(&self) -> bool {
        matches!(self, Self::Enqueued)
    }
}

/// Result of [`SessionManager::recover_sessions`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resumed: usize,
    pub removed: usize,
}

enum Slot {
    /// Creation in progress; holds the key against concurrent creates.
    Pending,
    Live(Arc<SessionHandle>),
}

type Registry = DashMap<ConversationKey, Slot>;

/// Releases a `Pending` reservation unless the creator committed it.
/// Also covers the create future being dropped mid-flight.
struct Reservation<'a> {
    registry: &'a Registry,
    key: ConversationKey,
    committed: bool,
}

impl<'a> Reservation<'a> {
    fn acquire(registry: &'a Registry, key: ConversationKey) -> Result<Self, RelayError> {
        match registry.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let replaceable = match occupied.get() {
                    Slot::Pending => false,
                    Slot::Live(handle) => handle.status().is_terminal(),
                };
                if !replaceable {
                    return Err(RelayError::ConflictActiveSession(key));
                }
                occupied.insert(Slot::Pending);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Pending);
            }
        }
        Ok(Self {
            registry,
            key,
            committed: false,
        })
    }

    fn commit(mut self, handle: Arc<SessionHandle>) {
        self.registry.insert(self.key.clone(), Slot::Live(handle));
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.remove_if(&self.key, |_, slot| matches!(slot, Slot::Pending));
        }
    }
}

/// State shared with the lifecycle reaper task.
struct Shared {
    registry: Registry,
    store: Arc<dyn SessionStore>,
}

impl Shared {
    fn live(&self, key: &ConversationKey) -> Option<Arc<SessionHandle>> {
        let slot = self.registry.get(key)?;
        match slot.value() {
            Slot::Live(handle) => Some(handle.clone()),
            Slot::Pending => None,
        }
    }

    /// Remove `key` from the registry and the durable store. Idempotent.
    async fn finish(&self, key: &ConversationKey) {
        if let Some((_, Slot::Live(handle))) =
            self.registry.remove_if(key, |_, slot| matches!(slot, Slot::Live(_)))
        {
            handle.cancel();
        }
        if let Err(e) = self.store.delete(key).await {
            warn!(conversation_key = %key, error = %e, "failed to delete session snapshot");
        }
    }

    /// Reaper path: only tear down if the registered session is the one that
    /// finished. A newer session under the same key is left alone.
    async fn reap(&self, key: &ConversationKey) {
        let removed = self.registry.remove_if(key, |_, slot| match slot {
            Slot::Live(handle) => handle.status().is_terminal(),
            Slot::Pending => false,
        });
        let still_registered = self.registry.contains_key(key);
        if removed.is_some() || !still_registered {
            if let Err(e) = self.store.delete(key).await {
                warn!(conversation_key = %key, error = %e, "failed to delete session snapshot");
            }
            info!(conversation_key = %key, "session reaped");
        } else {
            debug!(conversation_key = %key, "finish signal for replaced session ignored");
        }
    }
}

/// Creates, tracks, drives and tears down bridged conversations.
///
/// Several managers can coexist (tests do this); nothing here is global.
pub struct SessionManager {
    config: ManagerConfig,
    collaborators: Collaborators,
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    worker_deps: WorkerDeps,
    root: CancellationToken,
    shutting_down: AtomicBool,
    workers: TaskTracker,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    router: parking_lot::Mutex<Option<DispatchRouter>>,
}

impl SessionManager {
    /// Build the manager and start its dispatch consumers and reaper.
    /// Must be called inside a tokio runtime.
    pub fn new(config: ManagerConfig, collaborators: Collaborators) -> Arc<Self> {
        let root = CancellationToken::new();
        let (dispatcher, router) = DispatchRouter::start(
            collaborators.bot_channel.clone(),
            collaborators.agent_chat.clone(),
            config.dispatch_timeout,
            root.child_token(),
        );
        let (finish_tx, finish_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            registry: DashMap::new(),
            store: collaborators.store.clone(),
        });

        let worker_deps = WorkerDeps {
            agent_chat: collaborators.agent_chat.clone(),
            store: collaborators.store.clone(),
            context: collaborators.context.clone(),
            dispatcher: dispatcher.clone(),
            templates: Arc::new(config.templates.clone()),
            poll_interval: config.poll_interval,
            finish_tx,
        };

        let reaper = start_reaper(shared.clone(), finish_rx, root.child_token());

        Arc::new(Self {
            config,
            collaborators,
            shared,
            dispatcher,
            worker_deps,
            root,
            shutting_down: AtomicBool::new(false),
            workers: TaskTracker::new(),
            background: parking_lot::Mutex::new(vec![reaper]),
            router: parking_lot::Mutex::new(Some(router)),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Open a new bridged conversation.
    ///
    /// On failure nothing is registered or persisted; an agent-chat session
    /// opened along the way is ended best-effort. A shutdown that starts while
    /// the external calls are in flight also counts as a failure.
    #[instrument(skip(self, request), fields(conversation_key = %request.conversation_key()))]
    pub async fn create_session(
        &self,
        request: StartChatRequest,
    ) -> Result<SessionRecord, RelayError> {
        if self.is_shutting_down() {
            return Err(RelayError::ShuttingDown);
        }
        request.validate()?;

        let key = request.conversation_key();
        let reservation = Reservation::acquire(&self.shared.registry, key.clone())?;

        let contact_id = self
            .collaborators
            .contacts
            .get_or_create_contact(request.display_name(), &request.email, &request.phone)
            .await
            .map_err(RelayError::ContactResolution)?;

        let opened = self
            .collaborators
            .agent_chat
            .create_session()
            .await
            .map_err(RelayError::ChatCreation)?;

        let chat_request = ChatRequest {
            contact_id: contact_id.clone(),
            visitor_name: request.display_name().to_string(),
            email: request.email.clone(),
            phone: request.phone.clone(),
            provider: request.provider.clone(),
            extra: request.extra.clone(),
        };
        if let Err(e) = self
            .collaborators
            .agent_chat
            .create_chat(&opened.credentials, &chat_request)
            .await
        {
            self.abandon_chat(&opened.credentials).await;
            return Err(RelayError::ChatCreation(e));
        }

        if self.is_shutting_down() {
            self.abandon_chat(&opened.credentials).await;
            return Err(RelayError::ShuttingDown);
        }

        let record = SessionRecord::on_hold(
            &request,
            &self.config.client_scope,
            contact_id,
            opened.id,
            opened.credentials,
        );
        if let Err(e) = self.collaborators.store.put(&record).await {
            self.abandon_chat(record.credentials()).await;
            return Err(e.into());
        }

        let handle = Arc::new(SessionHandle::new(record.clone(), self.root.child_token()));
        reservation.commit(handle.clone());
        self.spawn_worker(handle.clone());

        // Shutdown may have begun during the snapshot write. Either it sees
        // this commit and clears it, or we see its flag here and undo.
        if self.is_shutting_down() {
            self.shared.registry.remove_if(&key, |_, slot| {
                matches!(slot, Slot::Live(live) if Arc::ptr_eq(live, &handle))
            });
            handle.cancel();
            self.delete_snapshot(&key).await;
            self.abandon_chat(record.credentials()).await;
            return Err(RelayError::ShuttingDown);
        }

        info!(chat_session_id = %record.chat_session_id, "session created");
        Ok(record)
    }

    /// Forward a user message to the agent when the session is `ACTIVE`.
    /// Any other state is a no-op; the record is never touched.
    pub fn route_inbound_message(&self, key: &ConversationKey, text: &str) -> RouteOutcome {
        let Some(handle) = self.shared.live(key) else {
            debug!(conversation_key = %key, "inbound message for unknown session");
            return RouteOutcome::Unknown;
        };
        let record = handle.snapshot();
        if record.status() != SessionStatus::Active {
            info!(
                conversation_key = %key,
                status = %record.status(),
                "session not active, message not routed"
            );
            return RouteOutcome::NotActive(record.status());
        }
        let queued = self.dispatcher.to_agent(AgentMessage {
            conversation_key: key.clone(),
            credentials: record.credentials().clone(),
            text: text.to_string(),
        });
        if queued {
            RouteOutcome::Enqueued
        } else {
            warn!(conversation_key = %key, "agent chat queue closed");
            RouteOutcome::NotActive(record.status())
        }
    }

    /// User-initiated end: tell the backend, close, stop the worker, finish.
    #[instrument(skip(self, key), fields(conversation_key = %key))]
    pub async fn end_session(&self, key: &ConversationKey) -> Result<SessionRecord, RelayError> {
        let handle = self
            .shared
            .live(key)
            .ok_or_else(|| RelayError::NotFound(key.clone()))?;

        let credentials = handle.snapshot().credentials().clone();
        if let Err(e) = self
            .collaborators
            .agent_chat
            .end_chat(&credentials, END_REASON_CLIENT)
            .await
        {
            warn!(error = %e, "end chat failed upstream, closing locally");
        }
        if !handle.close() {
            debug!(status = %handle.status(), "session already terminal");
        }
        handle.cancel();
        self.finish(key).await;
        Ok(handle.snapshot())
    }

    /// Remove `key` from the registry and the durable store. Idempotent.
    pub async fn finish(&self, key: &ConversationKey) {
        self.shared.finish(key).await;
    }

    /// Stop accepting sessions and stop every worker.
    ///
    /// Workers exit without signalling finish, so their last snapshot stays
    /// in the durable store for [`SessionManager::recover_sessions`].
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(live = self.shared.registry.len(), "session manager shutting down");
        self.root.cancel();
        self.workers.close();
        self.workers.wait().await;

        let router = self.router.lock().take();
        if let Some(router) = router {
            router.join().await;
        }
        let background: Vec<_> = self.background.lock().drain(..).collect();
        for task in background {
            task.abort();
        }
        self.shared.registry.clear();
        info!("session manager stopped");
    }

    pub fn status(&self, key: &ConversationKey) -> Option<SessionStatus> {
        self.shared.live(key).map(|h| h.status())
    }

    pub fn snapshot(&self, key: &ConversationKey) -> Option<SessionRecord> {
        self.shared.live(key).map(|h| h.snapshot())
    }

    pub fn is_registered(&self, key: &ConversationKey) -> bool {
        self.shared.registry.contains_key(key)
    }

    /// Live sessions that are `ON_HOLD` or `ACTIVE`.
    pub fn active_count(&self) -> usize {
        self.shared
            .registry
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Live(h) if !h.status().is_terminal()))
            .count()
    }

    pub fn dispatch_stats(&self) -> &DispatchStats {
        self.dispatcher.stats()
    }

    /// Resume persisted sessions after a restart.
    ///
    /// Terminal or stale snapshots are deleted. The rest are reconnected
    /// (credentials refreshed, offset kept), registered and polled again; a
    /// failed reconnect deletes the snapshot.
    #[instrument(skip(self), fields(client_scope = %self.config.client_scope))]
    pub async fn recover_sessions(&self) -> Result<RecoveryReport, RelayError> {
        if self.is_shutting_down() {
            return Err(RelayError::ShuttingDown);
        }
        let records = self.collaborators.store.list_all(&self.config.client_scope).await?;
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        for mut record in records {
            let key = record.key.clone();
            if self.shared.registry.contains_key(&key) {
                continue;
            }
            if record.status().is_terminal() || record.is_stale(now, self.config.stale_after) {
                self.delete_snapshot(&key).await;
                report.removed += 1;
                continue;
            }

            let reservation = match Reservation::acquire(&self.shared.registry, key.clone()) {
                Ok(r) => r,
                Err(_) => continue,
            };

            match self
                .collaborators
                .agent_chat
                .reconnect(record.credentials(), record.offset())
                .await
            {
                Ok(credentials) => {
                    record.reconnect(credentials);
                    if let Err(e) = self.collaborators.store.put(&record).await {
                        warn!(
                            conversation_key = %key,
                            error = %e,
                            "failed to persist recovered session"
                        );
                    }
                    let handle = Arc::new(SessionHandle::new(record, self.root.child_token()));
                    reservation.commit(handle.clone());
                    self.spawn_worker(handle);
                    report.resumed += 1;
                }
                Err(e) => {
                    warn!(
                        conversation_key = %key,
                        error = %e,
                        "reconnect failed, dropping session"
                    );
                    drop(reservation);
                    self.delete_snapshot(&key).await;
                    report.removed += 1;
                }
            }
        }

        info!(resumed = report.resumed, removed = report.removed, "recovery complete");
        Ok(report)
    }

    /// Delete persisted snapshots that are stale or terminal and not live here.
    #[instrument(skip(self))]
    pub async fn clean_stale_sessions(&self) -> Result<usize, RelayError> {
        let records = self.collaborators.store.list_all(&self.config.client_scope).await?;
        let now = Utc::now();
        let mut removed = 0;
        for record in records {
            if self.shared.registry.contains_key(&record.key) {
                continue;
            }
            if record.status().is_terminal() || record.is_stale(now, self.config.stale_after) {
                self.delete_snapshot(&record.key).await;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "stale sessions cleaned");
        }
        Ok(removed)
    }

    /// Periodically clean stale snapshots and expired context.
    pub fn start_maintenance(self: &Arc<Self>, interval: Duration) {
        let manager = Arc::clone(self);
        let cancel = self.root.child_token();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = manager.clean_stale_sessions().await {
                    warn!(error = %e, "stale session cleanup failed");
                }
                if let Err(e) = manager.collaborators.context.purge_expired().await {
                    warn!(error = %e, "context purge failed");
                }
            }
        });
        self.background.lock().push(task);
    }

    fn spawn_worker(&self, handle: Arc<SessionHandle>) {
        let worker = PollingWorker::new(handle, self.worker_deps.clone());
        self.workers.spawn(worker.instrumented());
    }

    async fn abandon_chat(&self, credentials: &ChatCredentials) {
        if let Err(e) = self
            .collaborators
            .agent_chat
            .end_chat(credentials, END_REASON_CLIENT)
            .await
        {
            warn!(error = %e, "failed to end abandoned agent chat");
        }
    }

    async fn delete_snapshot(&self, key: &ConversationKey) {
        if let Err(e) = self.collaborators.store.delete(key).await {
            warn!(conversation_key = %key, error = %e, "failed to delete session snapshot");
        }
    }
}

/// Lifecycle reaper: drains finish signals and tears sessions down.
fn start_reaper(
    shared: Arc<Shared>,
    mut finish_rx: mpsc::UnboundedReceiver<ConversationKey>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let key = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                key = finish_rx.recv() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            shared.reap(&key).await;
        }
        debug!("reaper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use liaison_clients::mock::{
        PollStep, RecordingBotChannel, ScriptedAgentChat, StaticContactResolver,
    };
    use liaison_core::ids::{ChatSessionId, ContactId};
    use liaison_core::{AgentChatEvent, ChatError, RequestError};
    use liaison_store::{Database, MemorySessionStore, SqliteContextCache};

    struct Fixture {
        manager: Arc<SessionManager>,
        chat: Arc<ScriptedAgentChat>,
        bot: Arc<RecordingBotChannel>,
        contacts: Arc<StaticContactResolver>,
        store: Arc<MemorySessionStore>,
    }

    fn fixture_with(
        chat: ScriptedAgentChat,
        contacts: StaticContactResolver,
        store: MemorySessionStore,
    ) -> Fixture {
        let chat = Arc::new(chat);
        let bot = Arc::new(RecordingBotChannel::new());
        let contacts = Arc::new(contacts);
        let store = Arc::new(store);
        let context = Arc::new(SqliteContextCache::new(
            Database::in_memory().unwrap(),
            Duration::from_secs(86_400),
        ));
        let config = ManagerConfig {
            poll_interval: Duration::from_millis(10),
            dispatch_timeout: Duration::from_secs(1),
            ..ManagerConfig::default()
        };
        let manager = SessionManager::new(
            config,
            Collaborators {
                agent_chat: chat.clone(),
                bot_channel: bot.clone(),
                contacts: contacts.clone(),
                store: store.clone(),
                context,
            },
        );
        Fixture {
            manager,
            chat,
            bot,
            contacts,
            store,
        }
    }

    fn fixture(chat: ScriptedAgentChat) -> Fixture {
        fixture_with(chat, StaticContactResolver::new("003A"), MemorySessionStore::new())
    }

    fn request(user: &str, session: &str) -> StartChatRequest {
        StartChatRequest {
            user_id: user.into(),
            session_id: session.into(),
            provider: "whatsapp".into(),
            bot_id: "bot".into(),
            name: "Ana".into(),
            ..Default::default()
        }
    }

    fn key(user: &str, session: &str) -> ConversationKey {
        ConversationKey::from_raw(format!("{user}:{session}"))
    }

    fn persisted(user: &str, session: &str, n: usize) -> SessionRecord {
        SessionRecord::on_hold(
            &request(user, session),
            "default",
            ContactId::from_raw("003A"),
            ChatSessionId::from_raw(format!("chat-{n}")),
            ChatCredentials {
                affinity_token: format!("aff-{n}"),
                session_key: format!("key-{n}"),
            },
        )
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn accepted_then_established_reaches_active() {
        let f = fixture(ScriptedAgentChat::new(vec![
            PollStep::events(
                1,
                vec![AgentChatEvent::ChatRequestSuccess {
                    queue_position: Some(2),
                    estimated_wait_secs: None,
                    case_id: None,
                }],
            ),
            PollStep::events(
                2,
                vec![AgentChatEvent::ChatEstablished {
                    agent_name: "Luis".into(),
                }],
            ),
        ]));

        let record = f.manager.create_session(request("u1", "s1")).await.unwrap();
        assert_eq!(record.status(), SessionStatus::OnHold);
        assert_eq!(record.key.as_str(), "u1:s1");
        assert!(f.store.contains(&record.key));
        assert_eq!(f.chat.chat_requests()[0].visitor_name, "Ana");

        let manager = f.manager.clone();
        let k = key("u1", "s1");
        eventually(|| manager.status(&k) == Some(SessionStatus::Active)).await;

        let chat = f.chat.clone();
        eventually(|| !chat.sent_texts().is_empty()).await;
        assert_eq!(
            f.chat.sent_texts()[0],
            "Ana started a chat from whatsapp. Conversation so far:"
        );

        assert_eq!(f.manager.route_inbound_message(&k, "hello agent"), RouteOutcome::Enqueued);
        let chat = f.chat.clone();
        eventually(|| chat.sent_texts().last().map(String::as_str) == Some("hello agent")).await;

        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn forbidden_first_poll_closes_and_unregisters() {
        let f = fixture(ScriptedAgentChat::new(vec![PollStep::status(403)]));
        f.manager.create_session(request("u1", "s1")).await.unwrap();

        let manager = f.manager.clone();
        let k = key("u1", "s1");
        eventually(|| !manager.is_registered(&k)).await;
        let store = f.store.clone();
        eventually(|| !store.contains(&k)).await;
        assert_eq!(f.manager.active_count(), 0);
    }

    #[tokio::test]
    async fn chat_end_after_empty_polls_notifies_once() {
        let f = fixture(ScriptedAgentChat::new(vec![
            PollStep::no_content(),
            PollStep::no_content(),
            PollStep::no_content(),
            PollStep::events(1, vec![AgentChatEvent::ChatEnded { reason: None }]),
        ]));
        f.manager.create_session(request("u1", "s1")).await.unwrap();

        let manager = f.manager.clone();
        let k = key("u1", "s1");
        eventually(|| !manager.is_registered(&k)).await;
        let bot = f.bot.clone();
        eventually(|| !bot.texts().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.bot.texts(), vec!["The agent has ended the chat."]);
        assert_eq!(f.chat.poll_count(), 4);
    }

    #[tokio::test]
    async fn messages_before_active_are_not_routed() {
        let f = fixture(ScriptedAgentChat::default());
        f.manager.create_session(request("u1", "s1")).await.unwrap();

        let k = key("u1", "s1");
        assert_eq!(
            f.manager.route_inbound_message(&k, "anyone?"),
            RouteOutcome::NotActive(SessionStatus::OnHold)
        );
        assert_eq!(f.manager.route_inbound_message(&key("u9", "s9"), "hi"), RouteOutcome::Unknown);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.chat.sent_texts().is_empty());
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn second_create_for_live_key_conflicts() {
        let f = fixture(ScriptedAgentChat::default());
        f.manager.create_session(request("u1", "s1")).await.unwrap();

        let err = f.manager.create_session(request("u1", "s1")).await.unwrap_err();
        assert!(matches!(err, RelayError::ConflictActiveSession(_)));
        assert_eq!(f.chat.sessions_created(), 1);

        f.manager.create_session(request("u1", "s2")).await.unwrap();
        assert_eq!(f.manager.active_count(), 2);
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_creates_admit_exactly_one() {
        let f = fixture(ScriptedAgentChat::default().with_create_delay(Duration::from_millis(20)));
        let (a, b) = tokio::join!(
            f.manager.create_session(request("u1", "s1")),
            f.manager.create_session(request("u1", "s1")),
        );
        let ok = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(ok, 1);
        assert_eq!(f.chat.sessions_created(), 1);
        assert_eq!(f.store.len(), 1);
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn failed_chat_creation_leaves_nothing_behind() {
        let chat =
            ScriptedAgentChat::default().failing_create_chat(ChatError::from_status(500, "boom"));
        let f = fixture(chat);
        let err = f.manager.create_session(request("u1", "s1")).await.unwrap_err();

        assert!(matches!(err, RelayError::ChatCreation(_)));
        assert!(!f.manager.is_registered(&key("u1", "s1")));
        assert!(f.store.is_empty());
        assert_eq!(f.chat.ended(), vec![("key-1".to_string(), "client".to_string())]);

        // The reservation was released, so a retry is not a conflict.
        let err = f.manager.create_session(request("u1", "s1")).await.unwrap_err();
        assert!(matches!(err, RelayError::ChatCreation(_)));
    }

    #[tokio::test]
    async fn contact_failure_opens_no_chat() {
        let f = fixture_with(
            ScriptedAgentChat::default(),
            StaticContactResolver::failing(ChatError::Network("crm down".into())),
            MemorySessionStore::new(),
        );
        let err = f.manager.create_session(request("u1", "s1")).await.unwrap_err();
        assert!(matches!(err, RelayError::ContactResolution(_)));
        assert_eq!(f.contacts.calls(), 1);
        assert_eq!(f.chat.sessions_created(), 0);
    }

    #[tokio::test]
    async fn invalid_request_is_rejected() {
        let f = fixture(ScriptedAgentChat::default());
        let err = f.manager.create_session(request("", "s1")).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::InvalidRequest(RequestError::Missing("userId"))
        ));
        assert_eq!(f.contacts.calls(), 0);
    }

    #[tokio::test]
    async fn ids_containing_the_key_separator_are_rejected() {
        let f = fixture(ScriptedAgentChat::default());

        let err = f.manager.create_session(request("a:b", "c")).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::InvalidRequest(RequestError::Separator("userId"))
        ));
        let err = f.manager.create_session(request("a", "b:c")).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::InvalidRequest(RequestError::Separator("sessionId"))
        ));
        assert_eq!(f.contacts.calls(), 0);
        assert!(!f.manager.is_registered(&key("a:b", "c")));
    }

    #[tokio::test]
    async fn shutdown_during_create_abandons_the_chat() {
        let f = fixture(ScriptedAgentChat::default().with_create_delay(Duration::from_millis(50)));
        let manager = f.manager.clone();
        let pending =
            tokio::spawn(async move { manager.create_session(request("u1", "s1")).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        f.manager.shutdown().await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::ShuttingDown));
        assert!(!f.manager.is_registered(&key("u1", "s1")));
        assert_eq!(f.manager.status(&key("u1", "s1")), None);
        assert_eq!(f.manager.active_count(), 0);
        assert!(f.store.is_empty());
        assert_eq!(f.chat.ended(), vec![("key-1".to_string(), "client".to_string())]);
    }

    #[tokio::test]
    async fn end_session_closes_and_finishes() {
        let f = fixture(ScriptedAgentChat::default());
        f.manager.create_session(request("u1", "s1")).await.unwrap();
        let k = key("u1", "s1");

        let record = f.manager.end_session(&k).await.unwrap();
        assert_eq!(record.status(), SessionStatus::Closed);
        assert!(!f.manager.is_registered(&k));
        assert!(!f.store.contains(&k));
        assert_eq!(f.chat.ended(), vec![("key-1".to_string(), "client".to_string())]);

        let err = f.manager.end_session(&k).await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let f = fixture(ScriptedAgentChat::default());
        f.manager.create_session(request("u1", "s1")).await.unwrap();
        let k = key("u1", "s1");

        f.manager.finish(&k).await;
        f.manager.finish(&k).await;
        assert!(!f.manager.is_registered(&k));
        assert!(f.store.is_empty());

        // The key is free again.
        f.manager.create_session(request("u1", "s1")).await.unwrap();
        assert!(f.manager.is_registered(&k));
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_keeps_snapshots_and_refuses_new_sessions() {
        let f = fixture(ScriptedAgentChat::default());
        f.manager.create_session(request("u1", "s1")).await.unwrap();

        f.manager.shutdown().await;
        assert_eq!(f.manager.active_count(), 0);
        assert!(f.store.contains(&key("u1", "s1")));

        let err = f.manager.create_session(request("u2", "s2")).await.unwrap_err();
        assert!(matches!(err, RelayError::ShuttingDown));
    }

    #[tokio::test]
    async fn recovery_resumes_live_and_drops_dead_snapshots() {
        let store = MemorySessionStore::new();
        let live = persisted("u1", "s1", 1);
        let mut closed = persisted("u2", "s2", 2);
        closed.transition(SessionStatus::Closed).unwrap();
        let mut stale = persisted("u3", "s3", 3);
        stale.created_at = Utc::now() - chrono::Duration::days(3);
        for record in [&live, &closed, &stale] {
            store.put(record).await.unwrap();
        }

        let f = fixture_with(
            ScriptedAgentChat::default(),
            StaticContactResolver::new("003A"),
            store,
        );
        let report = f.manager.recover_sessions().await.unwrap();

        assert_eq!(report, RecoveryReport { resumed: 1, removed: 2 });
        assert_eq!(f.chat.reconnects(), vec![("key-1".to_string(), 0)]);
        let snapshot = f.manager.snapshot(&key("u1", "s1")).unwrap();
        assert_eq!(snapshot.credentials().affinity_token, "aff-1-re");
        assert_eq!(f.store.len(), 1);
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn failed_reconnect_deletes_snapshot() {
        let store = MemorySessionStore::new();
        store.put(&persisted("u1", "s1", 1)).await.unwrap();

        let f = fixture_with(
            ScriptedAgentChat::default().failing_reconnect(ChatError::from_status(403, "")),
            StaticContactResolver::new("003A"),
            store,
        );
        let report = f.manager.recover_sessions().await.unwrap();
        assert_eq!(report, RecoveryReport { resumed: 0, removed: 1 });
        assert!(f.store.is_empty());
        assert!(!f.manager.is_registered(&key("u1", "s1")));
    }

    #[tokio::test]
    async fn stale_cleanup_skips_live_sessions() {
        let store = MemorySessionStore::new();
        let mut stale = persisted("u3", "s3", 3);
        stale.created_at = Utc::now() - chrono::Duration::days(3);
        store.put(&stale).await.unwrap();

        let f = fixture_with(
            ScriptedAgentChat::default(),
            StaticContactResolver::new("003A"),
            store,
        );
        f.manager.create_session(request("u1", "s1")).await.unwrap();

        assert_eq!(f.manager.clean_stale_sessions().await.unwrap(), 1);
        assert_eq!(f.store.len(), 1);
        assert!(f.store.contains(&key("u1", "s1")));
        f.manager.shutdown().await;
    }
}
