use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use liaison_engine::SessionManager;
use liaison_store::{ContextCache, DedupCache};
use liaison_telemetry::SqliteLogSink;

use crate::handlers;

/// Server configuration.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8090,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub dedup: Arc<DedupCache>,
    pub context: Arc<dyn ContextCache>,
    /// Persisted WARN+ logs; `None` when SQLite logging is off.
    pub logs: Option<Arc<SqliteLogSink>>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/sessions", post(handlers::create_session))
        .route(
            "/sessions/{key}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/sessions/{key}/messages", post(handlers::post_message))
        .route(
            "/context/{user_id}",
            get(handlers::get_context).post(handlers::append_context),
        )
        .route("/logs", get(handlers::get_logs))
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. The server drains and stops once `shutdown` is
/// cancelled.
pub async fn start(
    config: ServerConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state, config.request_timeout);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(host = %config.host, port = local_addr.port(), "liaison server started");

    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Wait for the server task to finish (after shutdown was requested).
    pub async fn join(self) {
        let _ = self.server.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liaison_clients::mock::{
        PollStep, RecordingBotChannel, ScriptedAgentChat, StaticContactResolver,
    };
    use liaison_core::AgentChatEvent;
    use liaison_engine::{Collaborators, ManagerConfig};
    use liaison_store::{Database, MemorySessionStore, SqliteContextCache};
    use serde_json::{json, Value};

    struct TestServer {
        base: String,
        manager: Arc<SessionManager>,
        chat: Arc<ScriptedAgentChat>,
        shutdown: CancellationToken,
    }

    async fn spawn(chat: ScriptedAgentChat) -> TestServer {
        spawn_with_logs(chat, None).await
    }

    async fn spawn_with_logs(
        chat: ScriptedAgentChat,
        logs: Option<Arc<SqliteLogSink>>,
    ) -> TestServer {
        let chat = Arc::new(chat);
        let context: Arc<dyn ContextCache> = Arc::new(SqliteContextCache::new(
            Database::in_memory().unwrap(),
            Duration::from_secs(3600),
        ));
        let manager = SessionManager::new(
            ManagerConfig {
                poll_interval: Duration::from_millis(10),
                ..ManagerConfig::default()
            },
            Collaborators {
                agent_chat: chat.clone(),
                bot_channel: Arc::new(RecordingBotChannel::new()),
                contacts: Arc::new(StaticContactResolver::new("003A")),
                store: Arc::new(MemorySessionStore::new()),
                context: context.clone(),
            },
        );
        let state = AppState {
            manager: manager.clone(),
            dedup: Arc::new(DedupCache::new(Duration::from_secs(5))),
            context,
            logs,
        };
        let shutdown = CancellationToken::new();
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        let handle = start(config, state, shutdown.clone()).await.unwrap();
        TestServer {
            base: format!("http://127.0.0.1:{}", handle.port),
            manager,
            chat,
            shutdown,
        }
    }

    fn start_body() -> Value {
        json!({
            "userId": "u1",
            "sessionId": "s1",
            "provider": "whatsapp",
            "botId": "bot",
            "name": "Ana"
        })
    }

    #[tokio::test]
    async fn health_reports_active_sessions() {
        let server = spawn(ScriptedAgentChat::default()).await;
        let resp = reqwest::get(format!("{}/health", server.base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["activeSessions"], 0);
        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn create_get_and_delete_session() {
        let server = spawn(ScriptedAgentChat::default()).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/sessions", server.base))
            .json(&start_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["key"], "u1:s1");
        assert_eq!(body["status"], "ON_HOLD");
        assert!(body.get("credentials").is_none());

        let again = client
            .post(format!("{}/sessions", server.base))
            .json(&start_body())
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), 409);

        let url = format!("{}/sessions/u1:s1", server.base);
        let got = client.get(&url).send().await.unwrap();
        assert_eq!(got.status(), 200);

        let deleted = client.delete(&url).send().await.unwrap();
        assert_eq!(deleted.status(), 204);
        let missing = client.get(&url).send().await.unwrap();
        assert_eq!(missing.status(), 404);
        let gone = client.delete(&url).send().await.unwrap();
        assert_eq!(gone.status(), 404);

        server.manager.shutdown().await;
        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn invalid_start_request_is_400() {
        let server = spawn(ScriptedAgentChat::default()).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/sessions", server.base))
            .json(&json!({ "userId": "u1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn messages_route_once_and_fill_context() {
        let server = spawn(ScriptedAgentChat::new(vec![PollStep::events(
            1,
            vec![AgentChatEvent::ChatEstablished { agent_name: "Luis".into() }],
        )]))
        .await;
        let client = reqwest::Client::new();
        client
            .post(format!("{}/sessions", server.base))
            .json(&start_body())
            .send()
            .await
            .unwrap();

        let key = liaison_core::ConversationKey::from_raw("u1:s1");
        for _ in 0..200 {
            if server.manager.status(&key) == Some(liaison_core::SessionStatus::Active) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let url = format!("{}/sessions/u1:s1/messages", server.base);
        let first = client
            .post(&url)
            .json(&json!({ "text": "my order is late", "messageId": "m1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), 202);
        let body: Value = first.json().await.unwrap();
        assert_eq!(body["delivered"], true);

        let repeat = client
            .post(&url)
            .json(&json!({ "text": "my order is late", "messageId": "m1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(repeat.status(), 200);
        let body: Value = repeat.json().await.unwrap();
        assert_eq!(body["duplicate"], true);

        let context: Value = client
            .get(format!("{}/context/u1", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(context.as_array().unwrap().len(), 1);
        assert_eq!(context[0]["content"]["text"], "my order is late");

        for _ in 0..200 {
            if server.chat.sent_texts().iter().any(|t| t == "my order is late") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let routed = server
            .chat
            .sent_texts()
            .into_iter()
            .filter(|t| t == "my order is late")
            .count();
        assert_eq!(routed, 1);

        server.manager.shutdown().await;
        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn message_for_unknown_session_is_not_delivered() {
        let server = spawn(ScriptedAgentChat::default()).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/sessions/u9:s9/messages", server.base))
            .json(&json!({ "text": "hello?" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["delivered"], false);
        assert!(body["status"].is_null());
        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn ids_with_separator_cannot_share_a_key() {
        let server = spawn(ScriptedAgentChat::default()).await;
        let client = reqwest::Client::new();

        let mut body = start_body();
        body["userId"] = json!("a:b");
        body["sessionId"] = json!("c");
        let resp = client
            .post(format!("{}/sessions", server.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("{}/sessions/a:b:c/messages", server.base))
            .json(&json!({ "text": "who am I?" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);

        for user in ["a", "a:b"] {
            let entries: Value = client
                .get(format!("{}/context/{user}", server.base))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(entries.as_array().unwrap().len(), 0, "context for {user}");
        }
        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn logs_route_filters_persisted_warnings() {
        use tracing_subscriber::layer::SubscriberExt;

        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry()
            .with(liaison_telemetry::SqliteLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(conversation_key = "u1:s1", "poll failed");
            tracing::error!(conversation_key = "u2:s2", "send failed");
        });

        let server = spawn_with_logs(ScriptedAgentChat::default(), Some(sink)).await;
        let client = reqwest::Client::new();

        let all: Value = client
            .get(format!("{}/logs", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);
        assert_eq!(all[0]["message"], "send failed");

        let one: Value = client
            .get(format!("{}/logs?conversationKey=u1:s1&level=warn", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(one.as_array().unwrap().len(), 1);
        assert_eq!(one[0]["conversationKey"], "u1:s1");
        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn logs_route_is_unavailable_without_a_sink() {
        let server = spawn(ScriptedAgentChat::default()).await;
        let resp = reqwest::get(format!("{}/logs", server.base)).await.unwrap();
        assert_eq!(resp.status(), 503);
        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn context_append_and_read_back() {
        let server = spawn(ScriptedAgentChat::default()).await;
        let client = reqwest::Client::new();
        let url = format!("{}/context/u1", server.base);

        let resp = client
            .post(&url)
            .json(&json!({ "origin": "bot", "text": "Hi, how can I help?" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);

        let empty = client.post(&url).json(&json!({ "origin": "user" })).send().await.unwrap();
        assert_eq!(empty.status(), 400);

        let entries: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(entries[0]["origin"], "bot");
        assert_eq!(entries[0]["content"]["kind"], "text");
        server.shutdown.cancel();
    }
}
