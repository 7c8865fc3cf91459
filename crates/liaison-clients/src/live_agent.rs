use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use liaison_core::ids::{CaseId, ChatSessionId};
use liaison_core::messages::ChatRequest;
use liaison_core::{
    AgentChatClient, AgentChatEvent, ChatCredentials, ChatError, OpenedChatSession, PollBatch,
};
use liaison_settings::LiveAgentSettings;

use crate::http;

const HEADER_API_VERSION: &str = "X-LIVEAGENT-API-VERSION";
const HEADER_AFFINITY: &str = "X-LIVEAGENT-AFFINITY";
const HEADER_SESSION_KEY: &str = "X-LIVEAGENT-SESSION-KEY";
const HEADER_SEQUENCE: &str = "X-LIVEAGENT-SEQUENCE";

/// REST client for the live-agent chat backend.
pub struct LiveAgentClient {
    client: reqwest::Client,
    settings: LiveAgentSettings,
    /// Per-session outbound sequence numbers, keyed by session key.
    sequences: DashMap<String, u64>,
}

impl LiveAgentClient {
    pub fn new(settings: LiveAgentSettings) -> Result<Self, ChatError> {
        Ok(Self {
            client: http::build_client(settings.request_timeout())?,
            settings,
            sequences: DashMap::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        http::join_url(&self.settings.base_url, path)
    }

    fn next_sequence(&self, session_key: &str) -> u64 {
        let mut seq = self.sequences.entry(session_key.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    fn authed(
        &self,
        req: reqwest::RequestBuilder,
        credentials: &ChatCredentials,
    ) -> reqwest::RequestBuilder {
        req.header(HEADER_API_VERSION, &self.settings.api_version)
            .header(HEADER_AFFINITY, &credentials.affinity_token)
            .header(HEADER_SESSION_KEY, &credentials.session_key)
    }

    fn sequenced(
        &self,
        req: reqwest::RequestBuilder,
        credentials: &ChatCredentials,
    ) -> reqwest::RequestBuilder {
        let seq = self.next_sequence(&credentials.session_key);
        self.authed(req, credentials).header(HEADER_SEQUENCE, seq.to_string())
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        limit: Duration,
    ) -> Result<reqwest::Response, ChatError> {
        req.send().await.map_err(|e| http::send_error(e, limit))
    }
}

#[async_trait]
impl AgentChatClient for LiveAgentClient {
    #[instrument(skip(self))]
    async fn create_session(&self) -> Result<OpenedChatSession, ChatError> {
        let req = self
            .client
            .get(self.url("System/SessionId"))
            .header(HEADER_API_VERSION, &self.settings.api_version)
            .header(HEADER_AFFINITY, "null");
        let resp = self.send(req, self.settings.request_timeout()).await?;
        let resp = http::check_status(resp).await?;
        let body: SessionIdResponse = http::decode_json(resp).await?;

        debug!(chat_session_id = %body.id, "agent chat session opened");
        Ok(OpenedChatSession {
            id: ChatSessionId::from_raw(body.id),
            credentials: ChatCredentials {
                affinity_token: body.affinity_token,
                session_key: body.key,
            },
        })
    }

    #[instrument(skip(self, credentials, request), fields(contact_id = %request.contact_id))]
    async fn create_chat(
        &self,
        credentials: &ChatCredentials,
        request: &ChatRequest,
    ) -> Result<(), ChatError> {
        let body = chasitor_init_body(&self.settings, credentials, request);
        let req = self.sequenced(self.client.post(self.url("Chasitor/ChasitorInit")), credentials);
        let resp = self.send(req.json(&body), self.settings.request_timeout()).await?;
        http::check_accepted(resp).await
    }

    async fn poll(&self, credentials: &ChatCredentials, ack: i64) -> Result<PollBatch, ChatError> {
        let timeout = self.settings.poll_timeout();
        let req = self
            .authed(self.client.get(self.url("System/Messages")), credentials)
            .query(&[("ack", ack)])
            .timeout(timeout);
        let resp = http::check_status(self.send(req, timeout).await?).await?;
        let body: MessagesResponse = http::decode_json(resp).await?;
        Ok(body.into_batch(ack))
    }

    async fn send_message(
        &self,
        credentials: &ChatCredentials,
        text: &str,
    ) -> Result<(), ChatError> {
        let req = self.sequenced(self.client.post(self.url("Chasitor/ChatMessage")), credentials);
        let resp = self
            .send(req.json(&json!({ "text": text })), self.settings.request_timeout())
            .await?;
        http::check_accepted(resp).await
    }

    #[instrument(skip(self, credentials))]
    async fn end_chat(&self, credentials: &ChatCredentials, reason: &str) -> Result<(), ChatError> {
        let req = self.sequenced(self.client.post(self.url("Chasitor/ChatEnd")), credentials);
        let resp = self
            .send(
                req.json(&json!({ "ChatEndReason": { "reason": reason } })),
                self.settings.request_timeout(),
            )
            .await?;
        let result = http::check_accepted(resp).await;
        self.sequences.remove(&credentials.session_key);
        result
    }

    #[instrument(skip(self, credentials))]
    async fn reconnect(
        &self,
        credentials: &ChatCredentials,
        offset: i64,
    ) -> Result<ChatCredentials, ChatError> {
        let req = self
            .authed(self.client.get(self.url("System/ReconnectSession")), credentials)
            .query(&[("ReconnectSession.offset", offset)]);
        let resp = self.send(req, self.settings.request_timeout()).await?;
        let resp = http::check_status(resp).await?;
        let body: MessagesResponse = http::decode_json(resp).await?;

        let reconnect = body
            .messages
            .iter()
            .find(|m| m.kind == "ReconnectSession")
            .ok_or_else(|| {
                ChatError::Decode("reconnect response without ReconnectSession".into())
            })?;
        let affinity = reconnect
            .message
            .get("affinityToken")
            .and_then(Value::as_str)
            .ok_or_else(|| ChatError::Decode("ReconnectSession without affinityToken".into()))?;
        if reconnect.message.get("resetSequence").and_then(Value::as_bool).unwrap_or(false) {
            self.sequences.remove(&credentials.session_key);
        }

        Ok(ChatCredentials {
            affinity_token: affinity.to_string(),
            session_key: credentials.session_key.clone(),
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIdResponse {
    id: String,
    key: String,
    affinity_token: String,
}

#[derive(Deserialize, Default)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default)]
    sequence: Option<i64>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Value,
}

impl MessagesResponse {
    fn into_batch(self, ack: i64) -> PollBatch {
        let offset = self.offset.or(self.sequence).unwrap_or(ack);
        PollBatch {
            events: self.messages.iter().map(to_event).collect(),
            offset,
        }
    }
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

fn to_event(m: &WireMessage) -> AgentChatEvent {
    let v = &m.message;
    match m.kind.as_str() {
        "ChatRequestSuccess" => AgentChatEvent::ChatRequestSuccess {
            queue_position: v.get("queuePosition").and_then(Value::as_u64).map(|n| n as u32),
            estimated_wait_secs: v.get("estimatedWaitTime").and_then(Value::as_u64),
            case_id: str_field(v, "caseId").map(CaseId::from_raw),
        },
        "QueueUpdate" => AgentChatEvent::QueueUpdate {
            position: v.get("position").and_then(Value::as_u64).map(|n| n as u32),
            estimated_wait_secs: v.get("estimatedWaitTime").and_then(Value::as_u64),
        },
        "ChatEstablished" => AgentChatEvent::ChatEstablished {
            agent_name: str_field(v, "name").unwrap_or_default(),
        },
        "ChatRequestFail" => AgentChatEvent::ChatRequestFail {
            reason: str_field(v, "reason"),
        },
        "ChatMessage" => AgentChatEvent::ChatMessage {
            agent_name: str_field(v, "name").unwrap_or_default(),
            text: str_field(v, "text").unwrap_or_default(),
        },
        "AgentTyping" => AgentChatEvent::AgentTyping,
        "AgentNotTyping" => AgentChatEvent::AgentNotTyping,
        "ChatEnded" => AgentChatEvent::ChatEnded {
            reason: str_field(v, "reason"),
        },
        other => AgentChatEvent::Unknown { kind: other.to_string() },
    }
}

/// Prechat detail shown to the agent, not copied into the transcript.
fn visible_detail(label: &str, value: &str) -> Value {
    json!({ "label": label, "value": value, "transcriptFields": [], "displayToAgent": true })
}

fn chasitor_init_body(
    settings: &LiveAgentSettings,
    credentials: &ChatCredentials,
    request: &ChatRequest,
) -> Value {
    let mut details = vec![
        json!({
            "label": "ContactId",
            "value": request.contact_id.as_str(),
            "transcriptFields": ["ContactId"],
            "displayToAgent": false,
        }),
        visible_detail("Email", &request.email),
        visible_detail("Phone", &request.phone),
        visible_detail("Provider", &request.provider),
    ];
    for (label, value) in &request.extra {
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        details.push(visible_detail(label, &value));
    }

    json!({
        "organizationId": settings.organization_id,
        "deploymentId": settings.deployment_id,
        "buttonId": settings.button_id,
        "sessionId": credentials.session_key,
        "userAgent": settings.user_agent,
        "language": settings.visitor_language,
        "screenResolution": settings.screen_resolution,
        "visitorName": request.visitor_name,
        "prechatDetails": details,
        "prechatEntities": [],
        "receiveQueueUpdates": true,
        "isPost": true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use liaison_core::ids::ContactId;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> ChatCredentials {
        ChatCredentials {
            affinity_token: "aff-1".into(),
            session_key: "key-1".into(),
        }
    }

    fn client(server: &MockServer) -> LiveAgentClient {
        LiveAgentClient::new(LiveAgentSettings {
            base_url: format!("{}/chat/rest", server.uri()),
            button_id: "573".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn create_session_reads_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/rest/System/SessionId"))
            .and(header(HEADER_API_VERSION, "58"))
            .and(header(HEADER_AFFINITY, "null"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chat-1", "key": "key-1", "affinityToken": "aff-1", "clientPollTimeout": 40
            })))
            .expect(1)
            .mount(&server)
            .await;

        let opened = client(&server).create_session().await.unwrap();
        assert_eq!(opened.id.as_str(), "chat-1");
        assert_eq!(opened.credentials, credentials());
    }

    #[tokio::test]
    async fn create_chat_sends_init_with_sequence() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/rest/Chasitor/ChasitorInit"))
            .and(header(HEADER_SESSION_KEY, "key-1"))
            .and(header(HEADER_SEQUENCE, "1"))
            .and(body_partial_json(json!({
                "buttonId": "573",
                "visitorName": "Ana",
                "sessionId": "key-1",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&server)
            .await;

        let request = ChatRequest {
            contact_id: ContactId::from_raw("003A"),
            visitor_name: "Ana".into(),
            email: "ana@example.com".into(),
            phone: "555".into(),
            provider: "whatsapp".into(),
            extra: serde_json::Map::new(),
        };
        client(&server).create_chat(&credentials(), &request).await.unwrap();
    }

    #[tokio::test]
    async fn sequence_increments_per_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/rest/Chasitor/ChatMessage"))
            .and(header(HEADER_SEQUENCE, "1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/rest/Chasitor/ChatMessage"))
            .and(header(HEADER_SEQUENCE, "2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        client.send_message(&credentials(), "hola").await.unwrap();
        client.send_message(&credentials(), "¿sigue ahí?").await.unwrap();
    }

    #[tokio::test]
    async fn poll_maps_messages_and_offset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/rest/System/Messages"))
            .and(query_param("ack", "3"))
            .and(header(HEADER_AFFINITY, "aff-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [
                    {
                        "type": "ChatRequestSuccess",
                        "message": { "queuePosition": 2, "estimatedWaitTime": 90, "caseId": "500A" }
                    },
                    { "type": "ChatEstablished", "message": { "name": "Luis" } },
                    { "type": "ChatMessage", "message": { "name": "Luis", "text": "Hola" } },
                    { "type": "ChatTransferred", "message": {} }
                ],
                "sequence": 4,
                "offset": 7
            })))
            .mount(&server)
            .await;

        let batch = client(&server).poll(&credentials(), 3).await.unwrap();
        assert_eq!(batch.offset, 7);
        assert_eq!(
            batch.events,
            vec![
                AgentChatEvent::ChatRequestSuccess {
                    queue_position: Some(2),
                    estimated_wait_secs: Some(90),
                    case_id: Some(CaseId::from_raw("500A")),
                },
                AgentChatEvent::ChatEstablished { agent_name: "Luis".into() },
                AgentChatEvent::ChatMessage { agent_name: "Luis".into(), text: "Hola".into() },
                AgentChatEvent::Unknown { kind: "ChatTransferred".into() },
            ]
        );
    }

    #[tokio::test]
    async fn poll_no_content_is_status_204() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/rest/System/Messages"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let err = client(&server).poll(&credentials(), 0).await.unwrap_err();
        assert_eq!(err.poll_outcome(), liaison_core::PollOutcome::NoContent);
    }

    #[tokio::test]
    async fn poll_forbidden_keeps_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/rest/System/Messages"))
            .respond_with(ResponseTemplate::new(403).set_body_string("session expired"))
            .mount(&server)
            .await;

        let err = client(&server).poll(&credentials(), 0).await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::Status { code: 403, ref body } if body == "session expired"
        ));
    }

    #[tokio::test]
    async fn poll_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/rest/System/Messages"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = LiveAgentClient::new(LiveAgentSettings {
            base_url: format!("{}/chat/rest", server.uri()),
            poll_timeout_ms: 100,
            ..Default::default()
        })
        .unwrap();
        let err = client.poll(&credentials(), 0).await.unwrap_err();
        assert!(matches!(err, ChatError::Timeout(_)));
    }

    #[tokio::test]
    async fn end_chat_posts_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/rest/Chasitor/ChatEnd"))
            .and(body_partial_json(json!({ "ChatEndReason": { "reason": "client" } })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).end_chat(&credentials(), "client").await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_refreshes_affinity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/rest/System/ReconnectSession"))
            .and(query_param("ReconnectSession.offset", "12"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [
                    {
                        "type": "ReconnectSession",
                        "message": { "resetSequence": true, "affinityToken": "aff-2" }
                    }
                ]
            })))
            .mount(&server)
            .await;

        let refreshed = client(&server).reconnect(&credentials(), 12).await.unwrap();
        assert_eq!(refreshed.affinity_token, "aff-2");
        assert_eq!(refreshed.session_key, "key-1");
    }

    #[tokio::test]
    async fn reconnect_without_token_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/rest/System/ReconnectSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "messages": [] })))
            .mount(&server)
            .await;

        let err = client(&server).reconnect(&credentials(), 0).await.unwrap_err();
        assert!(matches!(err, ChatError::Decode(_)));
    }

    #[test]
    fn batch_offset_falls_back_to_ack() {
        let batch = MessagesResponse::default().into_batch(5);
        assert_eq!(batch.offset, 5);
        assert!(batch.events.is_empty());
    }
}
