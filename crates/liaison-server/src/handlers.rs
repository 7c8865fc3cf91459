//! HTTP handlers over the session manager and the context cache.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use liaison_core::ids::{CaseId, ChatSessionId, ContactId, UserId};
use liaison_core::messages::{ContextEntry, ContextOrigin, MessageContent};
use liaison_core::{ConversationKey, SessionRecord, SessionStatus, StartChatRequest};
use liaison_store::ContextCache;
use liaison_telemetry::{LogQuery, LogRecord};

use crate::error::ApiError;
use crate::server::AppState;

/// Public view of a session. Chat credentials never leave the process.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub key: ConversationKey,
    pub user_id: UserId,
    pub status: SessionStatus,
    pub provider: String,
    pub bot_id: String,
    pub contact_id: ContactId,
    pub chat_session_id: ChatSessionId,
    pub case_id: Option<CaseId>,
    pub offset: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&SessionRecord> for SessionView {
    fn from(record: &SessionRecord) -> Self {
        Self {
            key: record.key.clone(),
            user_id: record.user_id.clone(),
            status: record.status(),
            provider: record.provider.clone(),
            bot_id: record.bot_id.clone(),
            contact_id: record.contact_id.clone(),
            chat_session_id: record.chat_session_id.clone(),
            case_id: record.case_id.clone(),
            offset: record.offset(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub text: String,
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContextAppend {
    pub origin: ContextOrigin,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default)]
    pub text: Option<String>,
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "activeSessions": state.manager.active_count(),
    }))
}

#[instrument(skip_all, fields(user_id = %request.user_id, session_id = %request.session_id))]
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<StartChatRequest>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    let record = state.manager.create_session(request).await?;
    Ok((StatusCode::CREATED, Json(SessionView::from(&record))))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let key = ConversationKey::from_raw(key);
    let record = state
        .manager
        .snapshot(&key)
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {key}")))?;
    Ok(Json(SessionView::from(&record)))
}

/// Inbound user message. Redelivered webhooks (same `messageId` inside the
/// dedup window) are acknowledged without being routed again.
#[instrument(skip_all, fields(conversation_key = %key))]
pub async fn post_message(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(message): Json<InboundMessage>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if message.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text must not be empty".into()));
    }
    let key = ConversationKey::from_raw(key);

    if let Some(message_id) = message.message_id.as_deref().filter(|id| !id.is_empty()) {
        if state.dedup.is_repeated(&format!("{key}:{message_id}")) {
            debug!(message_id, "duplicate message dropped");
            return Ok((StatusCode::OK, Json(json!({ "duplicate": true }))));
        }
    }

    let user_id = match state.manager.snapshot(&key) {
        Some(record) => Some(record.user_id),
        None => key.user_part().map(UserId::from_raw),
    };
    match user_id {
        Some(user_id) => {
            let entry = ContextEntry::now(ContextOrigin::User, MessageContent::text(&message.text));
            if let Err(e) = state.context.append(&user_id, entry).await {
                warn!(error = %e, "failed to append user message to context");
            }
        }
        None => debug!("no user for key, message not added to context"),
    }

    let outcome = state.manager.route_inbound_message(&key, &message.text);
    let status = state.manager.status(&key);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "delivered": outcome.delivered(), "status": status })),
    ))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key = ConversationKey::from_raw(key);
    state.manager.end_session(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn append_context(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<ContextAppend>,
) -> Result<StatusCode, ApiError> {
    let content = match (body.content, body.text) {
        (Some(content), _) => content,
        (None, Some(text)) if !text.trim().is_empty() => MessageContent::text(text),
        _ => return Err(ApiError::BadRequest("content or text is required".into())),
    };
    let user_id = UserId::from_raw(user_id);
    if user_id.is_empty() {
        return Err(ApiError::BadRequest("user id must not be empty".into()));
    }
    state
        .context
        .append(&user_id, ContextEntry::now(body.origin, content))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_context(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<ContextEntry>>, ApiError> {
    let entries = state.context.entries(&UserId::from_raw(user_id)).await?;
    Ok(Json(entries))
}

/// Persisted warnings and errors, newest first.
pub async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    let sink = state
        .logs
        .ok_or_else(|| ApiError::Unavailable("log persistence is disabled".into()))?;
    let records = sink
        .query(&query)
        .map_err(|e| ApiError::Internal(format!("log query failed: {e}")))?;
    Ok(Json(records))
}
