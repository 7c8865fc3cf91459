use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Field name that ties a log line to one bridged conversation.
const CONVERSATION_FIELD: &str = "conversation_key";

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS warn_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        recorded_at TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        fields TEXT,
        conversation_key TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_warn_log_conversation ON warn_log(conversation_key);
    CREATE INDEX IF NOT EXISTS idx_warn_log_recorded ON warn_log(recorded_at);
";

/// One persisted warning or error.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub recorded_at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_key: Option<String>,
}

/// Filters for reading persisted logs back. Unset filters match everything.
/// Deserializes from a query string (`?level=error&conversationKey=u1:s1`).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogQuery {
    pub level: Option<String>,
    /// Substring of the event target, e.g. `worker`.
    pub target: Option<String>,
    pub conversation_key: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl LogQuery {
    fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

/// SQLite store for WARN and ERROR events.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn record(&self, entry: &Captured, level: Level, target: &str, at: DateTime<Utc>) {
        let fields = (!entry.fields.is_empty())
            .then(|| Value::Object(entry.fields.clone()).to_string());
        let result = self.conn.lock().execute(
            "INSERT INTO warn_log (recorded_at, level, target, message, fields, conversation_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                at.to_rfc3339(),
                level.as_str(),
                target,
                entry.message.as_deref().unwrap_or_default(),
                fields,
                entry.conversation_key,
            ],
        );
        if let Err(e) = result {
            // Logging here would recurse into this layer.
            eprintln!("liaison-telemetry: dropped log record: {e}");
        }
    }

    /// Newest first, at most `limit` rows.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, recorded_at, level, target, message, fields, conversation_key
             FROM warn_log
             WHERE (?1 IS NULL OR level = ?1)
               AND (?2 IS NULL OR instr(target, ?2) > 0)
               AND (?3 IS NULL OR conversation_key = ?3)
               AND (?4 IS NULL OR recorded_at >= ?4)
             ORDER BY id DESC
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![
                q.level.as_deref().map(str::to_uppercase),
                q.target,
                q.conversation_key,
                q.since.map(|since| since.to_rfc3339()),
                q.effective_limit(),
            ],
            |row| {
                let fields: Option<String> = row.get(5)?;
                Ok(LogRecord {
                    id: row.get(0)?,
                    recorded_at: row.get(1)?,
                    level: row.get(2)?,
                    target: row.get(3)?,
                    message: row.get(4)?,
                    fields: fields.and_then(|raw| serde_json::from_str(&raw).ok()),
                    conversation_key: row.get(6)?,
                })
            },
        )?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM warn_log", [], |row| row.get(0))
    }

    /// Most recent record for one conversation, if any.
    pub fn last_for(&self, conversation_key: &str) -> Result<Option<LogRecord>, rusqlite::Error> {
        let q = LogQuery {
            conversation_key: Some(conversation_key.to_string()),
            limit: Some(1),
            ..LogQuery::default()
        };
        Ok(self.query(&q)?.into_iter().next())
    }
}

/// Fields collected from one event or span.
#[derive(Default)]
struct Captured {
    message: Option<String>,
    conversation_key: Option<String>,
    fields: Map<String, Value>,
}

impl Captured {
    fn put(&mut self, field: &Field, value: Value) {
        match (field.name(), value) {
            ("message", Value::String(text)) => self.message = Some(text),
            (CONVERSATION_FIELD, Value::String(key)) => self.conversation_key = Some(key),
            (name, value) => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for Captured {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        let rendered = match field.name() {
            // Debug-formatted strings carry their quotes.
            CONVERSATION_FIELD => rendered.trim_matches('"').to_string(),
            _ => rendered,
        };
        self.put(field, Value::String(rendered));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::Bool(value));
    }
}

/// Conversation key stored on a span so nested events can inherit it.
struct ConversationScope(String);

/// Layer that persists WARN and ERROR events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut captured = Captured::default();
        attrs.record(&mut captured);
        if let (Some(key), Some(span)) = (captured.conversation_key, ctx.span(id)) {
            span.extensions_mut().insert(ConversationScope(key));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > Level::WARN {
            return;
        }

        let mut captured = Captured::default();
        event.record(&mut captured);
        if captured.conversation_key.is_none() {
            captured.conversation_key = ctx.event_scope(event).and_then(|mut scope| {
                scope.find_map(|span| {
                    span.extensions()
                        .get::<ConversationScope>()
                        .map(|scope| scope.0.clone())
                })
            });
        }

        self.sink
            .record(&captured, *metadata.level(), metadata.target(), Utc::now());
    }
}
