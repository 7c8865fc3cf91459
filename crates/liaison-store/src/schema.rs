/// SQL DDL for the liaison database.
/// WAL mode enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    conversation_key TEXT PRIMARY KEY,
    client_scope TEXT NOT NULL,
    status TEXT NOT NULL,
    record TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS context_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    origin TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp_us INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_scope ON sessions(client_scope);
CREATE INDEX IF NOT EXISTS idx_context_user_ts ON context_entries(user_id, timestamp_us);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
