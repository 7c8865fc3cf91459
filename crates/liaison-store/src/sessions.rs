use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::instrument;

use liaison_core::{ConversationKey, SessionRecord};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Durable mirror of session records, keyed by conversation key.
///
/// The in-process registry is the source of truth while a process holds a
/// session; this store only keeps the last snapshot so a restart can find it.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, record: &SessionRecord) -> Result<(), StoreError>;

    /// Fails with `StoreError::NotFound` when no snapshot exists.
    async fn get(&self, key: &ConversationKey) -> Result<SessionRecord, StoreError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &ConversationKey) -> Result<(), StoreError>;

    async fn list_all(&self, client_scope: &str) -> Result<Vec<SessionRecord>, StoreError>;
}

pub struct SqliteSessionStore {
    db: Database,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    #[instrument(
        skip(self, record),
        fields(conversation_key = %record.key, status = %record.status())
    )]
    async fn put(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions
                    (conversation_key, client_scope, status, record, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(conversation_key) DO UPDATE SET
                    client_scope = excluded.client_scope,
                    status = excluded.status,
                    record = excluded.record,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    record.key.as_str(),
                    record.client_scope,
                    record.status().to_string(),
                    json,
                    record.created_at.to_rfc3339(),
                    now,
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(conversation_key = %key))]
    async fn get(&self, key: &ConversationKey) -> Result<SessionRecord, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT record FROM sessions WHERE conversation_key = ?1")?;
            let mut rows = stmt.query([key.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_record(row),
                None => Err(StoreError::NotFound(format!("session {key}"))),
            }
        })
    }

    #[instrument(skip(self), fields(conversation_key = %key))]
    async fn delete(&self, key: &ConversationKey) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM sessions WHERE conversation_key = ?1", [key.as_str()])?;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    async fn list_all(&self, client_scope: &str) -> Result<Vec<SessionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT record FROM sessions WHERE client_scope = ?1 ORDER BY created_at ASC",
            )?;
            let mut rows = stmt.query([client_scope])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_record(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<SessionRecord, StoreError> {
    let raw: String = row_helpers::get(row, 0, "sessions", "record")?;
    row_helpers::parse_json(&raw, "sessions", "record")
}

/// Process-local store for tests and for running without persistence.
#[derive(Default)]
pub struct MemorySessionStore {
    records: DashMap<ConversationKey, SessionRecord>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &ConversationKey) -> bool {
        self.records.contains_key(key)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.records.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, key: &ConversationKey) -> Result<SessionRecord, StoreError> {
        self.records
            .get(key)
            .map(|r| r.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("session {key}")))
    }

    async fn delete(&self, key: &ConversationKey) -> Result<(), StoreError> {
        self.records.remove(key);
        Ok(())
    }

    async fn list_all(&self, client_scope: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let mut records: Vec<SessionRecord> = self
            .records
            .iter()
            .filter(|r| r.client_scope == client_scope)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}
