use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, instrument};

use liaison_core::ids::UserId;
use liaison_core::messages::{ContextEntry, ContextOrigin, MessageContent};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Append-only per-user transcript used to brief the agent who picks up a chat.
#[async_trait]
pub trait ContextCache: Send + Sync {
    async fn append(&self, user_id: &UserId, entry: ContextEntry) -> Result<(), StoreError>;

    /// Entries still inside the retention window, oldest first.
    async fn entries(&self, user_id: &UserId) -> Result<Vec<ContextEntry>, StoreError>;

    /// Drop everything older than the retention window. Returns rows removed.
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}

pub struct SqliteContextCache {
    db: Database,
    retention: Duration,
}

impl SqliteContextCache {
    pub fn new(db: Database, retention: Duration) -> Self {
        Self { db, retention }
    }

    fn cutoff_us(&self) -> i64 {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        Utc::now()
            .checked_sub_signed(retention)
            .map(|t| t.timestamp_micros())
            .unwrap_or(i64::MIN)
    }
}

#[async_trait]
impl ContextCache for SqliteContextCache {
    #[instrument(skip(self, entry), fields(user_id = %user_id, origin = %entry.origin))]
    async fn append(&self, user_id: &UserId, entry: ContextEntry) -> Result<(), StoreError> {
        let content = serde_json::to_string(&entry.content)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO context_entries (user_id, origin, content, timestamp_us)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    user_id.as_str(),
                    entry.origin.to_string(),
                    content,
                    entry.timestamp.timestamp_micros(),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn entries(&self, user_id: &UserId) -> Result<Vec<ContextEntry>, StoreError> {
        let cutoff = self.cutoff_us();
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT origin, content, timestamp_us FROM context_entries
                 WHERE user_id = ?1 AND timestamp_us >= ?2
                 ORDER BY timestamp_us ASC, id ASC",
            )?;
            let mut rows = stmt.query(rusqlite::params![user_id.as_str(), cutoff])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                entries.push(row_to_entry(row)?);
            }
            Ok(entries)
        })
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let cutoff = self.cutoff_us();
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM context_entries WHERE timestamp_us < ?1",
                [cutoff],
            )?)
        })?;
        if removed > 0 {
            debug!(removed, "purged expired context entries");
        }
        Ok(removed)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<ContextEntry, StoreError> {
    let origin: String = row_helpers::get(row, 0, "context_entries", "origin")?;
    let content: String = row_helpers::get(row, 1, "context_entries", "content")?;
    let timestamp_us: i64 = row_helpers::get(row, 2, "context_entries", "timestamp_us")?;

    let origin: ContextOrigin = row_helpers::parse_enum(&origin, "context_entries", "origin")?;
    let content: MessageContent = row_helpers::parse_json(&content, "context_entries", "content")?;
    let timestamp: DateTime<Utc> = Utc
        .timestamp_micros(timestamp_us)
        .single()
        .ok_or_else(|| StoreError::CorruptRow {
            table: "context_entries",
            column: "timestamp_us",
            detail: format!("out of range: {timestamp_us}"),
        })?;

    Ok(ContextEntry {
        origin,
        content,
        timestamp,
    })
}
