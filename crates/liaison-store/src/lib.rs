pub mod context;
pub mod database;
pub mod dedup;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use context::{ContextCache, SqliteContextCache};
pub use database::Database;
pub use dedup::DedupCache;
pub use error::StoreError;
pub use sessions::{MemorySessionStore, SessionStore, SqliteSessionStore};
