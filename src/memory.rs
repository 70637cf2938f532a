//! Durable Memory Storage
//!
//! SQLite-backed persistence for session memories. Rows are unique on
//! (user_id, conversation_id, content), so writing the same fact twice is an
//! upsert rather than a duplicate.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// A memory as written to storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryRecord {
    pub user_id: String,
    pub conversation_id: String,
    pub content: String,
    /// Unix seconds
    pub created_at: i64,
    /// Unix seconds
    pub last_used: i64,
    pub use_count: u32,
}

/// A persisted memory row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMemory {
    pub id: i64,
    #[serde(flatten)]
    pub record: MemoryRecord,
}

/// Durable storage interface for memories
pub trait MemoryStorage: Send + Sync {
    /// Insert, or refresh `last_used`/`use_count` of an existing fact
    fn upsert(&self, record: &MemoryRecord) -> Result<(), StorageError>;

    /// Memories of one user in one conversation, most recently used first
    fn list_by_user(&self, user_id: &str, conversation_id: &str) -> Result<Vec<StoredMemory>, StorageError>;

    fn list_by_conversation(&self, conversation_id: &str) -> Result<Vec<StoredMemory>, StorageError>;

    fn users_in_conversation(&self, conversation_id: &str) -> Result<Vec<String>, StorageError>;

    fn get_by_id(&self, id: i64) -> Result<Option<StoredMemory>, StorageError>;

    fn update_content(&self, id: i64, content: &str) -> Result<bool, StorageError>;

    fn increment_use(&self, id: i64) -> Result<bool, StorageError>;

    fn delete_by_id(&self, id: i64) -> Result<bool, StorageError>;

    /// Delete every memory a user holds in a conversation
    fn delete_all_for_user(&self, user_id: &str, conversation_id: &str) -> Result<usize, StorageError>;
}

/// Memory storage with SQLite backend
pub struct SqliteMemoryStore {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str =
    "SELECT id, user_id, conversation_id, content, created_at, last_used, use_count FROM memories";

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMemory> {
    Ok(StoredMemory {
        id: row.get(0)?,
        record: MemoryRecord {
            user_id: row.get(1)?,
            conversation_id: row.get(2)?,
            content: row.get(3)?,
            created_at: row.get(4)?,
            last_used: row.get(5)?,
            use_count: row.get(6)?,
        },
    })
}

impl SqliteMemoryStore {
    /// Open or create the memory database
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn)?;
        info!("Memory database opened: {}", path.display());
        Ok(store)
    }

    /// In-memory database (tests, ephemeral runs)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_used INTEGER NOT NULL,
                use_count INTEGER NOT NULL DEFAULT 0,
                UNIQUE(user_id, conversation_id, content)
            );

            CREATE INDEX IF NOT EXISTS idx_memories_user_conv
                ON memories(user_id, conversation_id);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Total stored memories
    pub fn count(&self) -> Result<usize, StorageError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl MemoryStorage for SqliteMemoryStore {
    fn upsert(&self, record: &MemoryRecord) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memories (user_id, conversation_id, content, created_at, last_used, use_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id, conversation_id, content) DO UPDATE SET
                last_used = excluded.last_used,
                use_count = excluded.use_count",
            params![
                record.user_id,
                record.conversation_id,
                record.content,
                record.created_at,
                record.last_used,
                record.use_count,
            ],
        )?;
        debug!("Upserted memory for {}@{}", record.user_id, record.conversation_id);
        Ok(())
    }

    fn list_by_user(&self, user_id: &str, conversation_id: &str) -> Result<Vec<StoredMemory>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE user_id = ?1 AND conversation_id = ?2 ORDER BY last_used DESC, id DESC",
            SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![user_id, conversation_id], row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn list_by_conversation(&self, conversation_id: &str) -> Result<Vec<StoredMemory>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE conversation_id = ?1 ORDER BY last_used DESC, id DESC",
            SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![conversation_id], row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn users_in_conversation(&self, conversation_id: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT user_id FROM memories WHERE conversation_id = ?1 ORDER BY user_id",
        )?;
        let users = stmt
            .query_map(params![conversation_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(users)
    }

    fn get_by_id(&self, id: i64) -> Result<Option<StoredMemory>, StorageError> {
        let conn = self.conn.lock();
        let memory = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                params![id],
                row_to_memory,
            )
            .optional()?;
        Ok(memory)
    }

    fn update_content(&self, id: i64, content: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE memories SET content = ?1, last_used = ?2 WHERE id = ?3",
            params![content, chrono::Utc::now().timestamp(), id],
        )?;
        Ok(rows > 0)
    }

    fn increment_use(&self, id: i64) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE memories SET use_count = use_count + 1, last_used = ?1 WHERE id = ?2",
            params![chrono::Utc::now().timestamp(), id],
        )?;
        Ok(rows > 0)
    }

    fn delete_by_id(&self, id: i64) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn delete_all_for_user(&self, user_id: &str, conversation_id: &str) -> Result<usize, StorageError> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM memories WHERE user_id = ?1 AND conversation_id = ?2",
            params![user_id, conversation_id],
        )?;
        if rows > 0 {
            info!("Deleted {} memories for {}@{}", rows, user_id, conversation_id);
        }
        Ok(rows)
    }
}
