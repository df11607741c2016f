//! Append-only SQLite conversation store for Murmur.
//!
//! One row per conversational turn, keyed by the `channel-ts` composite
//! identifier. Threads are a derived view: every row whose `thread_ts`
//! matches the thread key, plus the root row whose own `ts` equals it,
//! ordered ascending by `ts`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid stored role '{0}'")]
    InvalidRole(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Author of a stored turn.
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    fn parse(value: &str) -> StoreResult<Self> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(StoreError::InvalidRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// One persisted conversational turn.
pub struct StoredMessage {
    pub channel_id: String,
    pub ts: String,
    pub thread_ts: Option<String>,
    pub text: String,
    pub role: MessageRole,
}

impl StoredMessage {
    /// Composite natural key, unique per row.
    pub fn channel_ts(&self) -> String {
        format!("{}-{}", self.channel_id, self.ts)
    }
}

#[async_trait]
/// Trait contract for the conversation store.
pub trait MessageStore: Send + Sync {
    /// Appends one turn. Returns false when a row with the same
    /// `channel-ts` key already exists (idempotent under webhook
    /// redelivery).
    async fn append(&self, message: &StoredMessage) -> StoreResult<bool>;

    /// Returns every turn of the thread identified by `thread_key`,
    /// root row included, ascending by `ts`.
    async fn list_thread(&self, thread_key: &str) -> StoreResult<Vec<StoredMessage>>;
}

/// Persistent SQLite-backed `MessageStore`.
#[derive(Debug)]
pub struct SqliteMessageStore {
    db_path: PathBuf,
}

impl SqliteMessageStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chat_history (
                channel_ts TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                thread_ts TEXT NULL,
                text TEXT NOT NULL,
                role TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_chat_history_thread
                ON chat_history (thread_ts, ts);
            "#,
        )?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append(&self, message: &StoredMessage) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let inserted = connection.execute(
            r#"
            INSERT OR IGNORE INTO chat_history
                (channel_ts, channel_id, ts, thread_ts, text, role)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                message.channel_ts(),
                message.channel_id,
                message.ts,
                message.thread_ts,
                message.text,
                message.role.as_str(),
            ],
        )?;
        Ok(inserted > 0)
    }

    async fn list_thread(&self, thread_key: &str) -> StoreResult<Vec<StoredMessage>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            r#"
            SELECT channel_id, ts, thread_ts, text, role
            FROM chat_history
            WHERE ts = ?1 OR thread_ts = ?1
            ORDER BY ts ASC
            "#,
        )?;

        let rows = statement.query_map(params![thread_key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (channel_id, ts, thread_ts, text, role) = row?;
            messages.push(StoredMessage {
                channel_id,
                ts,
                thread_ts,
                text,
                role: MessageRole::parse(&role)?,
            });
        }
        Ok(messages)
    }
}
