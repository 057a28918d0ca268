//! SQLite-backed conversation history.
//!
//! Append-only: every routed instruction becomes one turn. Concurrent
//! writers are expected; a write that finds the database busy or locked is
//! retried a fixed number of times with a fixed pause before giving up with
//! [`StoreError::Contention`].

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::routing::RoutePath;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS conversation_history (
    conv_id          TEXT    NOT NULL,
    turn_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    mode             TEXT    NOT NULL,
    reason           TEXT    NOT NULL,
    query            TEXT    NOT NULL,
    response         TEXT    NOT NULL,
    output_file_name TEXT,
    timestamp        TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversation_history_conv ON conversation_history(conv_id);
"#;

/// Length of a conversation id.
pub const CONVERSATION_ID_LEN: usize = 13;

/// A fresh conversation id: the first 13 characters of a v4 UUID.
pub fn new_conversation() -> String {
    Uuid::new_v4()
        .to_string()
        .chars()
        .take(CONVERSATION_ID_LEN)
        .collect()
}

/// How long to keep trying when the database is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

/// A turn to be written.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub conv_id: String,
    pub mode: RoutePath,
    pub reason: String,
    pub query: String,
    pub response: String,
    pub output_file_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A stored turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub conv_id: String,
    pub turn_id: i64,
    pub mode: String,
    pub reason: String,
    pub query: String,
    pub response: String,
    pub output_file_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// SQLITE_BUSY and SQLITE_LOCKED, including their extended codes.
fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let primary = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            if matches!(primary, Some(5) | Some(6)) {
                return true;
            }
            let message = db.message().to_lowercase();
            message.contains("database is locked") || message.contains("busy")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl ConversationStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(path, RetryPolicy::default()).await
    }

    pub async fn open_with(path: impl AsRef<Path>, retry: RetryPolicy) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
        }

        // Busy handling is ours; SQLite must report contention immediately.
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::ZERO);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        info!(path = %path.display(), "Conversation history opened");
        Ok(Self { pool, retry })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Appends a turn and returns its id.
    pub async fn log_turn(&self, turn: &NewTurn) -> Result<i64, StoreError> {
        if turn.conv_id.trim().is_empty() {
            return Err(StoreError::InvalidTurn("conversation id is empty".to_string()));
        }

        let pool = &self.pool;
        let turn_id = self
            .with_retry(move || async move {
                // A failed attempt is rolled back when `tx` drops, so a later
                // attempt cannot leave a second copy behind.
                let mut tx = pool.begin().await?;
                let result = sqlx::query(
                    "INSERT INTO conversation_history \
                     (conv_id, mode, reason, query, response, output_file_name, timestamp) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .bind(&turn.conv_id)
                .bind(turn.mode.as_str())
                .bind(&turn.reason)
                .bind(&turn.query)
                .bind(&turn.response)
                .bind(&turn.output_file_name)
                .bind(turn.timestamp)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok::<_, sqlx::Error>(result.last_insert_rowid())
            })
            .await?;

        debug!(conv_id = %turn.conv_id, turn_id, mode = turn.mode.as_str(), "Turn logged");
        Ok(turn_id)
    }

    /// All turns of a conversation, oldest first.
    pub async fn fetch(&self, conv_id: &str) -> Result<Vec<ConversationTurn>, StoreError> {
        let pool = &self.pool;
        let rows = self
            .with_retry(move || async move {
                sqlx::query(
                    "SELECT conv_id, turn_id, mode, reason, query, response, output_file_name, timestamp \
                     FROM conversation_history WHERE conv_id = ?1 ORDER BY turn_id",
                )
                .bind(conv_id)
                .fetch_all(pool)
                .await
            })
            .await?;

        rows.iter()
            .map(|row| -> Result<ConversationTurn, StoreError> {
                Ok(ConversationTurn {
                    conv_id: row.try_get("conv_id")?,
                    turn_id: row.try_get("turn_id")?,
                    mode: row.try_get("mode")?,
                    reason: row.try_get("reason")?,
                    query: row.try_get("query")?,
                    response: row.try_get("response")?,
                    output_file_name: row.try_get("output_file_name")?,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_contention(&e) => {
                    warn!(attempt, max = attempts, error = %e, "History store busy");
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.backoff).await;
                    }
                }
                Err(e) => return Err(StoreError::Database(e)),
            }
        }
        Err(StoreError::Contention { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::{ConnectOptions, Connection};

    fn turn(conv_id: &str, query: &str, mode: RoutePath) -> NewTurn {
        NewTurn {
            conv_id: conv_id.to_string(),
            mode,
            reason: "keyword match".to_string(),
            query: query.to_string(),
            response: "done".to_string(),
            output_file_name: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_new_conversation_id_shape() {
        let id = new_conversation();
        assert_eq!(id.len(), CONVERSATION_ID_LEN);
        assert_eq!(id.chars().nth(8), Some('-'));
        assert_ne!(id, new_conversation());
    }

    #[tokio::test]
    async fn test_log_and_fetch_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConversationStore::open(dir.path().join("nested/history.db"))
            .await
            .expect("open");

        let mut edit = turn("conv-a", "double inv_cost", RoutePath::Edit);
        edit.output_file_name = Some("scenario-updated.parquet".to_string());
        let first = store.log_turn(&edit).await.expect("log");
        let second = store
            .log_turn(&turn("conv-a", "what is inv_cost?", RoutePath::Query))
            .await
            .expect("log");
        store
            .log_turn(&turn("conv-b", "other", RoutePath::Query))
            .await
            .expect("log");

        assert!(second > first);
        let turns = store.fetch("conv-a").await.expect("fetch");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].query, "double inv_cost");
        assert_eq!(turns[0].mode, "edit");
        assert_eq!(
            turns[0].output_file_name.as_deref(),
            Some("scenario-updated.parquet")
        );
        assert_eq!(
            turns[0].timestamp.timestamp_millis(),
            edit.timestamp.timestamp_millis()
        );
        assert_eq!(turns[1].mode, "query");
        assert!(store.fetch("missing").await.expect("fetch").is_empty());
    }

    #[tokio::test]
    async fn test_empty_conversation_id_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConversationStore::open(dir.path().join("history.db"))
            .await
            .expect("open");
        assert!(matches!(
            store.log_turn(&turn(" ", "q", RoutePath::Query)).await,
            Err(StoreError::InvalidTurn(_))
        ));
    }

    #[tokio::test]
    async fn test_locked_database_reports_contention() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.db");
        let store = ConversationStore::open_with(
            &path,
            RetryPolicy {
                attempts: 3,
                backoff: Duration::from_millis(10),
            },
        )
        .await
        .expect("open");
        store
            .log_turn(&turn("conv", "warm up", RoutePath::Query))
            .await
            .expect("log");

        let mut holder = SqliteConnectOptions::new()
            .filename(&path)
            .busy_timeout(Duration::ZERO)
            .connect()
            .await
            .expect("connect");
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut holder)
            .await
            .expect("lock");

        let err = store
            .log_turn(&turn("conv", "blocked", RoutePath::Query))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Contention { attempts: 3 }));

        sqlx::query("COMMIT").execute(&mut holder).await.expect("unlock");
        holder.close().await.expect("close");

        store
            .log_turn(&turn("conv", "after", RoutePath::Query))
            .await
            .expect("log after unlock");
        let queries: Vec<String> = store
            .fetch("conv")
            .await
            .expect("fetch")
            .into_iter()
            .map(|t| t.query)
            .collect();
        assert_eq!(queries, vec!["warm up", "after"]);
    }
}
