use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::common::error::CacheError;
use crate::common::models::{LocalState, Message, ThreadId};

/// Rows kept per thread; older history is fetched again when needed.
pub const CACHE_ROWS_PER_THREAD: usize = 200;

/// Per-thread persistence of the last known message list.
#[async_trait]
pub trait MessageCache: Send + Sync {
    async fn load(&self, thread_id: ThreadId) -> Result<Vec<Message>, CacheError>;
    async fn store(&self, thread_id: ThreadId, messages: &[Message]) -> Result<(), CacheError>;
}

/// Only confirmed rows are persisted, without device-local state, and only
/// the newest `CACHE_ROWS_PER_THREAD` of them.
fn cacheable(messages: &[Message]) -> Vec<Message> {
    let confirmed: Vec<&Message> = messages.iter().filter(|m| !m.id.is_local()).collect();
    let skip = confirmed.len().saturating_sub(CACHE_ROWS_PER_THREAD);
    confirmed
        .into_iter()
        .skip(skip)
        .map(|m| Message { local: LocalState::default(), ..m.clone() })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedThread {
    pub thread_id: ThreadId,
    pub rows: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct SqliteMessageCache {
    pool: SqlitePool,
}

impl SqliteMessageCache {
    pub async fn connect(database_url: &str) -> Result<Self, CacheError> {
        info!("[CACHE] Opening message cache at {}", database_url);
        let file_path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);
        let file_path = file_path.split('?').next().unwrap_or(file_path);
        let in_memory = file_path.contains(":memory:");

        if !in_memory {
            if let Some(parent) = Path::new(file_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    debug!("[CACHE] Creating directory {:?}", parent);
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let url = if in_memory || database_url.contains("mode=") {
            database_url.to_string()
        } else if database_url.contains('?') {
            format!("{}&mode=rwc", database_url)
        } else {
            format!("{}?mode=rwc", database_url)
        };
        // Every pooled connection to :memory: would get its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect(&url)
            .await?;

        let cache = Self { pool };
        cache.migrate().await?;
        Ok(cache)
    }

    pub async fn migrate(&self) -> Result<(), CacheError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cached_messages (
                thread_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (thread_id, message_id)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cached_messages_position ON cached_messages(thread_id, position);")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Threads present in the cache with their row counts.
    pub async fn threads(&self) -> Result<Vec<CachedThread>, CacheError> {
        let rows = sqlx::query(
            "SELECT thread_id, COUNT(*) AS row_count, MAX(updated_at) AS updated_at FROM cached_messages GROUP BY thread_id ORDER BY thread_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| -> Result<CachedThread, CacheError> {
                Ok(CachedThread {
                    thread_id: r.try_get("thread_id")?,
                    rows: r.try_get("row_count")?,
                    updated_at: r.try_get("updated_at")?,
                })
            })
            .collect()
    }

    pub async fn clear_thread(&self, thread_id: ThreadId) -> Result<u64, CacheError> {
        let result = sqlx::query("DELETE FROM cached_messages WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl MessageCache for SqliteMessageCache {
    async fn load(&self, thread_id: ThreadId) -> Result<Vec<Message>, CacheError> {
        let rows = sqlx::query("SELECT payload FROM cached_messages WHERE thread_id = ? ORDER BY position")
            .bind(thread_id)
            .fetch_all(&self.pool)
            .await?;
        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.try_get("payload")?;
            messages.push(serde_json::from_str::<Message>(&payload)?);
        }
        debug!("[CACHE] Loaded {} rows for thread {}", messages.len(), thread_id);
        Ok(messages)
    }

    async fn store(&self, thread_id: ThreadId, messages: &[Message]) -> Result<(), CacheError> {
        let rows = cacheable(messages);
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cached_messages WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        for (position, message) in rows.iter().enumerate() {
            let payload = serde_json::to_string(message)?;
            sqlx::query(
                "INSERT INTO cached_messages (thread_id, message_id, position, payload, updated_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(thread_id)
            .bind(i64::from(message.id))
            .bind(position as i64)
            .bind(payload)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!("[CACHE] Stored {} rows for thread {}", rows.len(), thread_id);
        Ok(())
    }
}

/// Process-local cache for tests and embedders without a database.
#[derive(Debug, Default)]
pub struct MemoryMessageCache {
    threads: Mutex<HashMap<ThreadId, Vec<Message>>>,
}

impl MemoryMessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread(thread_id: ThreadId, messages: Vec<Message>) -> Self {
        let cache = Self::default();
        cache.lock().insert(thread_id, cacheable(&messages));
        cache
    }

    pub fn snapshot(&self, thread_id: ThreadId) -> Vec<Message> {
        self.lock().get(&thread_id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ThreadId, Vec<Message>>> {
        self.threads.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MessageCache for MemoryMessageCache {
    async fn load(&self, thread_id: ThreadId) -> Result<Vec<Message>, CacheError> {
        Ok(self.snapshot(thread_id))
    }

    async fn store(&self, thread_id: ThreadId, messages: &[Message]) -> Result<(), CacheError> {
        self.lock().insert(thread_id, cacheable(messages));
        Ok(())
    }
}
