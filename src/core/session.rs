//! Session identifier storage using SQLite
//!
//! A small key/value table that keeps the per-browser `chatbot_id` across
//! restarts.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Key under which the chatbot session identifier is stored
pub const CHATBOT_ID_KEY: &str = "devconsole.chatbot_id";

/// Fresh session identifier
pub fn new_chatbot_id() -> String {
    format!("chatbot-{}", uuid::Uuid::new_v4())
}

pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Open (or create) the database at the given path
    pub async fn new(db_path: &Path) -> Result<Self, sqlx::Error> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for testing
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM session_kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(value,)| value))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO session_kv (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// When the value under `key` was last written
    pub async fn updated_at(&self, key: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT updated_at FROM session_kv WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.and_then(|(ts,)| {
            DateTime::parse_from_rfc3339(&ts)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        }))
    }

    /// The stored session identifier, generating and persisting one on
    /// first use
    pub async fn load_or_create_chatbot_id(&self) -> Result<String, sqlx::Error> {
        if let Some(id) = self.get(CHATBOT_ID_KEY).await? {
            tracing::debug!("Reusing chatbot id {}", id);
            return Ok(id);
        }

        let id = new_chatbot_id();
        self.set(CHATBOT_ID_KEY, &id).await?;
        tracing::info!("Generated chatbot id {}", id);
        Ok(id)
    }

    /// Replace the session identifier with a fresh one
    pub async fn regenerate_chatbot_id(&self) -> Result<String, sqlx::Error> {
        let id = new_chatbot_id();
        self.set(CHATBOT_ID_KEY, &id).await?;
        tracing::info!("Regenerated chatbot id {}", id);
        Ok(id)
    }
}
