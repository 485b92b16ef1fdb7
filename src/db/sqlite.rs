use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use serde_json::Value;
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqlitePool, SqlitePoolOptions},
    Sqlite,
};

use super::{DocPath, DocumentStore, StoreError};

/// Document store backed by one SQLite table holding JSON text bodies.
/// Sub-path writes go through the JSON1 `json_set` / `json_remove` functions so a
/// mutation touches only the addressed field inside a single statement.
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl SqliteDocumentStore {
    pub async fn connect(db_url: &str) -> Result<Self, StoreError> {
        let in_memory = db_url.contains(":memory:");

        // Create database if it doesn't exist
        if !in_memory && !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            info!("Creating document database at {}", db_url);
            Sqlite::create_database(db_url).await?;
        }

        // An in-memory database lives and dies with its connection, so pin exactly one
        let options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = options.connect(db_url).await?;
        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                key TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                expires_at INTEGER
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS documents_expires_at ON documents (expires_at);")
            .execute(pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn create(&self, key: &str, document: &Value, ttl: Duration) -> Result<bool, StoreError> {
        let now = now_millis();
        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl_millis);
        let body = serde_json::to_string(document)?;

        // Only an expired leftover may be overwritten; a live key is a collision
        let result = sqlx::query(
            r#"
            INSERT INTO documents (key, body, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key)
            DO UPDATE SET body = excluded.body, expires_at = excluded.expires_at
            WHERE documents.expires_at IS NOT NULL AND documents.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(body)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!("create {} (expires_at={}): {} row(s)", key, expires_at, result.rows_affected());
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let body: Option<String> = sqlx::query_scalar(
            r#"
            SELECT body
            FROM documents
            WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(key)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn set_paths(&self, key: &str, updates: &[(DocPath, Value)]) -> Result<bool, StoreError> {
        if updates.is_empty() {
            return Ok(self.get(key).await?.is_some());
        }

        // json_set takes any number of path/value pairs and applies them in order
        let pairs = vec!["?, json(?)"; updates.len()].join(", ");
        let sql = format!(
            r#"
            UPDATE documents
            SET body = json_set(body, {})
            WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
            pairs
        );

        let mut query = sqlx::query(&sql);
        for (path, value) in updates {
            query = query.bind(path.to_sqlite_path()).bind(serde_json::to_string(value)?);
        }

        let result = query.bind(key).bind(now_millis()).execute(&self.pool).await?;

        for (path, _) in updates {
            debug!("set {}{}: {} row(s)", key, path, result.rows_affected());
        }
        Ok(result.rows_affected() > 0)
    }

    async fn delete_path(&self, key: &str, path: &DocPath) -> Result<bool, StoreError> {
        if path.is_root() {
            return self.delete(key).await;
        }

        let result = sqlx::query(
            r#"
            UPDATE documents
            SET body = json_remove(body, ?)
            WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(path.to_sqlite_path())
        .bind(key)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        debug!("delete {}{}: {} row(s)", key, path, result.rows_affected());
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM documents
            WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(key)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        debug!("delete {}: {} row(s)", key, result.rows_affected());
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self) -> Result<Vec<String>, StoreError> {
        let keys: Vec<String> = sqlx::query_scalar(
            r#"
            DELETE FROM documents
            WHERE expires_at IS NOT NULL AND expires_at <= ?
            RETURNING key
            "#,
        )
        .bind(now_millis())
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }
}
