pub mod polls;
pub mod sqlite;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

pub use polls::PollRepository;
pub use sqlite::SqliteDocumentStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed document: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Location of a field inside a stored document, e.g. `.participants.<userId>`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DocPath {
    segments: Vec<String>,
}

impl DocPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.segments.push(name.into());
        self
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// SQLite JSON1 path with every label quoted so ids containing `-` stay one label.
    pub fn to_sqlite_path(&self) -> String {
        let mut path = String::from("$");
        for segment in &self.segments {
            path.push_str(".\"");
            path.push_str(segment);
            path.push('"');
        }
        path
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, ".");
        }
        for segment in &self.segments {
            write!(f, ".{}", segment)?;
        }
        Ok(())
    }
}

/// Key/path addressed JSON document store with per-key expiry.
///
/// Writes report `false` when no live document exists under the key, so callers
/// can tell a missing poll apart from a storage failure.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Stores a new document that expires after `ttl`. Returns `false` if a live
    /// document already occupies the key.
    async fn create(&self, key: &str, document: &Value, ttl: Duration) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set_path(&self, key: &str, path: &DocPath, value: &Value) -> Result<bool, StoreError> {
        self.set_paths(key, &[(path.clone(), value.clone())]).await
    }

    /// Writes every `(path, value)` pair in one atomic update.
    async fn set_paths(&self, key: &str, updates: &[(DocPath, Value)]) -> Result<bool, StoreError>;

    async fn delete_path(&self, key: &str, path: &DocPath) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Drops every expired document and returns the keys that were removed.
    async fn purge_expired(&self) -> Result<Vec<String>, StoreError>;
}
