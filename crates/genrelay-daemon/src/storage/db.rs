//! Transcript database handle.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::migrate::{MigrateError, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Connections for a file database. Writers are serialized by `SQLite`.
const FILE_POOL_SIZE: u32 = 4;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Transcript store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Cannot open transcript database: {0}")]
    Open(String),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrateError),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// Sessions, messages and saved commands.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open the database file, creating it and its directory when missing.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DatabaseError::Open(format!("{}: {e}", parent.display())))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let db = Self::connect(options, FILE_POOL_SIZE).await?;
        info!(path = %path.display(), "Transcript database ready");
        Ok(db)
    }

    /// A private database that lives as long as the handle.
    ///
    /// Each in-memory connection is its own database, so the pool holds one.
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DatabaseError::Open(e.to_string()))?
            .foreign_keys(true);
        Self::connect(options, 1).await
    }

    async fn connect(options: SqliteConnectOptions, size: u32) -> Result<Self, DatabaseError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(size)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::Open(e.to_string()))?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub(super) const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_database_is_migrated() {
        let db = Database::open_in_memory().await.unwrap();
        let (tables,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('sessions', 'messages', 'commands')",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(tables, 3);
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("transcripts.db");

        let db = Database::open(&path).await.unwrap();
        db.ensure_session("chat_a", "chat").await.unwrap();
        db.pool().close().await;

        let reopened = Database::open(&path).await.unwrap();
        assert_eq!(reopened.get_session("chat_a").await.unwrap().mode, "chat");
    }
}
