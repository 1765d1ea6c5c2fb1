//! Database queries for the transcript store.

use std::time::{SystemTime, UNIX_EPOCH};

use genrelay_core::event::RelayEvent;

use super::db::{Database, DatabaseError};
use super::models::{Command, Message, Role, Session};

/// Seconds since the Unix epoch.
#[allow(clippy::cast_possible_wrap)]
fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl Database {
    // =========================================================================
    // Session queries
    // =========================================================================

    /// Get a session, creating it with a fresh CLI conversation id if missing.
    pub async fn ensure_session(&self, id: &str, mode: &str) -> Result<Session, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT OR IGNORE INTO sessions (id, mode, cli_session_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(id)
        .bind(mode)
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_session(id).await
    }

    /// Get a session by ID.
    pub async fn get_session(&self, id: &str) -> Result<Session, DatabaseError> {
        sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Session {id}")))
    }

    /// Store the context usage reported by the last result.
    pub async fn update_context_percent(
        &self,
        id: &str,
        context_percent: f64,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE sessions SET context_percent = ?, updated_at = ? WHERE id = ?")
            .bind(context_percent)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Delete a session's messages and start a new CLI conversation.
    ///
    /// Returns the number of deleted messages.
    pub async fn clear_session(&self, id: &str) -> Result<u64, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let deleted = sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query(
            "UPDATE sessions SET cli_session_id = ?, context_percent = 0, updated_at = ? WHERE id = ?",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(unix_timestamp())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(deleted)
    }

    // =========================================================================
    // Message queries
    // =========================================================================

    /// Insert a message. Assistant messages carry their transcript events.
    pub async fn insert_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        events: Option<&[RelayEvent]>,
    ) -> Result<i64, DatabaseError> {
        let events = events
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Query(format!("serialize events: {e}")))?;

        let result = sqlx::query(
            r"
            INSERT INTO messages (session_id, role, content, events, created_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(session_id)
        .bind(role.as_str())
        .bind(content)
        .bind(events)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(unix_timestamp())
            .bind(session_id)
            .execute(self.pool())
            .await?;

        Ok(result.last_insert_rowid())
    }

    /// Messages of a session in insertion order.
    pub async fn get_messages(&self, session_id: &str) -> Result<Vec<Message>, DatabaseError> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;

        Ok(messages)
    }

    /// Count messages in a session.
    pub async fn count_messages(&self, session_id: &str) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(self.pool())
            .await?;

        Ok(row.0)
    }

    // =========================================================================
    // Command queries
    // =========================================================================

    /// Create or replace a saved command.
    pub async fn upsert_command(&self, name: &str, content: &str) -> Result<Command, DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO commands (name, content, created_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET content = excluded.content
            ",
        )
        .bind(name)
        .bind(content)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        self.get_command(name)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Command {name}")))
    }

    pub async fn get_command(&self, name: &str) -> Result<Option<Command>, DatabaseError> {
        Ok(
            sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE name = ?")
                .bind(name)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn list_commands(&self) -> Result<Vec<Command>, DatabaseError> {
        Ok(
            sqlx::query_as::<_, Command>("SELECT * FROM commands ORDER BY name ASC")
                .fetch_all(self.pool())
                .await?,
        )
    }

    /// Returns whether a command was deleted.
    pub async fn delete_command(&self, name: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM commands WHERE name = ?")
            .bind(name)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
