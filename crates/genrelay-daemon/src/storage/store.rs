//! Storage seam used by the relay.

use async_trait::async_trait;
use genrelay_core::api::{SavedCommand, StoredMessage};
use genrelay_core::event::RelayEvent;

use super::db::{Database, DatabaseError};
use super::models::{Role, TurnContext};

/// Persistence of sessions and their final transcripts.
///
/// The relay keeps event logs in memory only. This store receives the user
/// message when a turn starts and the assistant message when it completes.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Record the user message and return what the CLI invocation needs.
    async fn begin_turn(
        &self,
        session_id: &str,
        mode: &str,
        message: &str,
    ) -> Result<TurnContext, DatabaseError>;

    /// Store the assistant reply with its transcript events. Returns the message id.
    async fn save_assistant(
        &self,
        session_id: &str,
        content: &str,
        events: &[RelayEvent],
    ) -> Result<i64, DatabaseError>;

    async fn update_context(&self, session_id: &str, percent: f64) -> Result<(), DatabaseError>;

    async fn context_percent(&self, session_id: &str) -> Result<f64, DatabaseError>;

    /// Forget the conversation. Returns the number of deleted messages.
    async fn clear(&self, session_id: &str) -> Result<u64, DatabaseError>;

    async fn messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, DatabaseError>;

    /// Content of the saved command `name`.
    async fn command(&self, name: &str) -> Result<Option<String>, DatabaseError>;

    async fn save_command(&self, name: &str, content: &str) -> Result<SavedCommand, DatabaseError>;

    async fn commands(&self) -> Result<Vec<SavedCommand>, DatabaseError>;

    async fn delete_command(&self, name: &str) -> Result<bool, DatabaseError>;
}

#[async_trait]
impl TranscriptStore for Database {
    async fn begin_turn(
        &self,
        session_id: &str,
        mode: &str,
        message: &str,
    ) -> Result<TurnContext, DatabaseError> {
        let session = self.ensure_session(session_id, mode).await?;
        self.insert_message(session_id, Role::User, message, None)
            .await?;
        let count = self.count_messages(session_id).await?;
        Ok(TurnContext {
            cli_session_id: session.cli_session_id,
            is_first: count <= 1,
        })
    }

    async fn save_assistant(
        &self,
        session_id: &str,
        content: &str,
        events: &[RelayEvent],
    ) -> Result<i64, DatabaseError> {
        let events = (!events.is_empty()).then_some(events);
        self.insert_message(session_id, Role::Assistant, content, events)
            .await
    }

    async fn update_context(&self, session_id: &str, percent: f64) -> Result<(), DatabaseError> {
        self.update_context_percent(session_id, percent).await
    }

    async fn context_percent(&self, session_id: &str) -> Result<f64, DatabaseError> {
        match self.get_session(session_id).await {
            Ok(session) => Ok(session.context_percent),
            Err(DatabaseError::NotFound(_)) => Ok(0.0),
            Err(e) => Err(e),
        }
    }

    async fn clear(&self, session_id: &str) -> Result<u64, DatabaseError> {
        self.clear_session(session_id).await
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, DatabaseError> {
        Ok(self
            .get_messages(session_id)
            .await?
            .into_iter()
            .map(super::models::Message::into_stored)
            .collect())
    }

    async fn command(&self, name: &str) -> Result<Option<String>, DatabaseError> {
        Ok(self.get_command(name).await?.map(|c| c.content))
    }

    async fn save_command(
        &self,
        name: &str,
        content: &str,
    ) -> Result<SavedCommand, DatabaseError> {
        Ok(self.upsert_command(name, content).await?.into_saved())
    }

    async fn commands(&self) -> Result<Vec<SavedCommand>, DatabaseError> {
        Ok(self
            .list_commands()
            .await?
            .into_iter()
            .map(super::models::Command::into_saved)
            .collect())
    }

    async fn delete_command(&self, name: &str) -> Result<bool, DatabaseError> {
        Database::delete_command(self, name).await
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_turn_then_resume() {
        let db = Database::open_in_memory().await.unwrap();
        let first = db.begin_turn("chat_a", "chat", "hello").await.unwrap();
        assert!(first.is_first);
        db.save_assistant("chat_a", "hi", &[]).await.unwrap();

        let second = db.begin_turn("chat_a", "chat", "again").await.unwrap();
        assert!(!second.is_first);
        assert_eq!(second.cli_session_id, first.cli_session_id);
    }

    #[tokio::test]
    async fn clear_starts_new_conversation() {
        let db = Database::open_in_memory().await.unwrap();
        let first = db.begin_turn("s", "chat", "hello").await.unwrap();
        db.save_assistant("s", "hi", &[]).await.unwrap();
        assert_eq!(db.clear("s").await.unwrap(), 2);

        let next = db.begin_turn("s", "chat", "fresh").await.unwrap();
        assert!(next.is_first);
        assert_ne!(next.cli_session_id, first.cli_session_id);
    }

    #[tokio::test]
    async fn context_percent_defaults_to_zero() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(db.context_percent("unknown").await.unwrap().abs() < f64::EPSILON);
        db.begin_turn("s", "chat", "x").await.unwrap();
        db.update_context("s", 12.3).await.unwrap();
        assert!((db.context_percent("s").await.unwrap() - 12.3).abs() < 1e-9);
    }
}
