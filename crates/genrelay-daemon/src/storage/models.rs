//! Database models for the transcript store.

use genrelay_core::api::{SavedCommand, StoredMessage};
use genrelay_core::event::RelayEvent;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Session record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub mode: String,
    /// Conversation id passed to the CLI (`--session-id` / `--resume`).
    pub cli_session_id: String,
    pub context_percent: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Message record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub role: String,
    pub content: String,
    /// JSON array of transcript events (assistant messages only).
    pub events: Option<String>,
    pub created_at: i64,
}

impl Message {
    pub fn into_stored(self) -> StoredMessage {
        let events = self
            .events
            .as_deref()
            .and_then(|raw| {
                serde_json::from_str::<Vec<RelayEvent>>(raw)
                    .map_err(|e| warn!(message_id = self.id, error = %e, "Unreadable stored events"))
                    .ok()
            })
            .unwrap_or_default();
        StoredMessage {
            id: self.id,
            role: self.role,
            content: self.content,
            events,
            created_at: self.created_at,
        }
    }
}

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// What a new turn needs from the stored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnContext {
    pub cli_session_id: String,
    /// No earlier exchange exists, so the CLI conversation must be created.
    pub is_first: bool,
}

/// Saved command record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Command {
    pub name: String,
    pub content: String,
    pub created_at: i64,
}

impl Command {
    pub fn into_saved(self) -> SavedCommand {
        SavedCommand {
            name: self.name,
            content: self.content,
            created_at: self.created_at,
        }
    }
}
