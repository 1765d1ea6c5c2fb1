//! Request and reply bodies of the relay HTTP interface.
//!
//! Shared by the daemon (axum extractors) and the CLI (reqwest bodies).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::{RelayEvent, ResponseStatus};

/// Mode used when a submission names none.
pub const DEFAULT_MODE: &str = "chat";

/// `POST /generate` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub message: String,
    /// Logical session name within the mode.
    #[serde(alias = "name")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// MCP tool names the user enabled. Every other known MCP tool is disallowed.
    #[serde(default)]
    pub enabled_tool_names: Vec<String>,
    #[serde(default)]
    pub file_substitutions: FileSubstitutions,
}

impl GenerateRequest {
    pub fn mode(&self) -> &str {
        self.mode
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MODE)
    }
}

/// Short placeholder name to saved upload name.
///
/// Accepted either as a JSON object or as `"short:saved,short2:saved2"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileSubstitutions {
    Map(BTreeMap<String, String>),
    Inline(String),
}

impl Default for FileSubstitutions {
    fn default() -> Self {
        Self::Map(BTreeMap::new())
    }
}

impl FileSubstitutions {
    /// Normalized `(short, saved)` pairs. Malformed inline entries are skipped.
    pub fn pairs(&self) -> Vec<(String, String)> {
        match self {
            Self::Map(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Self::Inline(raw) => raw
                .split(',')
                .filter_map(|entry| {
                    let (short, saved) = entry.split_once(':')?;
                    let (short, saved) = (short.trim(), saved.trim());
                    (!short.is_empty() && !saved.is_empty())
                        .then(|| (short.to_string(), saved.to_string()))
                })
                .collect(),
        }
    }
}

/// `POST /generate` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub response_id: String,
    pub session_id: String,
    pub epoch: u64,
}

/// `GET /stream` query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamQuery {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_from: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
}

/// `GET /status/{response_id}` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: ResponseStatus,
    pub events: Vec<RelayEvent>,
    pub final_result: Option<String>,
    pub context_percent: Option<f64>,
    pub error: Option<String>,
    pub session_id: String,
    pub epoch: u64,
}

/// `GET /active` query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveQuery {
    #[serde(default)]
    pub session_id: Option<String>,
}

/// `GET /active` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveResponse {
    pub active: Vec<String>,
    /// Latest epoch of the queried session, if it ever had a response.
    pub epoch: Option<u64>,
}

/// `POST /stop` body. `session_id` wins over `mode`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResponse {
    pub cancelled: usize,
}

/// Body of `POST /clear` and query of `GET /context` and `GET /messages`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionQuery {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearResponse {
    pub session_id: String,
    pub deleted_messages: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResponse {
    pub session_id: String,
    pub context_percent: f64,
}

/// A persisted conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub events: Vec<RelayEvent>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub session_id: String,
    pub messages: Vec<StoredMessage>,
}

/// A reusable prompt fragment, inserted with `{{cmd:<name>}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedCommand {
    pub name: String,
    pub content: String,
    pub created_at: i64,
}

/// Body of `PUT /commands/{name}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandBody {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandsResponse {
    pub commands: Vec<SavedCommand>,
}

/// Error reply body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}
