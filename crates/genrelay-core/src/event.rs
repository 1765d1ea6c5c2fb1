//! Relay event model.
//!
//! Every generation produces an ordered log of [`RelayEvent`]s. The payload is
//! a closed sum type whose variant name doubles as the SSE event name, and
//! whose fields form the JSON `data` object (camelCase).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Key injected into SSE `data` objects carrying the event index.
pub const IDX_FIELD: &str = "_idx";

/// Lifecycle status of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Pending,
    Running,
    Completed,
    Error,
    Stopped,
}

impl ResponseStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    /// `completed`, `error` and `stopped` never change again.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }

    /// Statuses reported by the active-response query.
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hunk of a structured patch produced by an edit-style tool.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchHunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_lines: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_lines: Option<u64>,
    #[serde(default)]
    pub lines: Vec<String>,
}

/// Payload of a relay event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum EventPayload {
    /// The external process announced its conversation id.
    Init { session_id: String },
    /// The assistant invoked a tool.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// An edit-style tool completed with a structured patch.
    EditResult {
        tool_id: String,
        file_path: String,
        patch: Vec<PatchHunk>,
    },
    /// A shell-style tool completed.
    BashResult {
        tool_id: String,
        command: String,
        stdout: String,
        stderr: String,
        exit_code: i64,
    },
    /// Generic tool completion. Read-style tools carry no output.
    #[serde(alias = "read_result")]
    ToolOutput {
        tool_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    /// A chunk of assistant text.
    Text { text: String },
    /// The process reported its final result record.
    Result {
        context_percent: f64,
        #[serde(default)]
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
    },
    /// Terminal failure (spawn failure, crash, stop request).
    Error { message: String },
    /// Terminal success.
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_message_id: Option<i64>,
    },
}

impl EventPayload {
    /// Wire name of the event (SSE `event:` field).
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::ToolUse { .. } => "tool_use",
            Self::EditResult { .. } => "edit_result",
            Self::BashResult { .. } => "bash_result",
            Self::ToolOutput { .. } => "tool_output",
            Self::Text { .. } => "text",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    /// After a terminal event a response accepts no further events.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done { .. })
    }

    /// Events kept in the persisted assistant transcript.
    pub const fn is_transcript(&self) -> bool {
        matches!(
            self,
            Self::ToolUse { .. }
                | Self::EditResult { .. }
                | Self::BashResult { .. }
                | Self::ToolOutput { .. }
                | Self::Text { .. }
        )
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// The JSON `data` object of this payload.
    pub fn data(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map
                .remove("data")
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            _ => Value::Object(serde_json::Map::new()),
        }
    }

    /// Rebuild a payload from its wire name and `data` object.
    pub fn from_parts(name: &str, data: Value) -> Result<Self> {
        let tagged = serde_json::json!({ "event": name, "data": data });
        serde_json::from_value(tagged).map_err(|e| Error::InvalidEvent(format!("{name}: {e}")))
    }
}

/// An event as stored in a response log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireEvent", try_from = "WireEvent")]
pub struct RelayEvent {
    /// Position in the response log, starting at 0 with no gaps.
    pub idx: u64,
    pub payload: EventPayload,
}

impl RelayEvent {
    pub const fn new(idx: u64, payload: EventPayload) -> Self {
        Self { idx, payload }
    }

    pub const fn name(&self) -> &'static str {
        self.payload.name()
    }

    pub const fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }

    /// SSE `data` line: the payload data object with `_idx` added.
    pub fn sse_data(&self) -> String {
        let mut data = self.payload.data();
        if let Value::Object(ref mut map) = data {
            map.insert(IDX_FIELD.to_string(), Value::from(self.idx));
        }
        data.to_string()
    }
}

/// Flat `{idx, event, data}` form used by the status query and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEvent {
    idx: u64,
    event: String,
    data: Value,
}

impl From<RelayEvent> for WireEvent {
    fn from(event: RelayEvent) -> Self {
        Self {
            idx: event.idx,
            event: event.payload.name().to_string(),
            data: event.payload.data(),
        }
    }
}

impl TryFrom<WireEvent> for RelayEvent {
    type Error = Error;

    fn try_from(wire: WireEvent) -> Result<Self> {
        Ok(Self {
            idx: wire.idx,
            payload: EventPayload::from_parts(&wire.event, wire.data)?,
        })
    }
}

/// Decode one SSE message into an optional index and a payload.
///
/// Protocol errors emitted before any event exists (unknown response, stale
/// epoch) carry no `_idx`.
pub fn decode_sse(event: &str, data: &str) -> Result<(Option<u64>, EventPayload)> {
    let mut value: Value = serde_json::from_str(data)?;
    let idx = value
        .as_object_mut()
        .and_then(|map| map.remove(IDX_FIELD))
        .and_then(|v| v.as_u64());
    let payload = EventPayload::from_parts(event, value)?;
    Ok((idx, payload))
}
