//! Message types for the Claude Code NDJSON protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Canonical record types emitted by the `claude` CLI in stream-json mode.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SystemInit(SystemInit),
    Assistant(AssistantMessage),
    User(UserMessage),
    StreamEvent(StreamEvent),
    Result(SessionResult),
    /// A record type this version does not know. Kept for forward compatibility.
    Unknown { msg_type: String, payload: Value },
}

/// System initialization record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInit {
    pub session_id: String,
    pub model: String,
    pub cwd: PathBuf,
    #[serde(default)]
    pub subtype: Option<String>,
}

/// Complete assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    /// Present when the record carried a `usage` object.
    pub usage: Option<Usage>,
}

/// Content block in an assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

/// Reason the assistant stopped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
    Unknown(String),
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl Usage {
    /// Tokens occupying the context window for this request.
    pub const fn context_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_input_tokens + self.cache_creation_input_tokens
    }
}

/// User record (tool results echo).
#[derive(Debug, Clone, PartialEq)]
pub struct UserMessage {
    pub content: Vec<ToolResult>,
    /// Structured tool outcome (`tool_use_result`), shape depends on the tool.
    pub tool_use_result: Option<Value>,
}

/// Tool execution result block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

/// Streaming event for partial output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub event_type: StreamEventType,
}

/// Stream event types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventType {
    ContentBlockStart { index: u32, block_type: String },
    ContentBlockDelta { index: u32, delta: Delta },
    ContentBlockStop { index: u32 },
    MessageStart,
    MessageDelta { stop_reason: Option<String> },
    MessageStop,
    Unknown(Value),
}

/// Delta content in streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    Text(String),
    InputJson(String),
    Unknown(Value),
}

/// Per-model usage reported in the result record (`modelUsage`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    #[serde(skip)]
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub context_window: Option<u64>,
}

impl ModelUsage {
    pub const fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens
    }
}

/// Session completion result.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    pub subtype: ResultSubtype,
    pub session_id: String,
    pub duration_ms: u64,
    pub cost_usd: Option<f64>,
    pub usage: Usage,
    /// Final assistant text.
    pub result: Option<String>,
    pub is_error: bool,
    pub errors: Vec<String>,
    pub model_usage: Vec<ModelUsage>,
}

/// Result subtype.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResultSubtype {
    #[default]
    Success,
    Error,
    Unknown(String),
}
