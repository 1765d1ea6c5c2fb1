//! NDJSON to relay event bridge.
//!
//! Converts decoded stream-json records from Claude's stdout into
//! [`EventPayload`]s. The registry assigns indices; the bridge only shapes
//! payloads and remembers what it needs for the final result.

use std::collections::VecDeque;

use genrelay_core::event::{EventPayload, PatchHunk};
use genrelay_core::ndjson::{
    AssistantMessage, ContentBlock, Delta, Message, ModelUsage, ResultSubtype, SessionResult,
    StreamEvent, StreamEventType, SystemInit, Usage, UserMessage,
};
use serde_json::Value;
use tracing::{debug, warn};

/// Context window assumed when the result record does not report one.
pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

#[derive(Debug, Clone)]
struct PendingTool {
    id: String,
    name: String,
    input: Value,
}

/// What the result record said about the generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSummary {
    pub text: String,
    pub context_percent: f64,
    /// Set when the process flagged the result as a failure.
    pub error: Option<String>,
}

/// Bridge for converting NDJSON messages to relay events.
#[derive(Debug, Default)]
pub struct EventBridge {
    /// Tool calls awaiting a result, in call order.
    pending_tools: VecDeque<PendingTool>,
    init_seen: bool,
    model: Option<String>,
    last_usage: Option<Usage>,
    /// Text deltas were emitted since the last complete assistant message.
    streamed_text: bool,
    final_text: String,
    result: Option<ResultSummary>,
}

impl EventBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert an NDJSON message to relay events.
    ///
    /// Returns a vector because some messages produce several events.
    pub fn convert(&mut self, msg: Message) -> Vec<EventPayload> {
        match msg {
            Message::SystemInit(init) => self.handle_system_init(init),
            Message::Assistant(assistant) => self.handle_assistant(assistant),
            Message::StreamEvent(stream) => self.handle_stream_event(stream),
            Message::User(user) => self.handle_user(user),
            Message::Result(result) => self.handle_result(result),
            Message::Unknown { msg_type, .. } => {
                debug!(msg_type, "Skipping unknown NDJSON message type");
                vec![]
            }
        }
    }

    fn handle_system_init(&mut self, init: SystemInit) -> Vec<EventPayload> {
        if self.init_seen {
            return vec![];
        }
        self.init_seen = true;
        if !init.model.is_empty() {
            self.model = Some(init.model);
        }
        vec![EventPayload::Init {
            session_id: init.session_id,
        }]
    }

    fn handle_assistant(&mut self, msg: AssistantMessage) -> Vec<EventPayload> {
        if msg.usage.is_some() {
            self.last_usage = msg.usage;
        }

        let suppress_text = std::mem::take(&mut self.streamed_text);
        let mut events = Vec::new();
        for block in msg.content {
            match block {
                ContentBlock::Text { text } if !text.is_empty() => {
                    self.final_text.clone_from(&text);
                    if !suppress_text {
                        events.push(EventPayload::Text { text });
                    }
                }
                ContentBlock::Text { .. } => {}
                ContentBlock::ToolUse { id, name, input } => {
                    self.pending_tools.push_back(PendingTool {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    });
                    events.push(EventPayload::ToolUse { id, name, input });
                }
            }
        }
        events
    }

    fn handle_stream_event(&mut self, stream: StreamEvent) -> Vec<EventPayload> {
        match stream.event_type {
            StreamEventType::ContentBlockDelta {
                delta: Delta::Text(text),
                ..
            } if !text.is_empty() => {
                self.streamed_text = true;
                vec![EventPayload::Text { text }]
            }
            _ => vec![],
        }
    }

    /// Pending tool for a result: by id when known, else the oldest call.
    fn take_pending(&mut self, tool_use_id: Option<&str>) -> Option<PendingTool> {
        if let Some(id) = tool_use_id
            && let Some(pos) = self.pending_tools.iter().position(|t| t.id == id)
        {
            return self.pending_tools.remove(pos);
        }
        self.pending_tools.pop_front()
    }

    fn handle_user(&mut self, user: UserMessage) -> Vec<EventPayload> {
        if let Some(ref result) = user.tool_use_result {
            let first_id = user.content.first().map(|tr| tr.tool_use_id.as_str());
            let tool = self.take_pending(first_id);
            let tool_id = tool
                .as_ref()
                .map(|t| t.id.clone())
                .or_else(|| first_id.map(String::from))
                .unwrap_or_default();
            return shape_tool_result(result, tool.as_ref(), tool_id)
                .into_iter()
                .collect();
        }

        user.content
            .into_iter()
            .map(|tr| {
                self.take_pending(Some(&tr.tool_use_id));
                EventPayload::ToolOutput {
                    tool_id: tr.tool_use_id,
                    output: Some(tr.content),
                }
            })
            .collect()
    }

    fn handle_result(&mut self, result: SessionResult) -> Vec<EventPayload> {
        let context_percent =
            context_percent(&result.model_usage, self.model.as_deref(), self.last_usage);
        let text = result.result.clone().unwrap_or_default();
        if !text.is_empty() {
            self.final_text.clone_from(&text);
        }

        // `is_error` alone with a success subtype and no messages is spurious.
        let has_real_error = result.is_error
            && (result.subtype != ResultSubtype::Success || !result.errors.is_empty());
        let error = has_real_error.then(|| {
            warn!(errors = ?result.errors, "Claude result indicates error");
            if !result.errors.is_empty() {
                result.errors.join("; ")
            } else if !text.is_empty() {
                text.clone()
            } else {
                format!("Claude exited with error (subtype: {:?})", result.subtype)
            }
        });

        self.result = Some(ResultSummary {
            text: text.clone(),
            context_percent,
            error,
        });

        vec![EventPayload::Result {
            context_percent,
            text,
            cost_usd: result.cost_usd,
            duration_ms: result.duration_ms,
            input_tokens: result.usage.input_tokens,
            output_tokens: result.usage.output_tokens,
        }]
    }

    /// Latest complete assistant text, replaced by the result text if any.
    pub fn final_text(&self) -> &str {
        &self.final_text
    }

    pub const fn result(&self) -> Option<&ResultSummary> {
        self.result.as_ref()
    }
}

/// Shape a `tool_use_result` value into an event.
fn shape_tool_result(
    result: &Value,
    tool: Option<&PendingTool>,
    tool_id: String,
) -> Option<EventPayload> {
    let name = tool.map_or("", |t| t.name.as_str());

    let obj = match result {
        Value::String(s) => {
            return Some(EventPayload::ToolOutput {
                tool_id,
                output: Some(s.clone()),
            });
        }
        Value::Object(obj) => obj,
        _ => return None,
    };

    if let Some(patch) = obj.get("structuredPatch") {
        if name == "Write" {
            return Some(EventPayload::ToolOutput {
                tool_id,
                output: Some("File created".to_string()),
            });
        }
        let patch: Vec<PatchHunk> = serde_json::from_value(patch.clone()).unwrap_or_default();
        return Some(EventPayload::EditResult {
            tool_id,
            file_path: str_of(obj.get("filePath")),
            patch,
        });
    }

    if obj.contains_key("file") {
        return Some(EventPayload::ToolOutput {
            tool_id,
            output: None,
        });
    }

    if obj.contains_key("stdout") || obj.contains_key("stderr") {
        let command = tool
            .filter(|t| t.name == "Bash")
            .map(|t| str_of(t.input.get("command")))
            .unwrap_or_default();
        return Some(EventPayload::BashResult {
            tool_id,
            command,
            stdout: str_of(obj.get("stdout")),
            stderr: str_of(obj.get("stderr")),
            exit_code: obj.get("exitCode").and_then(Value::as_i64).unwrap_or(0),
        });
    }

    let raw = obj
        .get("content")
        .filter(|v| truthy(v))
        .or_else(|| obj.get("result").filter(|v| truthy(v)));
    let output = match raw {
        Some(Value::String(s)) => unwrap_json_text(s),
        Some(other) => output_text(other),
        None => String::new(),
    };
    Some(EventPayload::ToolOutput {
        tool_id,
        output: Some(output),
    })
}

/// A JSON-encoded object string is unwrapped once to its `result`/`content`.
fn unwrap_json_text(text: &str) -> String {
    let Ok(Value::Object(parsed)) = serde_json::from_str::<Value>(text) else {
        return text.to_string();
    };
    parsed
        .get("result")
        .filter(|v| truthy(v))
        .or_else(|| parsed.get("content").filter(|v| truthy(v)))
        .map_or_else(|| text.to_string(), output_text)
}

fn output_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let texts: Option<Vec<&str>> = items
                .iter()
                .map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            texts.map_or_else(|| value.to_string(), |t| t.join("\n"))
        }
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(_) => true,
    }
}

fn str_of(value: Option<&Value>) -> String {
    value.and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Percentage of the context window in use, rounded to one decimal.
///
/// The window comes from the `modelUsage` entry of the session's model (or
/// the first entry). Usage is the last assistant message's input-side tokens,
/// falling back to that entry's totals for single-turn runs.
#[allow(clippy::cast_precision_loss)]
pub fn context_percent(
    model_usage: &[ModelUsage],
    model: Option<&str>,
    last_usage: Option<Usage>,
) -> f64 {
    let entry = model
        .and_then(|m| model_usage.iter().find(|u| u.model == m))
        .or_else(|| model_usage.first());
    let window = entry
        .and_then(|u| u.context_window)
        .filter(|w| *w > 0)
        .unwrap_or(DEFAULT_CONTEXT_WINDOW);

    let used = match (last_usage, entry) {
        (Some(usage), _) => usage.context_tokens(),
        (None, Some(entry)) => entry.total_tokens(),
        (None, None) => return 0.0,
    };

    (used as f64 / window as f64 * 1000.0).round() / 10.0
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use genrelay_core::ndjson::parse_line;
    use serde_json::json;

    fn feed(bridge: &mut EventBridge, line: &str) -> Vec<EventPayload> {
        bridge.convert(parse_line(line).unwrap())
    }

    fn tool_use(bridge: &mut EventBridge, id: &str, name: &str, input: &Value) {
        let line = json!({
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "id": id, "name": name, "input": input}]}
        });
        feed(bridge, &line.to_string());
    }

    fn tool_result(bridge: &mut EventBridge, id: &str, result: &Value) -> Vec<EventPayload> {
        let line = json!({
            "type": "user",
            "message": {"content": [{"type": "tool_result", "tool_use_id": id, "content": "x"}]},
            "tool_use_result": result
        });
        feed(bridge, &line.to_string())
    }

    #[test]
    fn only_first_init_is_emitted() {
        let mut bridge = EventBridge::new();
        let init = r#"{"type":"system","subtype":"init","session_id":"s1","model":"claude-sonnet","cwd":"/tmp"}"#;
        assert_eq!(
            feed(&mut bridge, init),
            vec![EventPayload::Init {
                session_id: "s1".to_string()
            }]
        );
        assert!(feed(&mut bridge, init).is_empty());
    }

    #[test]
    fn assistant_text_and_tool_use() {
        let mut bridge = EventBridge::new();
        let events = feed(
            &mut bridge,
            r#"{"type":"assistant","message":{"content":[
                {"type":"text","text":"Let me look."},
                {"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"a.rs"}}
            ]}}"#,
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "text");
        assert!(matches!(&events[1], EventPayload::ToolUse { id, name, .. } if id == "t1" && name == "Read"));
        assert_eq!(bridge.final_text(), "Let me look.");
    }

    #[test]
    fn edit_result_with_patch() {
        let mut bridge = EventBridge::new();
        tool_use(&mut bridge, "t1", "Edit", &json!({"file_path": "a.rs"}));
        let events = tool_result(
            &mut bridge,
            "t1",
            &json!({
                "filePath": "a.rs",
                "structuredPatch": [{"oldStart": 1, "oldLines": 1, "newStart": 1, "newLines": 1, "lines": ["-a", "+b"]}]
            }),
        );
        let [EventPayload::EditResult { tool_id, file_path, patch }] = events.as_slice() else {
            panic!("expected edit_result, got {events:?}");
        };
        assert_eq!(tool_id, "t1");
        assert_eq!(file_path, "a.rs");
        assert_eq!(patch[0].lines, vec!["-a", "+b"]);
    }

    #[test]
    fn write_with_patch_is_file_created() {
        let mut bridge = EventBridge::new();
        tool_use(&mut bridge, "t1", "Write", &json!({"file_path": "new.rs"}));
        let events = tool_result(
            &mut bridge,
            "t1",
            &json!({"filePath": "new.rs", "structuredPatch": []}),
        );
        assert_eq!(
            events,
            vec![EventPayload::ToolOutput {
                tool_id: "t1".to_string(),
                output: Some("File created".to_string())
            }]
        );
    }

    #[test]
    fn read_result_has_no_output() {
        let mut bridge = EventBridge::new();
        tool_use(&mut bridge, "t1", "Read", &json!({"file_path": "a.rs"}));
        let events = tool_result(
            &mut bridge,
            "t1",
            &json!({"type": "text", "file": {"filePath": "a.rs", "content": "fn main() {}"}}),
        );
        assert_eq!(
            events,
            vec![EventPayload::ToolOutput {
                tool_id: "t1".to_string(),
                output: None
            }]
        );
    }

    #[test]
    fn bash_result_takes_command_from_input() {
        let mut bridge = EventBridge::new();
        tool_use(&mut bridge, "t1", "Bash", &json!({"command": "ls -la"}));
        let events = tool_result(
            &mut bridge,
            "t1",
            &json!({"stdout": "a\nb\n", "stderr": "", "interrupted": false}),
        );
        assert_eq!(
            events,
            vec![EventPayload::BashResult {
                tool_id: "t1".to_string(),
                command: "ls -la".to_string(),
                stdout: "a\nb\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
            }]
        );
    }

    #[test]
    fn results_match_by_id_before_fifo() {
        let mut bridge = EventBridge::new();
        tool_use(&mut bridge, "t1", "Bash", &json!({"command": "one"}));
        tool_use(&mut bridge, "t2", "Bash", &json!({"command": "two"}));
        let events = tool_result(&mut bridge, "t2", &json!({"stdout": "2"}));
        assert!(matches!(&events[0], EventPayload::BashResult { command, .. } if command == "two"));

        let events = tool_result(&mut bridge, "unknown", &json!({"stdout": "1"}));
        assert!(matches!(&events[0], EventPayload::BashResult { command, tool_id, .. } if command == "one" && tool_id == "t1"));
    }

    #[test]
    fn mcp_result_json_string_is_unwrapped() {
        let mut bridge = EventBridge::new();
        tool_use(&mut bridge, "t1", "mcp__search__web", &json!({"q": "rust"}));
        let events = tool_result(
            &mut bridge,
            "t1",
            &json!({"content": r#"{"result": "3 hits"}"#}),
        );
        assert_eq!(
            events,
            vec![EventPayload::ToolOutput {
                tool_id: "t1".to_string(),
                output: Some("3 hits".to_string())
            }]
        );
    }

    #[test]
    fn string_tool_result_is_output() {
        let mut bridge = EventBridge::new();
        tool_use(&mut bridge, "t1", "Task", &json!({}));
        let events = tool_result(&mut bridge, "t1", &json!("Error: denied"));
        assert_eq!(
            events,
            vec![EventPayload::ToolOutput {
                tool_id: "t1".to_string(),
                output: Some("Error: denied".to_string())
            }]
        );
    }

    #[test]
    fn tool_result_block_without_structured_result() {
        let mut bridge = EventBridge::new();
        tool_use(&mut bridge, "t1", "Glob", &json!({}));
        let events = feed(
            &mut bridge,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"a.rs"}]}}"#,
        );
        assert_eq!(
            events,
            vec![EventPayload::ToolOutput {
                tool_id: "t1".to_string(),
                output: Some("a.rs".to_string())
            }]
        );
    }

    #[test]
    fn streamed_deltas_suppress_repeated_text_block() {
        let mut bridge = EventBridge::new();
        let delta = |t: &str| {
            json!({
                "type": "stream_event",
                "event": {"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": t}}
            })
            .to_string()
        };
        let mut texts = Vec::new();
        for chunk in ["Hel", "lo"] {
            texts.extend(feed(&mut bridge, &delta(chunk)));
        }
        texts.extend(feed(
            &mut bridge,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"}]}}"#,
        ));
        let joined: String = texts
            .iter()
            .map(|e| match e {
                EventPayload::Text { text } => text.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(joined, "Hello");
        assert_eq!(bridge.final_text(), "Hello");

        let events = feed(
            &mut bridge,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Next"}]}}"#,
        );
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn result_uses_last_assistant_usage() {
        let mut bridge = EventBridge::new();
        feed(
            &mut bridge,
            r#"{"type":"system","subtype":"init","session_id":"s","model":"claude-sonnet","cwd":"/"}"#,
        );
        feed(
            &mut bridge,
            r#"{"type":"assistant","message":{"content":[],"usage":{"input_tokens":1000,"cache_read_input_tokens":9000,"output_tokens":50}}}"#,
        );
        let events = feed(
            &mut bridge,
            r#"{"type":"result","subtype":"success","session_id":"s","result":"ok","duration_ms":1200,"total_cost_usd":0.02,
                "usage":{"input_tokens":5,"output_tokens":7},
                "modelUsage":{"claude-haiku":{"inputTokens":1,"contextWindow":100000},"claude-sonnet":{"inputTokens":50000,"contextWindow":200000}}}"#,
        );
        let [EventPayload::Result { context_percent, text, input_tokens, output_tokens, .. }] =
            events.as_slice()
        else {
            panic!("expected result, got {events:?}");
        };
        assert!((context_percent - 5.0).abs() < f64::EPSILON);
        assert_eq!(text, "ok");
        assert_eq!((*input_tokens, *output_tokens), (5, 7));
        let summary = bridge.result().unwrap();
        assert!(summary.error.is_none());
        assert_eq!(bridge.final_text(), "ok");
    }

    #[test]
    fn context_percent_falls_back_to_model_usage() {
        let usage = vec![ModelUsage {
            model: "m".to_string(),
            input_tokens: 1500,
            output_tokens: 500,
            context_window: None,
            ..ModelUsage::default()
        }];
        assert!((context_percent(&usage, None, None) - 1.0).abs() < f64::EPSILON);
        assert!(context_percent(&[], None, None).abs() < f64::EPSILON);
    }

    #[test]
    fn error_result_is_reported() {
        let mut bridge = EventBridge::new();
        feed(
            &mut bridge,
            r#"{"type":"result","subtype":"error_during_execution","session_id":"s","is_error":true,"errors":["boom"]}"#,
        );
        assert_eq!(bridge.result().unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn spurious_error_flag_is_ignored() {
        let mut bridge = EventBridge::new();
        feed(
            &mut bridge,
            r#"{"type":"result","subtype":"success","session_id":"s","is_error":true,"result":"fine"}"#,
        );
        assert!(bridge.result().unwrap().error.is_none());
    }
}
