//! NDJSON parser for the Claude Code protocol.
//!
//! Implements tolerant reader pattern: unknown fields ignored, unknown types
//! surfaced as [`Message::Unknown`].

use serde_json::Value;

use super::types::{
    AssistantMessage, ContentBlock, Delta, Message, ModelUsage, ResultSubtype, SessionResult,
    StopReason, StreamEvent, StreamEventType, SystemInit, ToolResult, Usage, UserMessage,
};
use crate::error::{Error, Result};

/// Parse a single NDJSON line from Claude's stdout.
pub fn parse_line(line: &str) -> Result<Message> {
    let raw: Value = serde_json::from_str(line)?;
    parse_value(&raw)
}

/// Parse a JSON value into a canonical message.
pub fn parse_value(raw: &Value) -> Result<Message> {
    let msg_type = raw
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::NdjsonParse("Missing 'type' field".into()))?;

    match msg_type {
        "system" => Ok(parse_system(raw)),
        "assistant" => Ok(parse_assistant(raw)),
        "user" => Ok(parse_user(raw)),
        "stream_event" => Ok(parse_stream_event(raw)),
        "result" => Ok(parse_result(raw)),
        _ => Ok(Message::Unknown {
            msg_type: msg_type.to_string(),
            payload: raw.clone(),
        }),
    }
}

fn str_field(raw: &Value, key: &str) -> String {
    raw.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn parse_system(raw: &Value) -> Message {
    Message::SystemInit(SystemInit {
        session_id: str_field(raw, "session_id"),
        model: str_field(raw, "model"),
        cwd: raw
            .get("cwd")
            .and_then(|v| v.as_str())
            .map(std::path::PathBuf::from)
            .unwrap_or_default(),
        subtype: raw.get("subtype").and_then(|v| v.as_str()).map(String::from),
    })
}

fn parse_assistant(raw: &Value) -> Message {
    let msg = raw.get("message").unwrap_or(raw);

    Message::Assistant(AssistantMessage {
        content: parse_content_blocks(msg.get("content")),
        stop_reason: parse_stop_reason(msg.get("stop_reason")),
        usage: msg
            .get("usage")
            .filter(|v| v.is_object())
            .map(|v| parse_usage(Some(v))),
    })
}

fn parse_content_blocks(content: Option<&Value>) -> Vec<ContentBlock> {
    let Some(arr) = content.and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    arr.iter()
        .filter_map(|block| {
            let block_type = block.get("type")?.as_str()?;
            match block_type {
                "text" => {
                    let text = block.get("text")?.as_str()?.to_string();
                    Some(ContentBlock::Text { text })
                }
                "tool_use" => {
                    let id = block.get("id")?.as_str()?.to_string();
                    let name = block.get("name")?.as_str()?.to_string();
                    let input = block
                        .get("input")
                        .cloned()
                        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                    Some(ContentBlock::ToolUse { id, name, input })
                }
                _ => None,
            }
        })
        .collect()
}

fn parse_stop_reason(val: Option<&Value>) -> StopReason {
    match val.and_then(|v| v.as_str()) {
        Some("end_turn") | None => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some(other) => StopReason::Unknown(other.to_string()),
    }
}

pub(crate) fn parse_usage(val: Option<&Value>) -> Usage {
    val.and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// Tool result content is either a string or a list of text blocks.
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn parse_user(raw: &Value) -> Message {
    let msg = raw.get("message").unwrap_or(raw);
    let content = msg
        .get("content")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|block| {
                    if block.get("type")?.as_str()? != "tool_result" {
                        return None;
                    }
                    Some(ToolResult {
                        tool_use_id: block.get("tool_use_id")?.as_str()?.to_string(),
                        content: tool_result_text(block.get("content")),
                        is_error: block
                            .get("is_error")
                            .and_then(serde_json::Value::as_bool)
                            .unwrap_or(false),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let tool_use_result = raw
        .get("tool_use_result")
        .filter(|v| !v.is_null())
        .cloned();

    Message::User(UserMessage {
        content,
        tool_use_result,
    })
}

#[allow(clippy::cast_possible_truncation)]
fn block_index(event: &Value) -> u32 {
    event.get("index").and_then(serde_json::Value::as_u64).unwrap_or(0) as u32
}

fn parse_stream_event(raw: &Value) -> Message {
    let event = raw.get("event").unwrap_or(raw);
    let event_type = event.get("type").and_then(|v| v.as_str()).unwrap_or("");

    let stream_type = match event_type {
        "content_block_start" => StreamEventType::ContentBlockStart {
            index: block_index(event),
            block_type: event
                .get("content_block")
                .and_then(|b| b.get("type"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        },
        "content_block_delta" => {
            let delta = event.get("delta").cloned().unwrap_or(Value::Null);
            let delta = match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                "text_delta" => Delta::Text(str_field(&delta, "text")),
                "input_json_delta" => Delta::InputJson(str_field(&delta, "partial_json")),
                _ => Delta::Unknown(delta),
            };
            StreamEventType::ContentBlockDelta {
                index: block_index(event),
                delta,
            }
        }
        "content_block_stop" => StreamEventType::ContentBlockStop {
            index: block_index(event),
        },
        "message_start" => StreamEventType::MessageStart,
        "message_delta" => StreamEventType::MessageDelta {
            stop_reason: event
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|v| v.as_str())
                .map(String::from),
        },
        "message_stop" => StreamEventType::MessageStop,
        _ => StreamEventType::Unknown(event.clone()),
    };

    Message::StreamEvent(StreamEvent {
        event_type: stream_type,
    })
}

fn parse_model_usage(val: Option<&Value>) -> Vec<ModelUsage> {
    let Some(map) = val.and_then(|v| v.as_object()) else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(model, entry)| {
            let mut usage: ModelUsage = serde_json::from_value(entry.clone()).ok()?;
            usage.model.clone_from(model);
            Some(usage)
        })
        .collect()
}

fn parse_result(raw: &Value) -> Message {
    let subtype = match raw.get("subtype").and_then(|v| v.as_str()) {
        Some("success") | None => ResultSubtype::Success,
        Some(s) if s.starts_with("error") => ResultSubtype::Error,
        Some(other) => ResultSubtype::Unknown(other.to_string()),
    };

    let errors = raw
        .get("errors")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|e| e.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    Message::Result(SessionResult {
        subtype,
        session_id: str_field(raw, "session_id"),
        duration_ms: raw
            .get("duration_ms")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0),
        cost_usd: raw.get("total_cost_usd").and_then(serde_json::Value::as_f64),
        usage: parse_usage(raw.get("usage")),
        result: raw.get("result").and_then(|v| v.as_str()).map(String::from),
        is_error: raw
            .get("is_error")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
        errors,
        model_usage: parse_model_usage(raw.get("modelUsage")),
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_system_init() {
        let json = r#"{"type":"system","subtype":"init","session_id":"abc123","model":"claude-sonnet-4-20250514","cwd":"/home/user","tools":[]}"#;
        let Message::SystemInit(init) = parse_line(json).unwrap() else {
            panic!("expected system init");
        };
        assert_eq!(init.session_id, "abc123");
        assert_eq!(init.subtype.as_deref(), Some("init"));
    }

    #[test]
    fn tolerant_reader_ignores_unknown_fields() {
        let json = r#"{"type":"system","session_id":"x","model":"m","cwd":"/","tools":[],"unknown":"ignored"}"#;
        assert!(parse_line(json).is_ok());
    }

    #[test]
    fn unknown_type_returns_unknown_message() {
        let json = r#"{"type":"future_type","data":"something"}"#;
        let msg = parse_line(json).unwrap();
        assert!(matches!(msg, Message::Unknown { ref msg_type, .. } if msg_type == "future_type"));
    }

    #[test]
    fn missing_type_is_an_error() {
        assert!(matches!(
            parse_line(r#"{"data":1}"#),
            Err(Error::NdjsonParse(_))
        ));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(parse_line(r#"{"type":"sys"#), Err(Error::Json(_))));
    }

    #[test]
    fn assistant_usage_is_optional() {
        let with = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}],"usage":{"input_tokens":5,"cache_read_input_tokens":7}}}"#;
        let Message::Assistant(msg) = parse_line(with).unwrap() else {
            panic!("expected assistant");
        };
        assert_eq!(msg.usage.unwrap().context_tokens(), 12);

        let without = r#"{"type":"assistant","message":{"content":[]}}"#;
        let Message::Assistant(msg) = parse_line(without).unwrap() else {
            panic!("expected assistant");
        };
        assert!(msg.usage.is_none());
    }

    #[test]
    fn user_record_keeps_tool_use_result() {
        let json = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":[{"type":"text","text":"ok"}]}]},"tool_use_result":{"stdout":"ok","stderr":""}}"#;
        let Message::User(user) = parse_line(json).unwrap() else {
            panic!("expected user");
        };
        assert_eq!(user.content[0].tool_use_id, "t1");
        assert_eq!(user.content[0].content, "ok");
        assert_eq!(user.tool_use_result.unwrap()["stdout"], "ok");
    }

    #[test]
    fn result_record_with_model_usage() {
        let json = r#"{"type":"result","subtype":"success","session_id":"s","duration_ms":1200,"total_cost_usd":0.02,"result":"Hello!","is_error":false,"usage":{"input_tokens":3,"output_tokens":9},"modelUsage":{"claude-sonnet-4":{"inputTokens":3,"outputTokens":9,"cacheReadInputTokens":100,"contextWindow":200000}}}"#;
        let Message::Result(result) = parse_line(json).unwrap() else {
            panic!("expected result");
        };
        assert_eq!(result.result.as_deref(), Some("Hello!"));
        assert_eq!(result.duration_ms, 1200);
        assert_eq!(result.model_usage.len(), 1);
        assert_eq!(result.model_usage[0].model, "claude-sonnet-4");
        assert_eq!(result.model_usage[0].total_tokens(), 112);
        assert_eq!(result.model_usage[0].context_window, Some(200_000));
    }

    #[test]
    fn error_subtypes_map_to_error() {
        let json = r#"{"type":"result","subtype":"error_during_execution","is_error":true,"errors":["boom"]}"#;
        let Message::Result(result) = parse_line(json).unwrap() else {
            panic!("expected result");
        };
        assert_eq!(result.subtype, ResultSubtype::Error);
        assert_eq!(result.errors, vec!["boom".to_string()]);
    }

    #[test]
    fn text_delta_stream_event() {
        let json = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"He"}}}"#;
        let Message::StreamEvent(ev) = parse_line(json).unwrap() else {
            panic!("expected stream event");
        };
        assert_eq!(
            ev.event_type,
            StreamEventType::ContentBlockDelta {
                index: 0,
                delta: Delta::Text("He".to_string())
            }
        );
    }
}
