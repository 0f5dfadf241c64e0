//! Decoder for the assistant's line-delimited JSON output.
//!
//! Each stdout line is an independent record. Lines that are not JSON are
//! passed through verbatim as output so nothing the assistant prints is lost.

use crate::messages::SessionEvent;
use serde::Deserialize;
use serde_json::Value;

/// Longest tool summary forwarded to clients, in characters.
pub const TOOL_SUMMARY_LIMIT: usize = 200;

/// Input keys consulted, in order, when summarising a tool call.
const SUMMARY_KEYS: &[&str] = &[
    "command",
    "file_path",
    "path",
    "pattern",
    "url",
    "query",
    "description",
];

/// One record of the assistant's stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamRecord {
    Init {
        session_id: Option<String>,
    },
    System {
        session_id: Option<String>,
    },
    Assistant {
        message: Option<AssistantMessage>,
    },
    User {},
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },
    Error {
        content: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

/// Summary of a `result` record, kept for logging only.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSummary {
    pub subtype: Option<String>,
    pub is_error: bool,
    pub duration_ms: Option<u64>,
    pub total_cost_usd: Option<f64>,
}

/// What a single line decodes to.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// The assistant announced its conversation id.
    SessionId(String),
    /// An event to forward to the client.
    Event(SessionEvent),
    /// End-of-turn metadata; never forwarded as output.
    Result(ResultSummary),
}

/// Decode one stdout line into zero or more items, preserving block order.
pub fn decode_line(line: &str) -> Vec<StreamItem> {
    if line.trim().is_empty() {
        return Vec::new();
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return vec![StreamItem::Event(SessionEvent::output(line))],
    };

    let record: StreamRecord = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(_) => return Vec::new(),
    };

    match record {
        StreamRecord::Init { session_id } | StreamRecord::System { session_id } => session_id
            .filter(|id| !id.is_empty())
            .map(StreamItem::SessionId)
            .into_iter()
            .collect(),
        StreamRecord::Assistant { message } => message
            .map(|m| m.content)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(StreamItem::Event(SessionEvent::output(text))),
                ContentBlock::ToolUse { name, input } => Some(StreamItem::Event(
                    SessionEvent::tool(summarize_tool_use(&name, &input)),
                )),
                ContentBlock::Other => None,
            })
            .collect(),
        StreamRecord::Result {
            subtype,
            is_error,
            duration_ms,
            total_cost_usd,
        } => vec![StreamItem::Result(ResultSummary {
            subtype,
            is_error,
            duration_ms,
            total_cost_usd,
        })],
        StreamRecord::Error { content } => content
            .map(|c| StreamItem::Event(SessionEvent::error(c)))
            .into_iter()
            .collect(),
        StreamRecord::User {} | StreamRecord::Unknown => Vec::new(),
    }
}

/// Render a tool call as `"<name>: <summary>"`.
pub fn summarize_tool_use(name: &str, input: &Value) -> String {
    let detail = SUMMARY_KEYS
        .iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .or_else(|| match input {
            Value::Null => None,
            Value::Object(map) if map.is_empty() => None,
            other => Some(other.to_string()),
        });

    match detail {
        Some(d) => format!("{name}: {}", truncate_chars(&d, TOOL_SUMMARY_LIMIT)),
        None => name.to_string(),
    }
}

fn truncate_chars(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::EventKind;
    use serde_json::json;

    fn events(items: Vec<StreamItem>) -> Vec<SessionEvent> {
        items
            .into_iter()
            .filter_map(|i| match i {
                StreamItem::Event(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn plain_text_passes_through() {
        let items = decode_line("plain text");
        assert_eq!(items, vec![StreamItem::Event(SessionEvent::output("plain text"))]);
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert!(decode_line("").is_empty());
        assert!(decode_line("   ").is_empty());
    }

    #[test]
    fn init_and_system_carry_session_id() {
        assert_eq!(
            decode_line(r#"{"type":"init","session_id":"a"}"#),
            vec![StreamItem::SessionId("a".into())]
        );
        assert_eq!(
            decode_line(r#"{"type":"system","subtype":"init","session_id":"b","tools":[]}"#),
            vec![StreamItem::SessionId("b".into())]
        );
        assert!(decode_line(r#"{"type":"system","subtype":"hook"}"#).is_empty());
    }

    #[test]
    fn assistant_blocks_keep_order() {
        let line = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "first"},
                {"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls -la"}},
                {"type": "text", "text": "second"}
            ]}
        })
        .to_string();
        let evs = events(decode_line(&line));
        assert_eq!(evs.len(), 3);
        assert_eq!(evs[0], SessionEvent::output("first"));
        assert_eq!(evs[1], SessionEvent::tool("Bash: ls -la"));
        assert_eq!(evs[2], SessionEvent::output("second"));
    }

    #[test]
    fn thinking_blocks_are_dropped() {
        let line = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "answer"}
            ]}
        })
        .to_string();
        assert_eq!(events(decode_line(&line)), vec![SessionEvent::output("answer")]);
    }

    #[test]
    fn result_never_produces_output() {
        let line = json!({
            "type": "result",
            "subtype": "success",
            "result": "the same text again",
            "duration_ms": 1200,
            "total_cost_usd": 0.01
        })
        .to_string();
        let items = decode_line(&line);
        assert_eq!(items.len(), 1);
        match &items[0] {
            StreamItem::Result(summary) => {
                assert_eq!(summary.subtype.as_deref(), Some("success"));
                assert_eq!(summary.duration_ms, Some(1200));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(events(items).is_empty());
    }

    #[test]
    fn error_record_with_content() {
        let evs = events(decode_line(r#"{"type":"error","content":"rate limited"}"#));
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].kind, EventKind::Error);
        assert_eq!(evs[0].content, "rate limited");
        assert!(decode_line(r#"{"type":"error"}"#).is_empty());
    }

    #[test]
    fn unknown_records_and_non_objects_are_ignored() {
        assert!(decode_line(r#"{"type":"stream_event","event":{}}"#).is_empty());
        assert!(decode_line(r#"{"type":"user","message":{"content":[]}}"#).is_empty());
        assert!(decode_line("42").is_empty());
    }

    #[test]
    fn tool_summary_falls_back_to_json() {
        assert_eq!(
            summarize_tool_use("Read", &json!({"file_path": "src/main.rs"})),
            "Read: src/main.rs"
        );
        assert_eq!(
            summarize_tool_use("TodoWrite", &json!({"todos": [1]})),
            r#"TodoWrite: {"todos":[1]}"#
        );
        assert_eq!(summarize_tool_use("Noop", &json!({})), "Noop");
    }

    #[test]
    fn tool_summary_is_truncated() {
        let long = "x".repeat(500);
        let summary = summarize_tool_use("Bash", &json!({ "command": long }));
        assert_eq!(summary.len(), "Bash: ".len() + TOOL_SUMMARY_LIMIT + 3);
        assert!(summary.ends_with("..."));
    }
}
