//! Socket protocol: inbound control envelopes and outbound event envelopes.
//!
//! Every frame is a JSON object discriminated by its `type` field. Field names
//! are camelCase on the wire to match the browser client.

use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tab id used when a client omits `tabId` (single-tab clients).
pub const DEFAULT_TAB_ID: &str = "default";

/// A file or image sent alongside a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// MIME type, e.g. `image/png` or `text/plain`.
    pub media_type: String,
    /// Base64 payload for images, raw text otherwise.
    pub data: String,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.media_type.starts_with("image/")
    }
}

/// Inbound control messages, validated before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Run a prompt in the tab's session.
    Command {
        tab_id: Option<String>,
        #[serde(default)]
        content: String,
        working_directory: Option<String>,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    /// Hard-kill the tab's running command.
    Abort { tab_id: Option<String> },
    /// Abort and forget the conversation id.
    Reset { tab_id: Option<String> },
    /// Bind the tab to an existing conversation, reattaching if it is live.
    Resume {
        tab_id: Option<String>,
        session_id: Option<String>,
        working_directory: Option<String>,
    },
    /// Tear down the tab's binding.
    TabClose { tab_id: Option<String> },
    /// Query buffered events after a sequence id; no id means full history.
    Replay {
        tab_id: Option<String>,
        session_id: Option<String>,
        after_sequence_id: Option<u64>,
    },
    /// Query the durable transcript.
    History {
        tab_id: Option<String>,
        session_id: Option<String>,
    },
}

impl ControlMessage {
    /// Wire names of every accepted `type`.
    pub const TYPES: &'static [&'static str] = &[
        "command",
        "abort",
        "reset",
        "resume",
        "tab-close",
        "replay",
        "history",
    ];

    /// Decode one inbound frame.
    ///
    /// An unrecognised `type` yields [`GatewayError::UnknownMessageType`] so the
    /// router can echo the offending name back to the client.
    pub fn decode(frame: &str) -> GatewayResult<Self> {
        let value: Value = serde_json::from_str(frame)?;
        let kind = match value.get("type") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => return Err(GatewayError::UnknownMessageType(other.to_string())),
            None => return Err(GatewayError::InvalidMessage("missing type".into())),
        };
        if !Self::TYPES.contains(&kind.as_str()) {
            return Err(GatewayError::UnknownMessageType(kind));
        }
        serde_json::from_value(value).map_err(|e| GatewayError::InvalidMessage(e.to_string()))
    }

    /// The tab this message targets, falling back to [`DEFAULT_TAB_ID`].
    pub fn tab_id(&self) -> &str {
        let tab = match self {
            Self::Command { tab_id, .. }
            | Self::Abort { tab_id }
            | Self::Reset { tab_id }
            | Self::Resume { tab_id, .. }
            | Self::TabClose { tab_id }
            | Self::Replay { tab_id, .. }
            | Self::History { tab_id, .. } => tab_id,
        };
        tab.as_deref().filter(|t| !t.is_empty()).unwrap_or(DEFAULT_TAB_ID)
    }
}

/// Kinds of events a session emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Output,
    Error,
    Status,
    Complete,
    Tool,
    Session,
}

/// One event on a session's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub kind: EventKind,
    pub content: String,
}

impl SessionEvent {
    pub fn new(kind: EventKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    pub fn output(content: impl Into<String>) -> Self {
        Self::new(EventKind::Output, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(EventKind::Error, content)
    }

    pub fn status(content: impl Into<String>) -> Self {
        Self::new(EventKind::Status, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(EventKind::Tool, content)
    }

    pub fn session(id: impl Into<String>) -> Self {
        Self::new(EventKind::Session, id)
    }

    pub fn complete() -> Self {
        Self::new(EventKind::Complete, "")
    }
}

/// Outbound event frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<u64>,
}

impl EventEnvelope {
    pub fn new(event: SessionEvent, tab_id: Option<String>, sequence_id: Option<u64>) -> Self {
        Self {
            kind: event.kind,
            content: event.content,
            tab_id,
            sequence_id,
        }
    }
}

/// An event retained for replay, stamped with its global sequence id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedMessage {
    pub sequence_id: u64,
    pub kind: EventKind,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// What a transcript line records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TranscriptRecord {
    /// A prompt submitted by the user.
    Prompt { text: String, attachments: usize },
    /// An event emitted by the assistant session.
    Event {
        sequence_id: u64,
        kind: EventKind,
        content: String,
    },
}

/// A single timestamped line of the durable transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub record: TranscriptRecord,
}

/// Replies to reconnection queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ReplyMessage {
    MissedMessages {
        session_id: String,
        messages: Vec<BufferedMessage>,
    },
    History {
        session_id: String,
        entries: Vec<TranscriptEntry>,
    },
}

/// Anything the gateway writes to a socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(EventEnvelope),
    Reply(ReplyMessage),
}

impl From<EventEnvelope> for ServerMessage {
    fn from(e: EventEnvelope) -> Self {
        ServerMessage::Event(e)
    }
}

impl From<ReplyMessage> for ServerMessage {
    fn from(r: ReplyMessage) -> Self {
        ServerMessage::Reply(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_defaults_tab_id() {
        let msg = ControlMessage::decode(r#"{"type":"command","content":"hi"}"#).unwrap();
        assert_eq!(msg.tab_id(), DEFAULT_TAB_ID);
        match msg {
            ControlMessage::Command {
                content,
                attachments,
                working_directory,
                ..
            } => {
                assert_eq!(content, "hi");
                assert!(attachments.is_empty());
                assert!(working_directory.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn camel_case_fields_decode() {
        let frame = json!({
            "type": "resume",
            "tabId": "tab-2",
            "sessionId": "abc",
            "workingDirectory": "/tmp"
        })
        .to_string();
        let msg = ControlMessage::decode(&frame).unwrap();
        assert_eq!(msg.tab_id(), "tab-2");
        assert_eq!(
            msg,
            ControlMessage::Resume {
                tab_id: Some("tab-2".into()),
                session_id: Some("abc".into()),
                working_directory: Some("/tmp".into()),
            }
        );
    }

    #[test]
    fn tab_close_uses_kebab_case() {
        let msg = ControlMessage::decode(r#"{"type":"tab-close","tabId":"t"}"#).unwrap();
        assert_eq!(msg, ControlMessage::TabClose { tab_id: Some("t".into()) });
    }

    #[test]
    fn unknown_type_is_reported_by_name() {
        let err = ControlMessage::decode(r#"{"type":"launch"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Unknown message type: launch");
    }

    #[test]
    fn missing_type_is_invalid() {
        let err = ControlMessage::decode(r#"{"content":"x"}"#).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidMessage(_)));
    }

    #[test]
    fn malformed_frame_is_codec_error() {
        let err = ControlMessage::decode("{nope").unwrap_err();
        assert!(matches!(err, GatewayError::Codec(_)));
    }

    #[test]
    fn command_with_attachments() {
        let frame = json!({
            "type": "command",
            "content": "describe",
            "attachments": [{"name": "a.png", "mediaType": "image/png", "data": "AAAA"}]
        })
        .to_string();
        match ControlMessage::decode(&frame).unwrap() {
            ControlMessage::Command { attachments, .. } => {
                assert_eq!(attachments.len(), 1);
                assert!(attachments[0].is_image());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn event_envelope_omits_absent_tags() {
        let env = EventEnvelope::new(SessionEvent::status("processing"), None, None);
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value, json!({"type": "status", "content": "processing"}));

        let env = EventEnvelope::new(SessionEvent::output("x"), Some("t1".into()), Some(7));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({"type": "output", "content": "x", "tabId": "t1", "sequenceId": 7})
        );
    }

    #[test]
    fn replies_are_tagged() {
        let reply = ServerMessage::from(ReplyMessage::MissedMessages {
            session_id: "s".into(),
            messages: vec![BufferedMessage {
                sequence_id: 3,
                kind: EventKind::Tool,
                content: "Bash: ls".into(),
                timestamp: 10,
            }],
        });
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["type"], "missed-messages");
        assert_eq!(value["sessionId"], "s");
        assert_eq!(value["messages"][0]["sequenceId"], 3);
        assert_eq!(value["messages"][0]["kind"], "tool");
    }
}
