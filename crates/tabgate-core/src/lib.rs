//! tabgate-core: shared protocol library for the tab gateway.
//!
//! Provides the socket control/event envelopes, JSON and line framing, the
//! decoder for the assistant's streaming output, and the common error type.

pub mod codec;
pub mod error;
pub mod messages;
pub mod stream;

// Re-export commonly used items at crate root.
pub use codec::{frame_decode, frame_encode, LineDecoder};
pub use error::{GatewayError, GatewayResult};
pub use messages::{
    Attachment, BufferedMessage, ControlMessage, EventEnvelope, EventKind, ReplyMessage,
    ServerMessage, SessionEvent, TranscriptEntry, TranscriptRecord, DEFAULT_TAB_ID,
};
pub use stream::{decode_line, StreamItem};
