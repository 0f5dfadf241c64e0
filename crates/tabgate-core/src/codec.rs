//! Framing helpers.
//!
//! Socket frames are single JSON documents carried in WebSocket text messages.
//! Subprocess output is newline-delimited, so [`LineDecoder`] reassembles
//! complete lines from arbitrarily split read chunks.

use crate::error::GatewayResult;

/// Encode a serializable value into a JSON text frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> GatewayResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON text frame into a typed value.
pub fn frame_decode<T: serde::de::DeserializeOwned>(data: &str) -> GatewayResult<T> {
    Ok(serde_json::from_str(data)?)
}

/// Streaming line decoder: accumulates bytes and yields complete lines.
///
/// Lines are split on `\n`; a trailing `\r` is stripped. Bytes are only
/// converted to text once a full line is available, so multi-byte characters
/// split across chunks survive intact.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed a chunk and return every line it completes, in order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(data);
        let mut lines = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        lines
    }

    /// Return the unterminated remainder, if any, once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
    }
}
