//! Frame Protocol
//!
//! Line-oriented event-stream framing shared by both directions of the
//! pipeline: the upstream model's incremental output and the frames the
//! pipeline emits to its own clients.
//!
//! # Frame Format
//!
//! ```text
//! data: <payload>\n
//! \n
//! ```
//!
//! The payload is JSON, except for the literal terminal marker `[DONE]`.
//! Lines that do not carry a `data:` field (comments, `event:`, keepalives)
//! are skipped.
//!
//! # Chunk boundaries
//!
//! Reads may split a frame anywhere, including inside a multi-byte UTF-8
//! character. The decoder keeps the unterminated tail as raw bytes and only
//! decodes complete lines, so the decoded sequence does not depend on how
//! the byte stream was chunked.

use serde_json::{json, Value};

use crate::messages::ClientFrame;

/// Maximum size of a single line (1 MB)
///
/// Longer lines are discarded to bound memory.
pub const MAX_LINE_SIZE: usize = 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Terminal payload marker
pub const DONE_MARKER: &str = "[DONE]";

/// Field prefix carrying a payload
const DATA_PREFIX: &str = "data:";

// ============================================================================
// Line Reader
// ============================================================================

/// Reassembles `data:` payloads from arbitrarily chunked bytes
///
/// Shared by the upstream and client decoders.
#[derive(Debug)]
pub struct DataLineReader {
    buffer: Vec<u8>,
    /// Inside an oversized line; bytes are skipped up to the next newline
    discarding: bool,
}

impl Default for DataLineReader {
    fn default() -> Self {
        Self::new()
    }
}

impl DataLineReader {
    /// Create a reader with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            discarding: false,
        }
    }

    /// Append bytes and return the payloads of every completed line
    ///
    /// A line longer than [`MAX_LINE_SIZE`] is dropped whole, whether it
    /// arrives in one read or many.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut payloads = Vec::new();
        let mut rest = data;

        while let Some(offset) = rest.iter().position(|&b| b == b'\n') {
            let head = &rest[..offset];
            if self.discarding {
                self.discarding = false;
            } else if self.buffer.len() + head.len() > MAX_LINE_SIZE {
                tracing::warn!(
                    bytes = self.buffer.len() + head.len(),
                    "Discarding oversized line"
                );
            } else {
                self.buffer.extend_from_slice(head);
                if let Some(payload) = parse_line(&self.buffer) {
                    payloads.push(payload);
                }
            }
            self.buffer.clear();
            rest = &rest[offset + 1..];
        }

        if !self.discarding {
            if self.buffer.len() + rest.len() > MAX_LINE_SIZE {
                tracing::warn!(
                    bytes = self.buffer.len() + rest.len(),
                    "Discarding oversized unterminated line"
                );
                self.buffer.clear();
                self.discarding = true;
            } else {
                self.buffer.extend_from_slice(rest);
            }
        }

        payloads
    }

    /// Flush the unterminated tail as a final line
    pub fn finish(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.buffer);
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        parse_line(&tail)
    }

    /// Bytes carried over to the next push
    #[must_use]
    pub fn remainder(&self) -> &[u8] {
        &self.buffer
    }
}

/// Extract the payload of one complete line, if it is a data line
fn parse_line(raw: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    let payload = line.strip_prefix(DATA_PREFIX)?.trim();
    Some(payload.to_string())
}

// ============================================================================
// Upstream Frames
// ============================================================================

/// One decoded unit of the upstream incremental protocol
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpstreamFrame {
    /// Incremental answer text
    Delta(String),
    /// The upstream finished
    Done,
    /// The upstream reported an error inside the stream
    Error(String),
}

impl UpstreamFrame {
    /// Decode one payload
    ///
    /// Returns `None` for well-formed payloads that carry no text (role-only
    /// deltas, usage records). Payloads that are not valid JSON are passed
    /// through verbatim as text.
    #[must_use]
    pub fn from_payload(payload: &str) -> Option<Self> {
        if payload == DONE_MARKER {
            return Some(Self::Done);
        }
        if payload.is_empty() {
            return None;
        }

        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(error = %e, "Malformed upstream payload, passing through");
                return Some(Self::Delta(payload.to_string()));
            }
        };

        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| error.to_string());
            return Some(Self::Error(message));
        }

        let text: String = value
            .get("choices")
            .and_then(Value::as_array)
            .map(|choices| {
                choices
                    .iter()
                    .filter_map(|c| c.pointer("/delta/content").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();

        if text.is_empty() {
            None
        } else {
            Some(Self::Delta(text))
        }
    }

    /// Encode in the upstream wire format
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Delta(text) => frame_line(
                &json!({ "choices": [{ "index": 0, "delta": { "content": text } }] }).to_string(),
            ),
            Self::Done => frame_line(DONE_MARKER),
            Self::Error(message) => frame_line(&json!({ "error": { "message": message } }).to_string()),
        }
    }
}

/// Decoder state machine for the upstream stream
#[derive(Debug, Default)]
pub struct FrameDecoder {
    lines: DataLineReader,
}

impl FrameDecoder {
    /// Create a new decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the frames it completed, in order
    pub fn push(&mut self, data: &[u8]) -> Vec<UpstreamFrame> {
        self.lines
            .push(data)
            .iter()
            .filter_map(|payload| UpstreamFrame::from_payload(payload))
            .collect()
    }

    /// Flush a trailing line that arrived without a newline
    pub fn finish(&mut self) -> Vec<UpstreamFrame> {
        self.lines
            .finish()
            .and_then(|payload| UpstreamFrame::from_payload(&payload))
            .into_iter()
            .collect()
    }

    /// Bytes carried over to the next push
    #[must_use]
    pub fn remainder(&self) -> &[u8] {
        self.lines.remainder()
    }
}

/// Stateless form of the decoder: `(carry, chunk) -> (frames, carry')`
#[must_use]
pub fn decode(carry: &[u8], chunk: &[u8]) -> (Vec<UpstreamFrame>, Vec<u8>) {
    let mut decoder = FrameDecoder::new();
    let mut frames = decoder.push(carry);
    frames.extend(decoder.push(chunk));
    (frames, decoder.remainder().to_vec())
}

// ============================================================================
// Client Frames
// ============================================================================

fn frame_line(payload: &str) -> String {
    format!("{DATA_PREFIX} {payload}\n\n")
}

/// Encode a client frame in the outbound protocol
#[must_use]
pub fn encode(frame: &ClientFrame) -> String {
    let payload = match frame {
        ClientFrame::Init => json!({ "type": "init" }),
        ClientFrame::Content { text } => json!({ "content": text }),
        ClientFrame::ModerationNotice { message } => {
            json!({ "type": "moderation_notice", "message": message })
        }
        ClientFrame::Error { message } => json!({ "type": "error", "error": message }),
        ClientFrame::Done => return frame_line(DONE_MARKER),
    };
    frame_line(&payload.to_string())
}

/// Encoder for streaming frame output
#[derive(Debug, Default)]
pub struct FrameEncoder;

impl FrameEncoder {
    /// Create a new encoder
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Encode a frame to bytes
    #[must_use]
    pub fn encode(&self, frame: &ClientFrame) -> Vec<u8> {
        encode(frame).into_bytes()
    }
}

/// Decode one outbound payload back into a client frame
#[must_use]
pub fn client_frame_from_payload(payload: &str) -> Option<ClientFrame> {
    if payload == DONE_MARKER {
        return Some(ClientFrame::Done);
    }
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return (!payload.is_empty()).then(|| ClientFrame::content(payload));
    };

    let field = |name: &str| {
        value
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    match value.get("type").and_then(Value::as_str) {
        Some("init") => Some(ClientFrame::Init),
        Some("moderation_notice") => Some(ClientFrame::ModerationNotice {
            message: field("message"),
        }),
        Some("error") => Some(ClientFrame::Error {
            message: field("error"),
        }),
        Some(_) => None,
        None => value
            .get("content")
            .and_then(Value::as_str)
            .map(ClientFrame::content),
    }
}

/// Decoder for the outbound protocol, used by clients of the pipeline
#[derive(Debug, Default)]
pub struct ClientFrameDecoder {
    lines: DataLineReader,
}

impl ClientFrameDecoder {
    /// Create a new decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the frames it completed, in order
    pub fn push(&mut self, data: &[u8]) -> Vec<ClientFrame> {
        self.lines
            .push(data)
            .iter()
            .filter_map(|payload| client_frame_from_payload(payload))
            .collect()
    }

    /// Flush a trailing line that arrived without a newline
    pub fn finish(&mut self) -> Vec<ClientFrame> {
        self.lines
            .finish()
            .and_then(|payload| client_frame_from_payload(&payload))
            .into_iter()
            .collect()
    }
}

/// Decode a complete outbound byte stream
#[must_use]
pub fn decode_client_frames(bytes: &[u8]) -> Vec<ClientFrame> {
    let mut decoder = ClientFrameDecoder::new();
    let mut frames = decoder.push(bytes);
    frames.extend(decoder.finish());
    frames
}
