//! Incremental frame extraction and payload decoding.

use serde_json::Value;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

use super::codec::FrameCodec;

/// Text between one start marker and the next end marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    text: String,
}

impl Frame {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// Interpret the payload.
    ///
    /// JSON is only attempted when the trimmed text opens and closes with a
    /// matching `{}` or `[]` pair; anything else is plain text.
    pub fn decode(&self) -> FrameBody {
        if !looks_structured(&self.text) {
            return FrameBody::Text(self.text.clone());
        }
        match serde_json::from_str(&self.text) {
            Ok(value) => FrameBody::Structured(value),
            Err(e) => FrameBody::Malformed {
                raw: self.text.clone(),
                error: DecodeError::from(e),
            },
        }
    }
}

/// Decoded frame payload.
#[derive(Debug, Clone)]
pub enum FrameBody {
    Structured(Value),
    Text(String),
    /// Looked like JSON but failed to parse.
    Malformed { raw: String, error: DecodeError },
}

impl FrameBody {
    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            Self::Structured(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid JSON in frame at line {line}, column {column}: {message}")]
pub struct DecodeError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            message: err.to_string(),
            line: err.line(),
            column: err.column(),
        }
    }
}

fn looks_structured(text: &str) -> bool {
    let trimmed = text.trim();
    matches!(
        (trimmed.chars().next(), trimmed.chars().last()),
        (Some('{'), Some('}')) | (Some('['), Some(']'))
    )
}

/// Stateful frame extractor for one worker stdout stream.
///
/// Owns its buffer; one instance per process lifetime.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    codec: FrameCodec,
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completes, in stream order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Frame decoding failed, resetting buffer");
                    self.buffer.clear();
                    break;
                }
            }
        }
        frames
    }

    /// End of stream: a frame still missing its end marker is dropped.
    pub fn finish(&mut self) -> Option<Frame> {
        match self.codec.decode_eof(&mut self.buffer) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Frame decoding failed at end of stream");
                self.buffer.clear();
                None
            }
        }
    }

    /// Bytes held back waiting for a marker to complete.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
