//! Codecs for the worker's standard streams.
//!
//! - [`JsonLineCodec`]: one JSON document per line (requests on stdin)
//! - [`FrameCodec`]: sentinel-delimited text frames (responses on stdout)
//!
//! The host only writes requests and only reads frames, so each codec
//! implements the one direction it is used in.

use std::io;
use std::marker::PhantomData;

use serde::Serialize;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::frame::Frame;

/// Marks the start of a response frame on the worker's stdout.
pub const FRAME_START: &str = "<------------------- START ------------------->";

/// Marks the end of a response frame on the worker's stdout.
pub const FRAME_END: &str = "<------------------- END ------------------->";

/// Codec that writes each message as compact JSON followed by a newline.
///
/// Wraps LinesCodec; serde_json escapes embedded newlines so one message is
/// always exactly one line.
pub struct JsonLineCodec<T> {
    inner: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLineCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLineCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new(),
            _phantom: PhantomData,
        }
    }
}

fn lines_error(err: LinesCodecError) -> io::Error {
    match err {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "line length limit exceeded")
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding request line");
        if json_len > 100_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large request being encoded"
            );
        }
        self.inner.encode(json, dst).map_err(lines_error)
    }
}

/// Sentinel framing over an unstructured byte stream.
///
/// Decoding discards everything outside `FRAME_START ... FRAME_END`. A frame may
/// arrive split across any number of reads, and one read may carry several
/// frames; each `decode` call yields at most one.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let start_marker = FRAME_START.as_bytes();
        let end_marker = FRAME_END.as_bytes();

        let Some(start) = find(src, start_marker) else {
            // Noise. Keep only a tail that could still be the beginning of a start marker.
            let keep = start_marker.len() - 1;
            if src.len() > keep {
                let discarded = src.len() - keep;
                src.advance(discarded);
            }
            return Ok(None);
        };

        let body_start = start + start_marker.len();
        let Some(body_len) = find(&src[body_start..], end_marker) else {
            if start > 0 {
                src.advance(start);
            }
            return Ok(None);
        };

        let frame = src.split_to(body_start + body_len + end_marker.len());
        let payload = &frame[body_start..body_start + body_len];
        tracing::trace!(frame_size_bytes = payload.len(), "Decoded frame");
        Ok(Some(Frame::new(String::from_utf8_lossy(payload).into_owned())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if find(src, FRAME_START.as_bytes()).is_some() {
            tracing::debug!(
                buffered_bytes = src.len(),
                "Stream ended inside a frame, discarding partial frame"
            );
        }
        src.clear();
        Ok(None)
    }
}
