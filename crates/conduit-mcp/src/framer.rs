//! Incremental JSON object framing.
//!
//! Pipes may split one JSON document across reads or deliver several in one
//! read. The scanner tracks string/escape state and brace depth across
//! chunks and yields each top-level object exactly once, in arrival order.
//! Already-scanned bytes are never rescanned. It does not validate JSON;
//! whatever decodes the frames does.

use crate::error::McpError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Default)]
struct ScanState {
    in_string: bool,
    escaping: bool,
    depth: usize,
    /// Bytes of the current object already consumed by the scanner.
    scanned: usize,
}

impl ScanState {
    /// Split the next complete object off the front of `buf`, if there is one.
    ///
    /// Between objects, bytes ahead of the next `{` are discarded once that
    /// `{` arrives. Until then only leading whitespace is dropped; anything
    /// else stays in `buf` so end of stream can report it. Inside an object
    /// the partial bytes stay in `buf`.
    fn next_object(&mut self, buf: &mut BytesMut) -> Option<BytesMut> {
        if self.depth == 0 {
            let Some(start) = buf.iter().position(|&b| b == b'{') else {
                let blank = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
                buf.advance(blank);
                return None;
            };
            if start > 0 {
                if buf[..start].iter().any(|b| !b.is_ascii_whitespace()) {
                    tracing::warn!(
                        "Discarding {start} bytes outside any JSON object: {}",
                        String::from_utf8_lossy(&buf[..start])
                    );
                }
                buf.advance(start);
            }
            self.scanned = 0;
        }

        while self.scanned < buf.len() {
            let b = buf[self.scanned];
            self.scanned += 1;

            if self.escaping {
                self.escaping = false;
                continue;
            }
            match b {
                b'\\' => self.escaping = true,
                b'"' => self.in_string = !self.in_string,
                _ if self.in_string => {}
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        let frame = buf.split_to(self.scanned);
                        self.scanned = 0;
                        return Some(frame);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

/// Push-style framer: feed chunks, collect complete objects.
#[derive(Debug, Default)]
pub struct JsonFramer {
    buf: BytesMut,
    state: ScanState,
}

impl JsonFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every object it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.state.next_object(&mut self.buf) {
            frames.push(frame.freeze());
        }
        frames
    }

    /// Bytes carried over: an object that has not closed yet, or stray bytes
    /// no object has followed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Call at end of stream. Fails if an object was left unterminated or
    /// the stream ended on stray bytes.
    pub fn finish(self) -> Result<(), McpError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(McpError::Truncated {
                pending_bytes: self.buf.len(),
            })
        }
    }
}

/// The framer as a codec: decodes raw bytes into one JSON object per item and
/// encodes outbound messages as newline-delimited JSON.
#[derive(Debug, Default)]
pub struct JsonObjectCodec {
    state: ScanState,
}

impl JsonObjectCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for JsonObjectCodec {
    type Item = Bytes;
    type Error = McpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, McpError> {
        Ok(self.state.next_object(src).map(BytesMut::freeze))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, McpError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let pending_bytes = src.len();
        src.clear();
        self.state = ScanState::default();
        Err(McpError::Truncated { pending_bytes })
    }
}

impl Encoder<Bytes> for JsonObjectCodec {
    type Error = McpError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), McpError> {
        dst.reserve(item.len() + 1);
        dst.put_slice(&item);
        dst.put_u8(b'\n');
        Ok(())
    }
}
