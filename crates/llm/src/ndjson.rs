//! Incremental decoder for newline-delimited JSON bodies.
//!
//! The backend may split one object across network reads, so bytes are held
//! until a `\n` arrives. Buffering raw bytes also keeps multi-byte UTF-8
//! sequences intact when a read boundary lands inside a character.

use super::error::FrameError;
use super::frame::Frame;

pub type DecodedFrame = Result<Frame, FrameError>;

#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    pending: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one body chunk and returns every complete line, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedFrame> {
        let scan_from = self.pending.len();
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending[scan_from..]
            .iter()
            .rposition(|byte| *byte == b'\n')
            .map(|offset| scan_from + offset)
        else {
            return Vec::new();
        };

        let tail = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, tail);

        complete
            .split(|byte| *byte == b'\n')
            .filter_map(decode_line)
            .collect()
    }

    /// Flushes a final line that ended without a newline.
    pub fn finish(&mut self) -> Option<DecodedFrame> {
        let remaining = std::mem::take(&mut self.pending);
        decode_line(&remaining)
    }

    /// Bytes waiting for their terminating newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn decode_line(line: &[u8]) -> Option<DecodedFrame> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(Frame::parse(line))
}
