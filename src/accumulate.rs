//! Newline framing for an incoming raw byte stream.
//!
//! Turns arbitrary byte chunks into complete logical lines. The buffered
//! tail is the decoder state: splitting happens on the raw bytes before
//! UTF-8 decoding, so a multi-byte character split across chunk boundaries
//! is reassembled before it is ever decoded. Pure and synchronous, no
//! transport awareness.

use crate::error::WireError;

#[derive(Debug, Default)]
pub struct LineAccumulator {
    buf: Vec<u8>,
}

impl LineAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw chunk and return every line completed by it. The
    /// trailing partial line stays buffered for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, WireError> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop();
            lines.push(String::from_utf8(line)?);
        }
        Ok(lines)
    }

    /// Bytes still waiting for their newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
