//! Newline-delimited JSON framing for the MCP stdio stream.
//!
//! Wire format: one JSON document per line, `\n` terminated. Embedded
//! newlines never appear because serde_json escapes them in strings.

use crate::error::ProcResult;

/// Encode a serializable value as a single `\n`-terminated JSON line.
pub fn line_encode<T: serde::Serialize>(value: &T) -> ProcResult<Vec<u8>> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one JSON line (without the trailing newline) into a typed value.
pub fn json_decode<T: serde::de::DeserializeOwned>(line: &[u8]) -> ProcResult<T> {
    Ok(serde_json::from_slice(line)?)
}

/// Streaming line decoder: accumulates bytes and yields complete lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes and return every complete, non-blank line (newline and a
    /// trailing `\r` stripped).
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut lines = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                lines.push(line);
            }
        }

        lines
    }

    /// Take whatever is left when the stream ends without a final newline.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(rest)
        }
    }

    /// Number of bytes waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
