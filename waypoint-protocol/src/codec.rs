//! Bounded line-delimited JSON framing.
//!
//! Each document is one JSON value terminated by `\n`. The decoder
//! enforces a hard size bound on the encoded document so a peer cannot
//! force unbounded buffering before the first line terminator arrives.

use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};

/// Encodes a value as a newline-terminated JSON document.
pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Incremental decoder for newline-delimited JSON documents.
pub struct LineDecoder {
    buffer: BytesMut,
    max_len: usize,
}

impl LineDecoder {
    /// Creates a decoder with the given maximum encoded document size.
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_len,
        }
    }

    /// Appends raw bytes to the internal buffer.
    ///
    /// Fails with `DocumentTooLarge` once more than `max_len` bytes are
    /// buffered without a complete line; no partial dispatch happens.
    pub fn extend(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.buffer.put_slice(data);
        if self.buffer.len() > self.max_len && !self.buffer.contains(&b'\n') {
            return Err(ProtocolError::DocumentTooLarge {
                size: self.buffer.len(),
                max: self.max_len,
            });
        }
        Ok(())
    }

    /// Attempts to decode the next complete document.
    pub fn decode_line<T: serde::de::DeserializeOwned>(
        &mut self,
    ) -> Result<Option<T>, ProtocolError> {
        let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        if pos > self.max_len {
            return Err(ProtocolError::DocumentTooLarge {
                size: pos,
                max: self.max_len,
            });
        }
        let line = self.buffer.split_to(pos + 1);
        let text = std::str::from_utf8(&line[..line.len() - 1])
            .map_err(|_| ProtocolError::InvalidUtf8)?;
        let value: T = serde_json::from_str(text)?;
        Ok(Some(value))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
