//! Length-prefixed framing for pipe traffic.
//!
//! Pipes carry a byte stream: one `read` may return a prefix of a message, a
//! whole message, or several messages glued together. Every payload is
//! therefore wrapped in a frame before it is written:
//!
//! ```text
//! ┌────────────┬──────────────────────┐
//! │   Length   │       Payload        │
//! │  (4 bytes) │  (variable length)   │
//! └────────────┴──────────────────────┘
//! ```
//!
//! The length is little-endian and counts payload bytes only.

use thiserror::Error;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest payload accepted unless configured otherwise (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame payload is empty")]
    Empty,
    #[error("frame payload of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: u32 },
}

/// Wraps `payload` in a frame.
pub fn encode_frame(payload: &[u8], max_len: u32) -> Result<Vec<u8>, FrameError> {
    check_len(payload.len(), max_len)?;

    let mut buffer = Vec::with_capacity(HEADER_LEN + payload.len());
    buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buffer.extend_from_slice(payload);
    Ok(buffer)
}

fn check_len(len: usize, max_len: u32) -> Result<(), FrameError> {
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > max_len as usize {
        return Err(FrameError::Oversized { len, max: max_len });
    }
    Ok(())
}

/// Incremental decoder turning arbitrary read chunks back into payloads.
///
/// The declared length is validated as soon as the header is complete, so a
/// corrupt or hostile prefix can never make the decoder buffer more than
/// `max_len` bytes of payload.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    // Bytes before this offset belong to frames already handed out.
    consumed: usize,
    max_len: u32,
}

impl FrameDecoder {
    pub fn new(max_len: u32) -> Self {
        Self {
            buffer: Vec::new(),
            consumed: 0,
            max_len,
        }
    }

    /// Appends raw bytes read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.compact();
        self.buffer.extend_from_slice(chunk);
    }

    /// Pops the next complete payload, if one is buffered.
    ///
    /// After an error the stream is desynchronized and the decoder should be
    /// discarded.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let pending = &self.buffer[self.consumed..];
        if pending.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&pending[..HEADER_LEN]);
        let len = u32::from_le_bytes(header) as usize;
        check_len(len, self.max_len)?;

        let end = HEADER_LEN + len;
        if pending.len() < end {
            return Ok(None);
        }

        let payload = pending[HEADER_LEN..end].to_vec();
        self.consumed += end;
        Ok(Some(payload))
    }

    /// Pushes `chunk` and returns every payload completed by it, in order.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        self.push(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        self.compact();
        Ok(frames)
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    fn compact(&mut self) {
        if self.consumed > 0 {
            self.buffer.drain(..self.consumed);
            self.consumed = 0;
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}
