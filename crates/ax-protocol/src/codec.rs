//! Streaming AGWPE frame decoder
//!
//! TCP delivers the engine's byte stream in arbitrary chunks: a header may
//! arrive split across two reads, several frames may share one read, and a
//! payload may trickle in over many. The decoder accumulates bytes and
//! yields a frame only once its declared payload is fully buffered; it
//! never reads past a frame boundary into the next header.

use crate::frame::Frame;
use crate::HEADER_LEN;

/// Streaming decoder: push bytes in, pull complete frames out.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the transport.
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extract the next complete frame, if one is fully buffered.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.buffer.len() < HEADER_LEN {
            return None; // Wait for more header.
        }
        let data_len = Frame::declared_data_len(&self.buffer[..HEADER_LEN]);
        if self.buffer.len() < HEADER_LEN + data_len {
            return None; // Wait for more data.
        }
        // A full header is always present here, so parse_header cannot fail.
        let mut frame = Frame::parse_header(&self.buffer[..HEADER_LEN])
            .expect("buffered header is full length");
        frame.data = self.buffer[HEADER_LEN..HEADER_LEN + data_len].to_vec();
        self.buffer.drain(..HEADER_LEN + data_len);
        Some(frame)
    }

    /// Bytes buffered but not yet consumed by a complete frame.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Discard any partially buffered frame.
    pub fn clear(&mut self) {
        if !self.buffer.is_empty() {
            tracing::trace!(discarded = self.buffer.len(), "partial frame discarded");
        }
        self.buffer.clear();
    }
}
