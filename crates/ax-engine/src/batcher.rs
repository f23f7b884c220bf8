//! Coalescing small writes into full data frames
//!
//! Applications tend to write in small pieces (a prompt, a line, a
//! keystroke echo). Sending each piece as its own frame wastes air
//! time, so writes accumulate in a buffer until a full frame's worth is
//! available or [`MAX_WRITE_DELAY`] has passed since the buffer started
//! filling, whichever comes first.

use std::time::{Duration, Instant};

use ax_protocol::{DataKind, Frame};

/// Longest a partial buffer waits before being sent anyway.
pub(crate) const MAX_WRITE_DELAY: Duration = Duration::from_millis(250);

/// Accumulates outbound payload bytes for one connection and emits
/// data frames of at most `max_data_len` bytes.
#[derive(Debug)]
pub(crate) struct FrameBatcher {
    port: u8,
    my_call: String,
    their_call: String,
    max_data_len: usize,
    buffer: Vec<u8>,
    /// When the buffered bytes must go out, if any are buffered
    deadline: Option<Instant>,
}

impl FrameBatcher {
    pub fn new(port: u8, my_call: String, their_call: String, max_data_len: usize) -> Self {
        Self {
            port,
            my_call,
            their_call,
            max_data_len,
            buffer: Vec::new(),
            deadline: None,
        }
    }

    /// Accept one write. Returns the full frames it completes; any
    /// remainder stays buffered with a fresh deadline.
    pub fn write(&mut self, data: &[u8], now: Instant) -> Vec<Frame> {
        if self.buffer.len() + data.len() < self.max_data_len {
            if self.buffer.is_empty() && !data.is_empty() {
                self.deadline = Some(now + MAX_WRITE_DELAY);
            }
            self.buffer.extend_from_slice(data);
            return Vec::new();
        }

        // Top up the buffer to a full frame, then slice the rest.
        let mut out = Vec::new();
        let fill = self.max_data_len - self.buffer.len();
        self.buffer.extend_from_slice(&data[..fill]);
        out.push(self.take_buffer());

        let mut next = fill;
        while next < data.len() {
            let end = next + self.max_data_len;
            if end <= data.len() {
                out.push(self.frame(data[next..end].to_vec()));
                next = end;
            } else {
                self.buffer.extend_from_slice(&data[next..]);
                self.deadline = Some(now + MAX_WRITE_DELAY);
                break;
            }
        }
        out
    }

    /// Emit the buffered bytes if their deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Option<Frame> {
        match self.deadline {
            Some(deadline) if deadline <= now => Some(self.take_buffer()),
            _ => None,
        }
    }

    /// Emit whatever is buffered, deadline or not. Used when closing.
    pub fn flush(&mut self) -> Option<Frame> {
        if self.buffer.is_empty() {
            self.deadline = None;
            None
        } else {
            Some(self.take_buffer())
        }
    }

    /// When the buffered bytes are due, if any are buffered.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn take_buffer(&mut self) -> Frame {
        self.deadline = None;
        let data = std::mem::take(&mut self.buffer);
        self.frame(data)
    }

    fn frame(&self, data: Vec<u8>) -> Frame {
        Frame::addressed(
            self.port,
            DataKind::Data,
            &self.my_call,
            &self.their_call,
            data,
        )
    }
}
