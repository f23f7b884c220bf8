//! AX.25 Packet Engine Wire Formats
//!
//! This crate provides parsing and encoding for the two wire protocols
//! spoken by external packet engines:
//!
//! - **AGWPE**: binary frames with a fixed 36-byte little-endian header
//!   followed by a length-delimited payload, multiplexing AX.25 ports and
//!   connections over one TCP socket
//! - **VARA**: CR-terminated ASCII command/response lines on a control
//!   socket, paired with a separate raw data socket per connection
//!
//! # Architecture
//!
//! Each protocol module provides:
//! - A streaming parser that handles partial data across chunk boundaries
//! - Encoding to protocol-specific bytes
//!
//! # Example
//!
//! ```rust
//! use ax_protocol::{DataKind, Frame, FrameDecoder};
//!
//! let frame = Frame::text(0, DataKind::Data, "N0CALL", "KE9YQ", "hello\r");
//! let wire = frame.encode().unwrap();
//!
//! let mut decoder = FrameDecoder::new();
//! decoder.push_bytes(&wire);
//! assert_eq!(decoder.next_frame(), Some(frame));
//! ```

pub mod codec;
pub mod error;
pub mod frame;
pub mod summary;
pub mod vara;

pub use codec::FrameDecoder;
pub use error::FrameError;
pub use frame::{DataKind, Frame};
pub use summary::{data_summary, frame_summary};
pub use vara::{LineReader, VaraCommand, VaraReply};

/// Fixed size of an AGWPE frame header, in bytes.
pub const HEADER_LEN: usize = 36;

/// Sentinel PID meaning "no protocol ID".
pub const NO_PID: u8 = 0xF0;

/// Maximum length of a call sign on the wire (NUL-padded field width).
pub const CALL_LEN: usize = 10;

/// Default maximum payload length for outbound data frames.
pub const DEFAULT_FRAME_LENGTH: usize = 128;
