//! Error types for wire-format parsing and encoding

use thiserror::Error;

/// Errors that can occur while parsing or encoding AGWPE frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// A header was requested from fewer bytes than a header occupies
    #[error("truncated header: {actual} bytes is shorter than {expected}")]
    TruncatedHeader { actual: usize, expected: usize },

    /// Call sign does not fit the 10-byte wire field
    #[error("call sign too long: {0:?}")]
    CallSignTooLong(String),

    /// Call sign contains non-ASCII bytes
    #[error("call sign is not ASCII: {0:?}")]
    CallSignNotAscii(String),
}
