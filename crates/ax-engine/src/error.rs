//! Error types for the stream engine

use ax_protocol::FrameError;
use thiserror::Error;

/// Errors that can occur in the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed frame or header
    #[error("format error: {0}")]
    Format(#[from] FrameError),

    /// Throttle contract violation or receive buffer overflow
    #[error("overflow: {0}")]
    Overflow(String),

    /// Unexpected or fatal engine report
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Underlying socket error, timeout, or refusal
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The engine rejected a call-sign registration
    #[error("registration refused: {call} on port {port}")]
    Registration { port: u8, call: String },

    /// The engine actor has shut down
    #[error("engine closed")]
    Closed,
}

/// Taxonomy tag carried on error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed frame or header
    Format,
    /// Throttle contract violation or receive buffer overflow
    Overflow,
    /// Unexpected or fatal engine report
    Protocol,
    /// Underlying socket failure
    Transport,
    /// Call-sign registration refused
    Registration,
}

impl EngineError {
    /// The taxonomy tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Format(_) => ErrorKind::Format,
            EngineError::Overflow(_) => ErrorKind::Overflow,
            EngineError::Protocol(_) => ErrorKind::Protocol,
            EngineError::Transport(_) | EngineError::Closed => ErrorKind::Transport,
            EngineError::Registration { .. } => ErrorKind::Registration,
        }
    }
}
