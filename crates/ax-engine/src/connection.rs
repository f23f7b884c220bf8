//! Stream handles for individual AX.25 connections
//!
//! A [`Connection`] is the application's end of one link: received
//! payloads come out of `recv`, outbound data goes in through `send`,
//! and `end` starts the graceful close cascade. The other end lives
//! inside the engine actor, which owns the throttles and batcher for
//! the link.

use ax_protocol::{DataKind, Frame};
use tokio::sync::mpsc;

use crate::error::EngineError;

/// Received payloads buffered per connection before the reader lags.
pub(crate) const RECV_BUFFER_FRAMES: usize = 64;

/// Identity of one connection: the port plus the two call signs.
///
/// Inbound data frames carry the remote station in `call_from`;
/// backlog reports reverse the two calls, so `of` normalizes them back
/// into the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey {
    pub port: u8,
    /// The remote station's call sign
    pub their_call: String,
    /// The local registered call sign
    pub my_call: String,
}

impl ConnKey {
    /// Derive the key a frame belongs to.
    pub fn of(frame: &Frame) -> ConnKey {
        if frame.kind == DataKind::ConnBacklog {
            ConnKey {
                port: frame.port,
                their_call: frame.call_to.clone(),
                my_call: frame.call_from.clone(),
            }
        } else {
            ConnKey {
                port: frame.port,
                their_call: frame.call_from.clone(),
                my_call: frame.call_to.clone(),
            }
        }
    }
}

impl std::fmt::Display for ConnKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}>{} port {}", self.their_call, self.my_call, self.port)
    }
}

/// Commands a connection handle sends into the engine actor.
#[derive(Debug)]
pub(crate) enum ConnCmd {
    /// Queue payload bytes for transmission
    Write(Vec<u8>),
    /// Finish the write side: flush everything, then disconnect
    End,
    /// Tear the connection down without flushing
    Destroy,
}

/// Signals the engine actor sends to a connection handle.
#[derive(Debug)]
pub(crate) enum ConnSignal {
    /// Payload received from the remote station
    Data(Vec<u8>),
    /// The connection has fully closed; no more data will arrive
    Eof,
}

/// One established AX.25 connection.
pub struct Connection {
    key: ConnKey,
    signal_rx: mpsc::Receiver<ConnSignal>,
    cmd_tx: mpsc::Sender<(ConnKey, ConnCmd)>,
    eof: bool,
}

impl Connection {
    pub(crate) fn new(
        key: ConnKey,
        signal_rx: mpsc::Receiver<ConnSignal>,
        cmd_tx: mpsc::Sender<(ConnKey, ConnCmd)>,
    ) -> Self {
        Self {
            key,
            signal_rx,
            cmd_tx,
            eof: false,
        }
    }

    /// The engine port this connection runs on.
    pub fn port(&self) -> u8 {
        self.key.port
    }

    /// The remote station's call sign.
    pub fn their_call(&self) -> &str {
        &self.key.their_call
    }

    /// The local call sign the remote station connected to.
    pub fn my_call(&self) -> &str {
        &self.key.my_call
    }

    /// Receive the next payload from the remote station.
    ///
    /// Returns `None` once the connection has closed, after all
    /// buffered payloads have been drained.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        if self.eof {
            return None;
        }
        match self.signal_rx.recv().await {
            Some(ConnSignal::Data(data)) => Some(data),
            Some(ConnSignal::Eof) | None => {
                self.eof = true;
                None
            }
        }
    }

    /// Queue payload bytes for transmission to the remote station.
    ///
    /// Small writes made in quick succession are coalesced into larger
    /// frames by the engine.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), EngineError> {
        self.cmd_tx
            .send((self.key.clone(), ConnCmd::Write(data)))
            .await
            .map_err(|_| EngineError::Closed)
    }

    /// Close gracefully: flush all queued data, then disconnect.
    ///
    /// The connection is fully closed once `recv` returns `None`.
    pub async fn end(&self) -> Result<(), EngineError> {
        self.cmd_tx
            .send((self.key.clone(), ConnCmd::End))
            .await
            .map_err(|_| EngineError::Closed)
    }

    /// Tear the connection down immediately, discarding queued data.
    pub async fn destroy(&self) -> Result<(), EngineError> {
        self.cmd_tx
            .send((self.key.clone(), ConnCmd::Destroy))
            .await
            .map_err(|_| EngineError::Closed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ax_protocol::Frame;

    #[test]
    fn test_key_of_data_frame() {
        let frame = Frame::text(2, DataKind::Data, "KE9YQ", "N0CALL", "hi");
        let key = ConnKey::of(&frame);
        assert_eq!(key.their_call, "KE9YQ");
        assert_eq!(key.my_call, "N0CALL");
        assert_eq!(key.port, 2);
    }

    #[test]
    fn test_key_of_backlog_frame_reverses_calls() {
        let data = Frame::text(2, DataKind::Data, "KE9YQ", "N0CALL", "hi");
        let backlog =
            Frame::addressed(2, DataKind::ConnBacklog, "N0CALL", "KE9YQ", vec![0, 0, 0, 0]);
        assert_eq!(ConnKey::of(&data), ConnKey::of(&backlog));
    }
}
