//! Events emitted by the engine actors

use crate::connection::Connection;
use crate::error::ErrorKind;

/// Notifications delivered to the application through the event channel.
#[derive(Debug)]
pub enum EngineEvent {
    /// A call sign was registered and the engine is now accepting
    /// connections addressed to it
    Listening { port: u8, my_call: String },
    /// A remote station connected; the handle is the application's end
    /// of the stream
    Connection(Connection),
    /// Something went wrong; `source` names the port or connection the
    /// error belongs to
    Error {
        kind: ErrorKind,
        source: String,
        message: String,
    },
    /// The transport closed and the actor has shut down
    Closed,
}
