//! Connection-oriented streams over AX.25 packet engines
//!
//! Packet engines expose raw TCP services: AGWPE-compatible engines
//! (Direwolf, ldsped, AGWPE itself) speak a binary framed protocol on
//! one socket, and VARA modems speak a text control protocol plus a
//! raw data socket. This crate turns either into the same shape: a
//! server handle you ask to listen, an event channel that delivers
//! incoming [`Connection`]s, and per-connection streams with graceful
//! close semantics.
//!
//! ```no_run
//! use ax_engine::{AgwConfig, AgwServer, EngineEvent};
//!
//! # async fn run() -> Result<(), ax_engine::EngineError> {
//! let config = AgwConfig {
//!     my_calls: vec!["N0CALL".to_string()],
//!     ..AgwConfig::default()
//! };
//! let (server, mut events) = AgwServer::connect(config).await?;
//! server.listen(Vec::new(), None).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let EngineEvent::Connection(mut conn) = event {
//!         conn.send(b"Hello\r".to_vec()).await?;
//!         while let Some(data) = conn.recv().await {
//!             // ...
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod batcher;
mod config;
mod connection;
mod engine;
mod error;
mod events;
mod router;
mod server;
mod throttle;
mod vara;

pub use config::{AgwConfig, VaraConfig};
pub use connection::Connection;
pub use error::{EngineError, ErrorKind};
pub use events::EngineEvent;
pub use server::AgwServer;
pub use vara::VaraServer;
