//! Simulated packet engines for integration tests
//!
//! [`SimTnc`] plays the part of an AGWPE-compatible engine on a local
//! TCP port: it answers the standard queries (port count, capabilities,
//! registration, backlog) and lets a test inject connection traffic.
//! [`SimVaraModem`] does the same for a VARA modem's control and data
//! sockets.

mod tnc;
mod vara;

pub use tnc::{SimTnc, TncSession};
pub use vara::{SimVaraModem, VaraControl};
