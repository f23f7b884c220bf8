//! Per-port and per-connection routing state
//!
//! Frames from the engine are routed by port, then by the call-sign
//! pair. Port state is created lazily the first time a frame mentions
//! the port; connection state is created only for `C` (connect) frames,
//! so stray traffic for unknown connections is ignored.

use std::collections::{HashMap, VecDeque};

use ax_protocol::Frame;
use tokio::sync::mpsc;

use crate::batcher::FrameBatcher;
use crate::connection::{ConnKey, ConnSignal};
use crate::throttle::{Throttle, ThrottleScope};

/// State for one established connection.
#[derive(Debug)]
pub(crate) struct ConnRecord {
    pub throttle: Throttle,
    pub batcher: FrameBatcher,
    /// Frames waiting for throttle room, in submission order
    pub staging: VecDeque<Frame>,
    pub signal_tx: mpsc::Sender<ConnSignal>,
    /// The remote station disconnected first; suppress our own
    /// disconnect frame when flushing
    pub received_disconnect: bool,
    /// A local close was requested; flush begins once staging drains
    pub ending: bool,
}

impl ConnRecord {
    pub fn new(
        key: &ConnKey,
        frame_length: usize,
        signal_tx: mpsc::Sender<ConnSignal>,
    ) -> (Self, Frame) {
        let (throttle, initial_query) = Throttle::new(ThrottleScope::Connection {
            port: key.port,
            my_call: key.my_call.clone(),
            their_call: key.their_call.clone(),
        });
        let batcher = FrameBatcher::new(
            key.port,
            key.my_call.clone(),
            key.their_call.clone(),
            frame_length,
        );
        let record = Self {
            throttle,
            batcher,
            staging: VecDeque::new(),
            signal_tx,
            received_disconnect: false,
            ending: false,
        };
        (record, initial_query)
    }
}

/// State for one engine port and the connections on it.
#[derive(Debug)]
pub(crate) struct PortClient {
    pub port: u8,
    pub throttle: Throttle,
    /// Frames waiting for port-throttle room
    pub staging: VecDeque<Frame>,
    pub conns: HashMap<ConnKey, ConnRecord>,
}

impl PortClient {
    pub fn new(port: u8) -> (Self, Frame) {
        let (throttle, initial_query) = Throttle::new(ThrottleScope::Port { port });
        let client = Self {
            port,
            throttle,
            staging: VecDeque::new(),
            conns: HashMap::new(),
        };
        (client, initial_query)
    }
}

/// All ports the engine has seen traffic for.
#[derive(Debug, Default)]
pub(crate) struct PortTable {
    ports: HashMap<u8, PortClient>,
}

impl PortTable {
    /// The client for `port`, created lazily. A newly created client's
    /// initial backlog query is appended to `outbound`.
    pub fn client_mut(&mut self, port: u8, outbound: &mut Vec<Frame>) -> &mut PortClient {
        self.ports.entry(port).or_insert_with(|| {
            let (client, initial_query) = PortClient::new(port);
            outbound.push(initial_query);
            client
        })
    }

    pub fn get_mut(&mut self, port: u8) -> Option<&mut PortClient> {
        self.ports.get_mut(&port)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PortClient> {
        self.ports.values_mut()
    }
}
