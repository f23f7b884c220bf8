//! Synchronous AGWPE engine state machine
//!
//! [`EngineCore`] holds all routing, batching, and throttling state and
//! advances it one input at a time: a frame from the engine, a command
//! from a connection handle, a poll tick, or a batch deadline. It never
//! blocks; outbound frames and application events accumulate in
//! buffers the actor drains after each input.

use std::time::Instant;

use ax_protocol::{frame_summary, DataKind, Frame};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};

use crate::config::AgwConfig;
use crate::connection::{ConnCmd, ConnKey, ConnSignal, Connection, RECV_BUFFER_FRAMES};
use crate::error::{EngineError, ErrorKind};
use crate::events::EngineEvent;
use crate::router::{ConnRecord, PortTable};

/// Commands the server handle sends into the actor.
#[derive(Debug)]
pub(crate) enum ServerCmd {
    /// Register call signs on ports (all ports when `ports` is `None`)
    Listen {
        calls: Vec<String>,
        ports: Option<Vec<u8>>,
    },
    /// Send one unconnected (UI) frame
    Unproto {
        port: u8,
        call_from: String,
        call_to: String,
        data: Vec<u8>,
    },
    /// Shut the actor down
    Close,
}

pub(crate) struct EngineCore {
    frame_length: usize,
    default_calls: Vec<String>,
    /// Port count reported by the engine, once known
    num_ports: Option<u8>,
    /// Listen requests received before the port count arrived
    listen_queue: Vec<Vec<String>>,
    ports: PortTable,
    conn_cmd_tx: mpsc::Sender<(ConnKey, ConnCmd)>,
    out: Vec<Frame>,
    events: Vec<EngineEvent>,
    closed: bool,
}

impl EngineCore {
    pub fn new(config: &AgwConfig, conn_cmd_tx: mpsc::Sender<(ConnKey, ConnCmd)>) -> Self {
        Self {
            frame_length: config.frame_length,
            default_calls: config.my_calls.clone(),
            num_ports: None,
            listen_queue: Vec::new(),
            ports: PortTable::default(),
            conn_cmd_tx,
            out: Vec::new(),
            events: Vec::new(),
            closed: false,
        }
    }

    /// Queue the opening port-count query.
    pub fn start(&mut self) {
        self.out.push(Frame::control(DataKind::PortInfo, 0));
    }

    /// Route one frame received from the engine.
    pub fn handle_frame(&mut self, frame: Frame, now: Instant) {
        debug!(frame = %frame_summary(&frame), "from engine");
        match frame.kind {
            DataKind::PortInfo => self.handle_port_info(&frame),
            DataKind::Register => self.handle_register(&frame),
            DataKind::PortCaps => {
                trace!(port = frame.port, "port capabilities received");
            }
            DataKind::PortBacklog => self.handle_port_backlog(&frame),
            DataKind::Connect | DataKind::Data | DataKind::Disconnect | DataKind::ConnBacklog => {
                self.handle_conn_frame(frame, now)
            }
            DataKind::Unproto | DataKind::Other(_) => {
                trace!(frame = %frame_summary(&frame), "unhandled frame kind");
            }
        }
    }

    /// Register call signs so remote stations can connect to them.
    pub fn listen(&mut self, calls: Vec<String>, ports: Option<Vec<u8>>) {
        let calls = if calls.is_empty() {
            self.default_calls.clone()
        } else {
            calls
        };
        if calls.is_empty() {
            warn!("listen requested with no call signs");
            return;
        }
        match ports {
            Some(ports) => self.register(&calls, &ports),
            None => match self.num_ports {
                Some(n) => {
                    let all: Vec<u8> = (0..n).collect();
                    self.register(&calls, &all);
                }
                // Registered once the port count arrives.
                None => self.listen_queue.push(calls),
            },
        }
    }

    /// Send one unconnected (UI) frame.
    pub fn unproto(&mut self, port: u8, call_from: &str, call_to: &str, data: Vec<u8>) {
        self.out.push(Frame::addressed(
            port,
            DataKind::Unproto,
            call_from,
            call_to,
            data,
        ));
    }

    /// Apply one command from a connection handle.
    pub fn conn_cmd(&mut self, key: ConnKey, cmd: ConnCmd, now: Instant) {
        match cmd {
            ConnCmd::Write(data) => {
                let Some(rec) = self.record_mut(&key) else {
                    trace!(%key, "write for closed connection dropped");
                    return;
                };
                if rec.ending {
                    trace!(%key, "write after end dropped");
                    return;
                }
                let frames = rec.batcher.write(&data, now);
                rec.staging.extend(frames);
                self.pump_conn(&key);
            }
            ConnCmd::End => self.start_end(&key),
            ConnCmd::Destroy => self.finish_conn(&key),
        }
    }

    /// Send backlog queries for every throttle stuck waiting on the
    /// engine's queue to drain.
    pub fn poll_tick(&mut self) {
        let mut direct = Vec::new();
        let mut via_port = Vec::new();
        for pc in self.ports.iter_mut() {
            // Port-level queries go straight to the socket.
            if let Some(query) = pc.throttle.poll_query() {
                direct.push(query);
            }
            for rec in pc.conns.values_mut() {
                if let Some(query) = rec.throttle.poll_query() {
                    via_port.push((pc.port, query));
                }
            }
        }
        self.out.extend(direct);
        for (port, query) in via_port {
            self.pump_port(port, vec![query]);
        }
    }

    /// Emit data frames whose batching deadline has passed.
    pub fn expire_batches(&mut self, now: Instant) {
        let mut due = Vec::new();
        for pc in self.ports.iter_mut() {
            for (key, rec) in pc.conns.iter_mut() {
                if let Some(frame) = rec.batcher.expire(now) {
                    rec.staging.push_back(frame);
                    due.push(key.clone());
                }
            }
        }
        for key in due {
            self.pump_conn(&key);
        }
    }

    /// The earliest batching deadline across all connections.
    pub fn next_batch_deadline(&mut self) -> Option<Instant> {
        self.ports
            .iter_mut()
            .flat_map(|pc| pc.conns.values_mut())
            .filter_map(|rec| rec.batcher.deadline())
            .min()
    }

    /// The transport closed: end every connection and report shutdown.
    pub fn handle_transport_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("engine transport closed");
        for pc in self.ports.iter_mut() {
            for rec in pc.conns.values_mut() {
                let _ = rec.signal_tx.try_send(ConnSignal::Eof);
            }
            pc.conns.clear();
        }
        self.events.push(EngineEvent::Closed);
    }

    /// Take the frames queued for the socket.
    pub fn drain_outbound(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.out)
    }

    /// Take the events queued for the application.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    fn handle_port_info(&mut self, frame: &Frame) {
        // Payload looks like "2;Port1 ...;Port2 ...".
        let text = String::from_utf8_lossy(&frame.data);
        let Some(count) = text.split(';').next().and_then(|n| n.trim().parse::<u8>().ok())
        else {
            self.events.push(EngineEvent::Error {
                kind: ErrorKind::Protocol,
                source: "engine".to_string(),
                message: format!("unparsable port count: {text:?}"),
            });
            return;
        };
        info!(num_ports = count, "engine reported its ports");
        self.num_ports = Some(count);
        for port in 0..count {
            self.out.push(Frame::control(DataKind::PortCaps, port));
        }
        for calls in std::mem::take(&mut self.listen_queue) {
            self.listen(calls, None);
        }
    }

    fn handle_register(&mut self, frame: &Frame) {
        let call = frame.call_from.clone();
        if frame.data.first() == Some(&1) {
            info!(port = frame.port, call, "listening");
            self.events.push(EngineEvent::Listening {
                port: frame.port,
                my_call: call,
            });
        } else {
            let err = EngineError::Registration {
                port: frame.port,
                call: call.clone(),
            };
            self.events.push(EngineEvent::Error {
                kind: err.kind(),
                source: format!("port {}", frame.port),
                message: err.to_string(),
            });
        }
    }

    fn handle_port_backlog(&mut self, frame: &Frame) {
        let n = le_u32(&frame.data);
        let pc = self.ports.client_mut(frame.port, &mut self.out);
        let released = pc.throttle.update_in_flight(n);
        self.out.extend(released);
        self.pump_port(frame.port, Vec::new());
    }

    fn handle_conn_frame(&mut self, frame: Frame, now: Instant) {
        let key = ConnKey::of(&frame);
        let pc = self.ports.client_mut(frame.port, &mut self.out);
        if !pc.conns.contains_key(&key) {
            if frame.kind != DataKind::Connect {
                trace!(%key, kind = ?frame.kind, "frame for unknown connection ignored");
                return;
            }
            self.create_conn(key.clone());
        }
        match frame.kind {
            DataKind::Connect => {}
            DataKind::Data => self.deliver_data(&key, frame.data, now),
            DataKind::Disconnect => self.handle_remote_disconnect(&key),
            DataKind::ConnBacklog => self.handle_conn_backlog(&key, le_u32(&frame.data)),
            _ => unreachable!("handle_conn_frame only sees connection kinds"),
        }
    }

    fn create_conn(&mut self, key: ConnKey) {
        let (signal_tx, signal_rx) = mpsc::channel(RECV_BUFFER_FRAMES);
        let (record, initial_query) = ConnRecord::new(&key, self.frame_length, signal_tx);
        let pc = self.ports.client_mut(key.port, &mut self.out);
        pc.conns.insert(key.clone(), record);
        info!(%key, "connection established");
        let conn = Connection::new(key.clone(), signal_rx, self.conn_cmd_tx.clone());
        self.events.push(EngineEvent::Connection(conn));
        self.pump_port(key.port, vec![initial_query]);
    }

    fn deliver_data(&mut self, key: &ConnKey, data: Vec<u8>, now: Instant) {
        let Some(rec) = self.record_mut(key) else {
            return;
        };
        match rec.signal_tx.try_send(ConnSignal::Data(data)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(%key, "receive buffer full, dropping frame");
                self.events.push(EngineEvent::Error {
                    kind: ErrorKind::Overflow,
                    source: key.to_string(),
                    message: "receive buffer full, frame dropped".to_string(),
                });
            }
            // The application dropped its handle: close the link.
            Err(TrySendError::Closed(_)) => self.conn_cmd(key.clone(), ConnCmd::End, now),
        }
    }

    fn handle_remote_disconnect(&mut self, key: &ConnKey) {
        let Some(rec) = self.record_mut(key) else {
            return;
        };
        debug!(%key, "remote station disconnected");
        // They hung up first: flush what we have, but send no
        // disconnect frame of our own.
        rec.received_disconnect = true;
        self.start_end(key);
    }

    fn handle_conn_backlog(&mut self, key: &ConnKey, frames_in_queue: u32) {
        let Some(rec) = self.record_mut(key) else {
            return;
        };
        let released = rec.throttle.update_in_flight(frames_in_queue);
        if !released.is_empty() {
            self.pump_port(key.port, released);
        }
        self.pump_conn(key);
    }

    fn start_end(&mut self, key: &ConnKey) {
        let Some(rec) = self.record_mut(key) else {
            return;
        };
        if rec.ending {
            return;
        }
        rec.ending = true;
        if let Some(frame) = rec.batcher.flush() {
            rec.staging.push_back(frame);
        }
        self.pump_conn(key);
    }

    /// Move staged frames through the connection throttle into the
    /// port, starting the flush once staging drains on an ending
    /// connection, and remove the record when the throttle finishes.
    fn pump_conn(&mut self, key: &ConnKey) {
        let mut to_port = Vec::new();
        let mut overflow = None;
        let finished;
        {
            let Some(pc) = self.ports.get_mut(key.port) else {
                return;
            };
            let Some(rec) = pc.conns.get_mut(key) else {
                return;
            };
            while rec.throttle.has_room() {
                let Some(frame) = rec.staging.pop_front() else {
                    break;
                };
                match rec.throttle.submit(frame) {
                    Ok(frames) => to_port.extend(frames),
                    Err(err) => overflow = Some(err),
                }
            }
            if rec.ending && rec.staging.is_empty() && !rec.throttle.is_flushing() {
                let final_frame = if rec.received_disconnect {
                    None
                } else {
                    Some(Frame::addressed(
                        key.port,
                        DataKind::Disconnect,
                        &key.my_call,
                        &key.their_call,
                        Vec::new(),
                    ))
                };
                to_port.extend(rec.throttle.start_flush(final_frame));
            }
            finished = rec.throttle.is_done();
        }
        if let Some(err) = overflow {
            self.events.push(EngineEvent::Error {
                kind: err.kind(),
                source: key.to_string(),
                message: err.to_string(),
            });
        }
        if !to_port.is_empty() {
            self.pump_port(key.port, to_port);
        }
        if finished {
            self.finish_conn(key);
        }
    }

    /// Move frames through the port throttle onto the socket queue.
    fn pump_port(&mut self, port: u8, frames: Vec<Frame>) {
        let Some(pc) = self.ports.get_mut(port) else {
            return;
        };
        pc.staging.extend(frames);
        while pc.throttle.has_room() {
            let Some(frame) = pc.staging.pop_front() else {
                break;
            };
            match pc.throttle.submit(frame) {
                Ok(frames) => self.out.extend(frames),
                Err(err) => self.events.push(EngineEvent::Error {
                    kind: err.kind(),
                    source: format!("port {port}"),
                    message: err.to_string(),
                }),
            }
        }
    }

    fn register(&mut self, calls: &[String], ports: &[u8]) {
        for &port in ports {
            for call in calls {
                debug!(port, call, "registering call sign");
                self.out
                    .push(Frame::addressed(port, DataKind::Register, call, "", Vec::new()));
            }
        }
    }

    fn record_mut(&mut self, key: &ConnKey) -> Option<&mut ConnRecord> {
        self.ports.get_mut(key.port)?.conns.get_mut(key)
    }

    /// Close out a connection record: EOF to the reader, drop the
    /// state. Safe to call more than once.
    fn finish_conn(&mut self, key: &ConnKey) {
        let Some(pc) = self.ports.get_mut(key.port) else {
            return;
        };
        if let Some(rec) = pc.conns.remove(key) {
            let _ = rec.signal_tx.try_send(ConnSignal::Eof);
            info!(%key, "connection closed");
        }
    }
}

fn le_u32(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    let n = data.len().min(4);
    bytes[..n].copy_from_slice(&data[..n]);
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> (EngineCore, mpsc::Receiver<(ConnKey, ConnCmd)>) {
        let (conn_cmd_tx, conn_cmd_rx) = mpsc::channel(32);
        let config = AgwConfig {
            frame_length: 8,
            ..AgwConfig::default()
        };
        (EngineCore::new(&config, conn_cmd_tx), conn_cmd_rx)
    }

    fn port_info(count: &str) -> Frame {
        let mut frame = Frame::control(DataKind::PortInfo, 0);
        frame.data = count.as_bytes().to_vec();
        frame
    }

    fn connect_frame(port: u8) -> Frame {
        Frame::text(port, DataKind::Connect, "KE9YQ", "N0CALL", "*** CONNECTED")
    }

    fn conn_key(port: u8) -> ConnKey {
        ConnKey::of(&connect_frame(port))
    }

    fn kinds(frames: &[Frame]) -> Vec<char> {
        frames.iter().map(|f| f.kind.as_char()).collect()
    }

    #[test]
    fn test_start_queries_port_count() {
        let (mut core, _rx) = core();
        core.start();
        assert_eq!(kinds(&core.drain_outbound()), vec!['G']);
    }

    #[test]
    fn test_port_info_queries_capabilities_and_replays_listen() {
        let (mut core, _rx) = core();
        core.listen(vec!["N0CALL".into()], None);
        assert!(core.drain_outbound().is_empty()); // port count unknown yet

        core.handle_frame(port_info("2;Port1 VHF;Port2 UHF"), Instant::now());
        let out = core.drain_outbound();
        // A 'g' query per port, then the queued registration on each.
        assert_eq!(kinds(&out), vec!['g', 'g', 'X', 'X']);
        assert_eq!(out[2].call_from, "N0CALL");
        assert_eq!(out[2].port, 0);
        assert_eq!(out[3].port, 1);
    }

    #[test]
    fn test_listen_explicit_ports_skips_port_count() {
        let (mut core, _rx) = core();
        core.listen(vec!["N0CALL".into(), "N0CALL-1".into()], Some(vec![2]));
        let out = core.drain_outbound();
        assert_eq!(kinds(&out), vec!['X', 'X']);
        assert_eq!(out[1].call_from, "N0CALL-1");
        assert_eq!(out[1].port, 2);
    }

    #[test]
    fn test_register_reply_emits_listening_or_error() {
        let (mut core, _rx) = core();
        let mut ok = Frame::addressed(0, DataKind::Register, "N0CALL", "", vec![1]);
        core.handle_frame(ok.clone(), Instant::now());
        assert!(matches!(
            core.drain_events().as_slice(),
            [EngineEvent::Listening { port: 0, my_call }] if my_call == "N0CALL"
        ));

        ok.data = vec![0];
        core.handle_frame(ok, Instant::now());
        assert!(matches!(
            core.drain_events().as_slice(),
            [EngineEvent::Error { kind: ErrorKind::Registration, .. }]
        ));
    }

    #[test]
    fn test_connect_creates_connection_and_queries_backlog() {
        let (mut core, _rx) = core();
        core.handle_frame(connect_frame(0), Instant::now());

        let events = core.drain_events();
        assert!(matches!(events.as_slice(), [EngineEvent::Connection(_)]));
        // Port backlog query from the new port client, then the
        // connection's own query routed through the port throttle.
        assert_eq!(kinds(&core.drain_outbound()), vec!['y', 'Y']);
    }

    #[test]
    fn test_data_for_unknown_connection_is_ignored() {
        let (mut core, _rx) = core();
        let data = Frame::text(0, DataKind::Data, "KE9YQ", "N0CALL", "hello");
        core.handle_frame(data, Instant::now());
        assert!(core.drain_events().is_empty());
        // Only the lazily created port client's backlog query goes out.
        assert_eq!(kinds(&core.drain_outbound()), vec!['y']);
    }

    #[tokio::test]
    async fn test_inbound_data_reaches_connection_handle() {
        let (mut core, _rx) = core();
        core.handle_frame(connect_frame(0), Instant::now());
        let mut events = core.drain_events();
        let Some(EngineEvent::Connection(mut conn)) = events.pop() else {
            panic!("expected connection event");
        };

        let data = Frame::text(0, DataKind::Data, "KE9YQ", "N0CALL", "hello");
        core.handle_frame(data, Instant::now());
        assert_eq!(conn.recv().await, Some(b"hello".to_vec()));
        assert_eq!(conn.their_call(), "KE9YQ");
        assert_eq!(conn.my_call(), "N0CALL");
    }

    #[tokio::test]
    async fn test_local_end_flushes_data_before_disconnect() {
        let (mut core, _rx) = core();
        core.handle_frame(connect_frame(0), Instant::now());
        core.drain_outbound();
        core.drain_events();

        let key = conn_key(0);
        let now = Instant::now();
        core.conn_cmd(key.clone(), ConnCmd::Write(b"abc".to_vec()), now);
        core.conn_cmd(key.clone(), ConnCmd::End, now);

        // The buffered data goes out at once; the disconnect waits
        // until the engine reports its queue empty.
        let out = core.drain_outbound();
        assert_eq!(kinds(&out), vec!['D']);
        assert_eq!(out[0].data, b"abc");
        assert_eq!(out[0].call_from, "N0CALL");
        assert_eq!(out[0].call_to, "KE9YQ");

        let report = Frame::addressed(0, DataKind::ConnBacklog, "N0CALL", "KE9YQ", vec![0; 4]);
        core.handle_frame(report, now);
        assert_eq!(kinds(&core.drain_outbound()), vec!['d']);
    }

    #[tokio::test]
    async fn test_remote_disconnect_suppresses_local_disconnect_frame() {
        let (mut core, _rx) = core();
        core.handle_frame(connect_frame(0), Instant::now());
        core.drain_outbound();
        let mut events = core.drain_events();
        let Some(EngineEvent::Connection(mut conn)) = events.pop() else {
            panic!("expected connection event");
        };

        let bye = Frame::addressed(0, DataKind::Disconnect, "KE9YQ", "N0CALL", Vec::new());
        core.handle_frame(bye, Instant::now());

        // No 'd' goes out, and the reader sees EOF.
        assert_eq!(kinds(&core.drain_outbound()), Vec::<char>::new());
        assert_eq!(conn.recv().await, None);
    }

    #[test]
    fn test_write_batches_until_deadline() {
        let (mut core, _rx) = core();
        core.handle_frame(connect_frame(0), Instant::now());
        core.drain_outbound();
        core.drain_events();

        let key = conn_key(0);
        let now = Instant::now();
        core.conn_cmd(key.clone(), ConnCmd::Write(b"ab".to_vec()), now);
        assert!(core.drain_outbound().is_empty());
        let deadline = core.next_batch_deadline().expect("deadline pending");

        core.expire_batches(deadline);
        let out = core.drain_outbound();
        assert_eq!(kinds(&out), vec!['D']);
        assert_eq!(out[0].data, b"ab");
        assert_eq!(core.next_batch_deadline(), None);
    }

    #[test]
    fn test_connection_removed_after_drain_completes() {
        let (mut core, _rx) = core();
        core.handle_frame(connect_frame(0), Instant::now());
        core.drain_outbound();
        core.drain_events();

        let key = conn_key(0);
        let now = Instant::now();
        // Saturate the connection throttle so the disconnect must wait.
        for _ in 0..9 {
            core.conn_cmd(key.clone(), ConnCmd::Write(vec![b'x'; 8]), now);
        }
        core.conn_cmd(key.clone(), ConnCmd::End, now);
        let sent = core.drain_outbound();
        assert!(!sent.iter().any(|f| f.kind == DataKind::Disconnect));
        assert!(core.record_mut(&key).is_some());

        // The engine reports the connection queue empty twice: the
        // first releases the held data frame, the second lets the
        // disconnect through and the record goes away.
        let report = Frame::addressed(0, DataKind::ConnBacklog, "N0CALL", "KE9YQ", vec![0; 4]);
        core.handle_frame(report.clone(), Instant::now());
        core.handle_frame(report, Instant::now());
        assert!(core.record_mut(&key).is_none());

        // The port throttle saturated as well; its own report drains
        // the disconnect out to the socket.
        let mut port_report = Frame::control(DataKind::PortBacklog, 0);
        port_report.data = vec![0; 4];
        core.handle_frame(port_report, Instant::now());
        assert!(core
            .drain_outbound()
            .iter()
            .any(|f| f.kind == DataKind::Disconnect));
    }

    #[test]
    fn test_transport_close_emits_closed_event() {
        let (mut core, _rx) = core();
        core.handle_frame(connect_frame(0), Instant::now());
        core.drain_events();
        core.handle_transport_close();
        core.handle_transport_close(); // idempotent
        assert!(matches!(
            core.drain_events().as_slice(),
            [EngineEvent::Closed]
        ));
    }
}
