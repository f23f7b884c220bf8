//! VARA modem session handle and actor
//!
//! VARA uses two TCP sockets: a control socket speaking CR-terminated
//! command lines and a data socket carrying raw connection payload.
//! The actor owns both. Commands go out one at a time; a command that
//! expects a reply blocks the queue until that reply (or `WRONG`)
//! arrives. The modem holds one connection at a time, so there is no
//! routing or frame throttling here; flow control is the modem's
//! `BUFFER` reports, which also gate the graceful disconnect.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::time::Duration;

use ax_protocol::{LineReader, VaraCommand, VaraReply};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::VaraConfig;
use crate::connection::{ConnCmd, ConnKey, ConnSignal, Connection, RECV_BUFFER_FRAMES};
use crate::error::{EngineError, ErrorKind};
use crate::events::EngineEvent;

const READ_BUFFER_LEN: usize = 4096;

/// Modems usually answer within a second; anything longer means the
/// control link is wedged.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum VaraCmd {
    Close,
}

/// A session with a VARA modem.
///
/// The handshake (`VERSION`, `MYCALL`, `LISTEN ON`) runs as soon as the
/// actor starts; incoming connections then arrive on the event channel.
pub struct VaraServer {
    cmd_tx: mpsc::Sender<VaraCmd>,
    task: JoinHandle<()>,
}

impl VaraServer {
    /// Connect to the modem's control socket and spawn the session
    /// actor. A refused or timed-out connection is returned as an
    /// error; the modem is not there.
    pub async fn connect(
        config: VaraConfig,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>), EngineError> {
        let control = tokio::time::timeout(
            CONTROL_TIMEOUT,
            TcpStream::connect((config.host.as_str(), config.control_port)),
        )
        .await
        .map_err(|_| {
            EngineError::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "control socket connect timed out",
            ))
        })??;
        info!(host = %config.host, port = config.control_port, "connected to modem");

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (conn_cmd_tx, conn_cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let task = tokio::spawn(run_vara_actor(
            control,
            config,
            cmd_rx,
            conn_cmd_rx,
            conn_cmd_tx,
            event_tx,
        ));
        Ok((Self { cmd_tx, task }, event_rx))
    }

    /// Shut the session down and wait for the actor to finish.
    pub async fn close(self) {
        let _ = self.cmd_tx.send(VaraCmd::Close).await;
        let _ = self.task.await;
    }
}

/// One established connection's actor-side state.
struct ActiveConn {
    key: ConnKey,
    signal_tx: mpsc::Sender<ConnSignal>,
    /// Bytes written to the modem and not yet reported transmitted
    buffered: u32,
}

struct VaraActor {
    config: VaraConfig,
    event_tx: mpsc::Sender<EngineEvent>,
    conn_cmd_tx: mpsc::Sender<(ConnKey, ConnCmd)>,
    ctrl_wr: OwnedWriteHalf,
    lines: LineReader,
    /// Commands not yet sent; the head goes out once `waiting_for`
    /// clears
    cmd_queue: VecDeque<VaraCommand>,
    /// Reply token the last sent command is waiting for
    waiting_for: Option<&'static str>,
    data_rd: Option<OwnedReadHalf>,
    data_wr: Option<OwnedWriteHalf>,
    active: Option<ActiveConn>,
    /// The modem reported `CONNECTED` and no `DISCONNECTED` yet
    is_connected: bool,
    /// A graceful close waits for `BUFFER 0` before disconnecting
    ending_data: bool,
}

enum Input {
    Control(std::io::Result<usize>),
    Data(std::io::Result<usize>),
    Cmd(Option<VaraCmd>),
    Conn(Option<(ConnKey, ConnCmd)>),
}

async fn run_vara_actor(
    control: TcpStream,
    config: VaraConfig,
    mut cmd_rx: mpsc::Receiver<VaraCmd>,
    mut conn_cmd_rx: mpsc::Receiver<(ConnKey, ConnCmd)>,
    conn_cmd_tx: mpsc::Sender<(ConnKey, ConnCmd)>,
    event_tx: mpsc::Sender<EngineEvent>,
) {
    let (mut ctrl_rd, ctrl_wr) = control.into_split();
    let mut actor = VaraActor {
        config,
        event_tx,
        conn_cmd_tx,
        ctrl_wr,
        lines: LineReader::new(),
        cmd_queue: VecDeque::new(),
        waiting_for: None,
        data_rd: None,
        data_wr: None,
        active: None,
        is_connected: false,
        ending_data: false,
    };
    let mut ctrl_buf = vec![0u8; 1024];
    let mut data_buf = vec![0u8; READ_BUFFER_LEN];

    actor.queue_handshake().await;

    loop {
        let input = tokio::select! {
            result = ctrl_rd.read(&mut ctrl_buf) => Input::Control(result),
            result = read_data(actor.data_rd.as_mut(), &mut data_buf) => Input::Data(result),
            cmd = cmd_rx.recv() => Input::Cmd(cmd),
            cmd = conn_cmd_rx.recv() => Input::Conn(cmd),
        };
        match input {
            Input::Control(Ok(n)) if n > 0 => {
                actor.lines.push_bytes(&ctrl_buf[..n]);
                let mut fatal = false;
                while let Some(line) = actor.lines.next_line() {
                    if actor.handle_line(&line).await.is_break() {
                        fatal = true;
                        break;
                    }
                }
                if fatal {
                    actor.shutdown().await;
                    break;
                }
            }
            Input::Control(result) => {
                if let Err(err) = &result {
                    warn!(%err, "control socket read failed");
                }
                match actor.reconnect().await {
                    Some(read_half) => ctrl_rd = read_half,
                    None => break,
                }
            }
            Input::Data(Ok(n)) if n > 0 => actor.deliver_data(&data_buf[..n]).await,
            Input::Data(result) => {
                if let Err(err) = &result {
                    warn!(%err, "data socket read failed");
                }
                debug!("data socket closed");
                actor.data_rd = None;
                actor.data_wr = None;
                actor.disconnect_data(None).await;
            }
            Input::Cmd(Some(VaraCmd::Close)) | Input::Cmd(None) => {
                debug!("session closing");
                actor.shutdown().await;
                break;
            }
            Input::Conn(Some((key, cmd))) => actor.handle_conn_cmd(key, cmd).await,
            // The actor itself holds a sender, so this never closes.
            Input::Conn(None) => {}
        }
    }
}

/// Read from the data socket, or park forever while there is none.
async fn read_data(
    read_half: Option<&mut OwnedReadHalf>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match read_half {
        Some(read_half) => read_half.read(buf).await,
        None => std::future::pending().await,
    }
}

impl VaraActor {
    async fn queue_handshake(&mut self) {
        self.cmd_queue.push_back(VaraCommand::Version);
        self.cmd_queue
            .push_back(VaraCommand::MyCall(self.config.my_calls.clone()));
        self.cmd_queue.push_back(VaraCommand::ListenOn);
        self.flush_commands().await;
    }

    /// Send queued commands until one that expects a reply is in
    /// flight. Write failures surface through the control read side.
    async fn flush_commands(&mut self) {
        while self.waiting_for.is_none() {
            let Some(cmd) = self.cmd_queue.pop_front() else {
                break;
            };
            debug!(line = %cmd.line(), "to modem");
            self.waiting_for = cmd.expected_reply();
            let line = format!("{}\r", cmd.line());
            if let Err(err) = self.ctrl_wr.write_all(line.as_bytes()).await {
                warn!(%err, "control socket write failed");
                break;
            }
        }
    }

    /// Dispatch one control line. `Break` means the session is over.
    async fn handle_line(&mut self, line: &str) -> ControlFlow<()> {
        let reply = VaraReply::parse(line);
        if reply.is_chatter() {
            trace!(line, "from modem");
        } else {
            debug!(line, "from modem");
        }

        if let Some(expected) = self.waiting_for {
            // WRONG rejects the command but still unblocks the queue.
            if reply.token() == expected || matches!(reply, VaraReply::Wrong(_)) {
                self.waiting_for = None;
                self.flush_commands().await;
            }
        }

        match reply {
            VaraReply::Pending => self.ensure_data_socket().await,
            VaraReply::CancelPending => {
                if !self.is_connected {
                    self.disconnect_data(None).await;
                }
            }
            VaraReply::Connected {
                their_call,
                my_call,
            } => self.attach_connection(their_call, my_call).await,
            VaraReply::Disconnected(reason) => {
                self.is_connected = false;
                self.disconnect_data(reason).await;
            }
            VaraReply::Buffer(n) => {
                if let Some(active) = &mut self.active {
                    active.buffered = n;
                }
                if self.ending_data && n == 0 {
                    self.disconnect_data(None).await;
                }
            }
            VaraReply::Missing(message) => {
                // Usually an unregistered call sign; nothing will work
                // until the configuration is fixed.
                let _ = self
                    .event_tx
                    .send(EngineEvent::Error {
                        kind: ErrorKind::Protocol,
                        source: "modem".to_string(),
                        message: format!("MISSING {message}"),
                    })
                    .await;
                return ControlFlow::Break(());
            }
            VaraReply::Wrong(message) => {
                warn!(message, "modem rejected the last command");
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }

    /// Open the data socket ahead of the `CONNECTED` report.
    async fn ensure_data_socket(&mut self) {
        if self.data_wr.is_some() {
            return;
        }
        match TcpStream::connect((self.config.host.as_str(), self.config.data_port)).await {
            Ok(socket) => {
                debug!(port = self.config.data_port, "data socket connected");
                let (read_half, write_half) = socket.into_split();
                self.data_rd = Some(read_half);
                self.data_wr = Some(write_half);
            }
            Err(err) => {
                warn!(%err, "data socket connect failed");
                let _ = self
                    .event_tx
                    .send(EngineEvent::Error {
                        kind: ErrorKind::Transport,
                        source: "modem data socket".to_string(),
                        message: err.to_string(),
                    })
                    .await;
            }
        }
    }

    async fn attach_connection(&mut self, their_call: String, my_call: String) {
        self.ensure_data_socket().await;
        // Unhook the stale stream if a previous cycle left one behind.
        if let Some(old) = self.active.take() {
            let _ = old.signal_tx.try_send(ConnSignal::Eof);
        }
        let key = ConnKey {
            port: 0,
            their_call,
            my_call,
        };
        info!(%key, "connection established");
        let (signal_tx, signal_rx) = mpsc::channel(RECV_BUFFER_FRAMES);
        let conn = Connection::new(key.clone(), signal_rx, self.conn_cmd_tx.clone());
        self.active = Some(ActiveConn {
            key,
            signal_tx,
            buffered: 0,
        });
        self.is_connected = true;
        self.ending_data = false;
        let _ = self.event_tx.send(EngineEvent::Connection(conn)).await;
    }

    async fn deliver_data(&mut self, data: &[u8]) {
        let Some(active) = &self.active else {
            trace!(len = data.len(), "data with no active connection");
            return;
        };
        match active.signal_tx.try_send(ConnSignal::Data(data.to_vec())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(key = %active.key, "receive buffer full, dropping data");
                let _ = self
                    .event_tx
                    .send(EngineEvent::Error {
                        kind: ErrorKind::Overflow,
                        source: active.key.to_string(),
                        message: "receive buffer full, data dropped".to_string(),
                    })
                    .await;
            }
            // The application dropped its handle: close the link once
            // the modem's buffer drains.
            Err(TrySendError::Closed(_)) => self.end_active().await,
        }
    }

    async fn handle_conn_cmd(&mut self, key: ConnKey, cmd: ConnCmd) {
        if !self.active.as_ref().is_some_and(|a| a.key == key) {
            trace!(%key, "command for closed connection dropped");
            return;
        }
        match cmd {
            ConnCmd::Write(data) => {
                let Some(write_half) = self.data_wr.as_mut() else {
                    warn!(%key, "write with no data socket");
                    return;
                };
                if let Err(err) = write_half.write_all(&data).await {
                    warn!(%err, "data socket write failed");
                    let _ = self
                        .event_tx
                        .send(EngineEvent::Error {
                            kind: ErrorKind::Transport,
                            source: key.to_string(),
                            message: err.to_string(),
                        })
                        .await;
                    self.data_rd = None;
                    self.data_wr = None;
                    self.disconnect_data(None).await;
                } else if let Some(active) = &mut self.active {
                    active.buffered = active.buffered.saturating_add(data.len() as u32);
                }
            }
            ConnCmd::End => self.end_active().await,
            ConnCmd::Destroy => self.disconnect_data(None).await,
        }
    }

    /// Graceful close: disconnect now if the modem's buffer is empty,
    /// otherwise wait for a `BUFFER 0` report.
    async fn end_active(&mut self) {
        let buffered = self.active.as_ref().map_or(0, |a| a.buffered);
        if buffered == 0 {
            self.disconnect_data(None).await;
        } else {
            debug!(buffered, "waiting for modem buffer to drain");
            self.ending_data = true;
        }
    }

    /// Tear down the data phase: tell the modem to disconnect if it
    /// still considers the link up, EOF the reader, drop the sockets.
    async fn disconnect_data(&mut self, reason: Option<String>) {
        if self.is_connected {
            self.is_connected = false;
            self.cmd_queue.push_back(VaraCommand::Disconnect);
            self.flush_commands().await;
        }
        self.ending_data = false;
        if let Some(active) = self.active.take() {
            match &reason {
                Some(reason) => info!(key = %active.key, reason, "connection closed"),
                None => info!(key = %active.key, "connection closed"),
            }
            let _ = active.signal_tx.try_send(ConnSignal::Eof);
        }
        self.data_rd = None;
        self.data_wr = None;
    }

    /// The control socket dropped. Dial again and replay the
    /// handshake; a refused or timed-out connect means the modem is
    /// gone and the session ends.
    async fn reconnect(&mut self) -> Option<OwnedReadHalf> {
        warn!("control socket lost, reconnecting");
        match TcpStream::connect((self.config.host.as_str(), self.config.control_port)).await {
            Ok(socket) => {
                info!("control socket reconnected");
                let (read_half, write_half) = socket.into_split();
                self.ctrl_wr = write_half;
                self.lines = LineReader::new();
                self.waiting_for = None;
                self.cmd_queue.clear();
                self.queue_handshake().await;
                Some(read_half)
            }
            Err(err) => {
                warn!(%err, "control socket reconnect failed");
                let _ = self
                    .event_tx
                    .send(EngineEvent::Error {
                        kind: ErrorKind::Transport,
                        source: "modem".to_string(),
                        message: err.to_string(),
                    })
                    .await;
                self.shutdown().await;
                None
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.signal_tx.try_send(ConnSignal::Eof);
        }
        self.data_rd = None;
        self.data_wr = None;
        let _ = self.event_tx.send(EngineEvent::Closed).await;
    }
}
