//! AGWPE server handle and actor
//!
//! [`AgwServer::connect`] opens the TCP session and spawns the actor
//! task. The actor owns the socket and an [`EngineCore`]; each pass of
//! its select loop feeds one input into the core, then writes out any
//! queued frames and forwards any queued events.

use std::time::Instant;

use ax_protocol::{frame_summary, FrameDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::AgwConfig;
use crate::connection::{ConnCmd, ConnKey};
use crate::engine::{EngineCore, ServerCmd};
use crate::error::{EngineError, ErrorKind};
use crate::events::EngineEvent;

/// How often stalled throttles re-query the engine's queue depth.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

const READ_BUFFER_LEN: usize = 4096;

/// A session with an AGWPE-compatible packet engine.
///
/// Incoming connections, registration results, and errors arrive on
/// the event channel returned by [`connect`](AgwServer::connect).
pub struct AgwServer {
    cmd_tx: mpsc::Sender<ServerCmd>,
    task: JoinHandle<()>,
}

impl AgwServer {
    /// Connect to the engine and spawn the session actor.
    pub async fn connect(
        config: AgwConfig,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>), EngineError> {
        let socket = TcpStream::connect((config.host.as_str(), config.port)).await?;
        info!(host = %config.host, port = config.port, "connected to engine");

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (conn_cmd_tx, conn_cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let core = EngineCore::new(&config, conn_cmd_tx);
        let task = tokio::spawn(run_agw_actor(socket, core, cmd_rx, conn_cmd_rx, event_tx));
        Ok((Self { cmd_tx, task }, event_rx))
    }

    /// Register call signs so remote stations can connect to them.
    ///
    /// With `calls` empty the configured `my_calls` are used; with
    /// `ports` of `None` every port the engine reports is registered.
    pub async fn listen(
        &self,
        calls: Vec<String>,
        ports: Option<Vec<u8>>,
    ) -> Result<(), EngineError> {
        self.send(ServerCmd::Listen { calls, ports }).await
    }

    /// Send one unconnected (UI) frame, outside any connection.
    pub async fn unproto(
        &self,
        port: u8,
        call_from: &str,
        call_to: &str,
        data: Vec<u8>,
    ) -> Result<(), EngineError> {
        self.send(ServerCmd::Unproto {
            port,
            call_from: call_from.to_string(),
            call_to: call_to.to_string(),
            data,
        })
        .await
    }

    /// Shut the session down and wait for the actor to finish.
    pub async fn close(self) {
        let _ = self.cmd_tx.send(ServerCmd::Close).await;
        let _ = self.task.await;
    }

    async fn send(&self, cmd: ServerCmd) -> Result<(), EngineError> {
        self.cmd_tx.send(cmd).await.map_err(|_| EngineError::Closed)
    }
}

async fn run_agw_actor(
    socket: TcpStream,
    mut core: EngineCore,
    mut cmd_rx: mpsc::Receiver<ServerCmd>,
    mut conn_cmd_rx: mpsc::Receiver<(ConnKey, ConnCmd)>,
    event_tx: mpsc::Sender<EngineEvent>,
) {
    let (mut read_half, mut write_half) = socket.into_split();
    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; READ_BUFFER_LEN];
    let mut poll = interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    core.start();
    if !flush(&mut core, &mut write_half, &event_tx).await {
        return;
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut read_buf) => match result {
                Ok(0) => {
                    debug!("engine closed the socket");
                    core.handle_transport_close();
                    flush(&mut core, &mut write_half, &event_tx).await;
                    break;
                }
                Ok(n) => {
                    decoder.push_bytes(&read_buf[..n]);
                    let now = Instant::now();
                    while let Some(frame) = decoder.next_frame() {
                        core.handle_frame(frame, now);
                    }
                }
                Err(err) => {
                    warn!(%err, "engine socket read failed");
                    let _ = event_tx
                        .send(EngineEvent::Error {
                            kind: ErrorKind::Transport,
                            source: "engine".to_string(),
                            message: err.to_string(),
                        })
                        .await;
                    core.handle_transport_close();
                    flush(&mut core, &mut write_half, &event_tx).await;
                    break;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(ServerCmd::Listen { calls, ports }) => core.listen(calls, ports),
                Some(ServerCmd::Unproto { port, call_from, call_to, data }) => {
                    core.unproto(port, &call_from, &call_to, data);
                }
                // Close, or the server handle was dropped.
                Some(ServerCmd::Close) | None => {
                    debug!("session closing");
                    core.handle_transport_close();
                    flush(&mut core, &mut write_half, &event_tx).await;
                    break;
                }
            },
            Some((key, cmd)) = conn_cmd_rx.recv() => {
                core.conn_cmd(key, cmd, Instant::now());
            }
            _ = poll.tick() => core.poll_tick(),
            _ = batch_timer(core.next_batch_deadline()) => {
                core.expire_batches(Instant::now());
            }
        }
        if !flush(&mut core, &mut write_half, &event_tx).await {
            break;
        }
    }
}

/// Sleep until the given deadline, or forever when there is none.
async fn batch_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Write out the core's queued frames and forward its queued events.
/// Returns false when the socket write fails, which ends the session.
async fn flush(
    core: &mut EngineCore,
    write_half: &mut OwnedWriteHalf,
    event_tx: &mpsc::Sender<EngineEvent>,
) -> bool {
    let mut ok = true;
    for frame in core.drain_outbound() {
        trace!(frame = %frame_summary(&frame), "to engine");
        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                let _ = event_tx
                    .send(EngineEvent::Error {
                        kind: ErrorKind::Format,
                        source: "engine".to_string(),
                        message: err.to_string(),
                    })
                    .await;
                continue;
            }
        };
        if let Err(err) = write_half.write_all(&encoded).await {
            warn!(%err, "engine socket write failed");
            let _ = event_tx
                .send(EngineEvent::Error {
                    kind: ErrorKind::Transport,
                    source: "engine".to_string(),
                    message: err.to_string(),
                })
                .await;
            core.handle_transport_close();
            ok = false;
            break;
        }
    }
    for event in core.drain_events() {
        let _ = event_tx.send(event).await;
    }
    ok
}
