//! Simulated AGWPE-compatible engine

use std::io;

use ax_protocol::{DataKind, Frame, FrameDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// A listening simulated engine. Tests connect a client to
/// [`port`](SimTnc::port), then drive the session through
/// [`accept`](SimTnc::accept).
pub struct SimTnc {
    listener: TcpListener,
    num_ports: u8,
}

impl SimTnc {
    /// Bind to an ephemeral local port, simulating two radio ports.
    pub async fn bind() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Self {
            listener,
            num_ports: 2,
        })
    }

    /// The TCP port the simulated engine listens on.
    pub fn port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// How many radio ports the engine reports.
    pub fn set_num_ports(&mut self, num_ports: u8) {
        self.num_ports = num_ports;
    }

    /// Accept one client session.
    pub async fn accept(&self) -> io::Result<TncSession> {
        let (socket, addr) = self.listener.accept().await?;
        debug!(%addr, "simulated engine accepted a client");
        Ok(TncSession {
            socket,
            decoder: FrameDecoder::new(),
            num_ports: self.num_ports,
            read_buf: vec![0u8; 4096],
        })
    }
}

/// One client session on the simulated engine.
pub struct TncSession {
    socket: TcpStream,
    decoder: FrameDecoder,
    num_ports: u8,
    read_buf: Vec<u8>,
}

impl TncSession {
    /// Receive the next frame from the client.
    pub async fn recv_frame(&mut self) -> io::Result<Frame> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                debug!(port = frame.port, kind = %frame.kind.as_char(), "sim received");
                return Ok(frame);
            }
            let n = self.socket.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed the socket",
                ));
            }
            self.decoder.push_bytes(&self.read_buf[..n]);
        }
    }

    /// Send one frame to the client.
    pub async fn send_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let encoded = frame
            .encode()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        self.socket.write_all(&encoded).await
    }

    /// The reply a real engine would give to a query frame, if any.
    pub fn reply_for(&self, frame: &Frame) -> Option<Frame> {
        match frame.kind {
            DataKind::PortInfo => {
                let mut names: Vec<String> = vec![self.num_ports.to_string()];
                for port in 0..self.num_ports {
                    names.push(format!("Port{} Simulated", port + 1));
                }
                let mut reply = Frame::control(DataKind::PortInfo, 0);
                reply.data = names.join(";").into_bytes();
                Some(reply)
            }
            DataKind::PortCaps => {
                let mut reply = Frame::control(DataKind::PortCaps, frame.port);
                reply.data = vec![0; 12];
                Some(reply)
            }
            DataKind::Register => Some(Frame::addressed(
                frame.port,
                DataKind::Register,
                &frame.call_from,
                "",
                vec![1],
            )),
            DataKind::PortBacklog => {
                let mut reply = Frame::control(DataKind::PortBacklog, frame.port);
                reply.data = vec![0; 4];
                Some(reply)
            }
            DataKind::ConnBacklog => Some(Frame::addressed(
                frame.port,
                DataKind::ConnBacklog,
                &frame.call_from,
                &frame.call_to,
                vec![0; 4],
            )),
            _ => None,
        }
    }

    /// Answer `frame` the way a real engine would, if it is a query.
    /// Returns whether a reply was sent.
    pub async fn serve_query(&mut self, frame: &Frame) -> io::Result<bool> {
        match self.reply_for(frame) {
            Some(reply) => {
                self.send_frame(&reply).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Serve queries until a frame of `kind` arrives, and return it.
    pub async fn recv_until(&mut self, kind: DataKind) -> io::Result<Frame> {
        loop {
            let frame = self.recv_frame().await?;
            if frame.kind == kind {
                return Ok(frame);
            }
            self.serve_query(&frame).await?;
        }
    }

    /// Inject an incoming connection from `their_call` to `my_call`.
    pub async fn send_connect(&mut self, port: u8, their_call: &str, my_call: &str) -> io::Result<()> {
        let text = format!("*** CONNECTED To Station {their_call}\r");
        self.send_frame(&Frame::text(
            port,
            DataKind::Connect,
            their_call,
            my_call,
            &text,
        ))
        .await
    }

    /// Inject connection payload from `their_call`.
    pub async fn send_data(
        &mut self,
        port: u8,
        their_call: &str,
        my_call: &str,
        data: &[u8],
    ) -> io::Result<()> {
        self.send_frame(&Frame::addressed(
            port,
            DataKind::Data,
            their_call,
            my_call,
            data.to_vec(),
        ))
        .await
    }

    /// Inject a disconnect from `their_call`.
    pub async fn send_disconnect(
        &mut self,
        port: u8,
        their_call: &str,
        my_call: &str,
    ) -> io::Result<()> {
        self.send_frame(&Frame::addressed(
            port,
            DataKind::Disconnect,
            their_call,
            my_call,
            Vec::new(),
        ))
        .await
    }
}
