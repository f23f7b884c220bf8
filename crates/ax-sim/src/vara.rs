//! Simulated VARA modem

use std::io;

use ax_protocol::LineReader;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// A listening simulated VARA modem: one control listener, one data
/// listener, both on ephemeral local ports.
pub struct SimVaraModem {
    control: TcpListener,
    data: TcpListener,
}

impl SimVaraModem {
    pub async fn bind() -> io::Result<Self> {
        Ok(Self {
            control: TcpListener::bind("127.0.0.1:0").await?,
            data: TcpListener::bind("127.0.0.1:0").await?,
        })
    }

    /// The TCP port of the control socket.
    pub fn control_port(&self) -> u16 {
        self.control.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// The TCP port of the data socket.
    pub fn data_port(&self) -> u16 {
        self.data.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Accept one control-socket client.
    pub async fn accept_control(&self) -> io::Result<VaraControl> {
        let (socket, addr) = self.control.accept().await?;
        debug!(%addr, "simulated modem accepted a control client");
        Ok(VaraControl {
            socket,
            lines: LineReader::new(),
            read_buf: vec![0u8; 1024],
        })
    }

    /// Accept one data-socket client. The raw stream is returned;
    /// tests read and write connection payload on it directly.
    pub async fn accept_data(&self) -> io::Result<TcpStream> {
        let (socket, addr) = self.data.accept().await?;
        debug!(%addr, "simulated modem accepted a data client");
        Ok(socket)
    }
}

/// One control-socket session on the simulated modem.
pub struct VaraControl {
    socket: TcpStream,
    lines: LineReader,
    read_buf: Vec<u8>,
}

impl VaraControl {
    /// Receive the next CR-terminated command line, without its CR.
    pub async fn recv_line(&mut self) -> io::Result<String> {
        loop {
            if let Some(line) = self.lines.next_line() {
                debug!(line, "sim received");
                return Ok(line);
            }
            let n = self.socket.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed the control socket",
                ));
            }
            self.lines.push_bytes(&self.read_buf[..n]);
        }
    }

    /// Send one control line, appending the CR.
    pub async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.socket.write_all(format!("{line}\r").as_bytes()).await
    }

    /// The reply a real modem gives to a handshake command, if any.
    pub fn reply_for(line: &str) -> Option<&'static str> {
        let token = line.split_whitespace().next().unwrap_or("");
        match token {
            "VERSION" => Some("VERSION 4.8.7"),
            "MYCALL" => Some("OK"),
            "LISTEN" => Some("OK"),
            _ => None,
        }
    }

    /// Serve the standard three-command handshake and return the
    /// command lines received, in order.
    pub async fn run_handshake(&mut self) -> io::Result<Vec<String>> {
        let mut received = Vec::new();
        for _ in 0..3 {
            let line = self.recv_line().await?;
            if let Some(reply) = Self::reply_for(&line) {
                self.send_line(reply).await?;
            }
            received.push(line);
        }
        Ok(received)
    }
}
