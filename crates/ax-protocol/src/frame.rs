//! AGWPE frame model
//!
//! An AGWPE frame is a 36-byte header followed by a payload whose length
//! is carried in the header. Field offsets:
//!
//! | offset | field      | format                      |
//! |--------|------------|-----------------------------|
//! | 0      | port       | u8                          |
//! | 4      | data kind  | ASCII char                  |
//! | 6      | PID        | u8 (0xF0 = none)            |
//! | 8..18  | call from  | ASCII, NUL padded           |
//! | 18..28 | call to    | ASCII, NUL padded           |
//! | 28     | data length| u32 little-endian           |
//! | 32     | user       | u32 little-endian           |
//!
//! All other header bytes are zero.

use crate::error::FrameError;
use crate::{CALL_LEN, HEADER_LEN, NO_PID};

/// Frame-type discriminator (the header's ASCII "data kind" byte).
///
/// Only the kinds the engine core interprets get their own variant;
/// everything else (monitor traffic, raw AX.25, version reports) is
/// carried through as [`DataKind::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    /// `G` — request or report the number of ports (semicolon-delimited text)
    PortInfo,
    /// `g` — request or report one port's capabilities
    PortCaps,
    /// `X` — register a call sign; reply carries a 1-byte success flag
    Register,
    /// `C` — an AX.25 connection was established
    Connect,
    /// `D` — connected data
    Data,
    /// `d` — disconnect
    Disconnect,
    /// `y` — query or report frames waiting to transmit on a port
    PortBacklog,
    /// `Y` — query or report frames waiting to transmit on a connection
    ConnBacklog,
    /// `M` — send unproto (connectionless) data
    Unproto,
    /// Any other kind; passed through or logged, never interpreted
    Other(u8),
}

impl DataKind {
    /// The wire byte for this kind.
    pub fn code(self) -> u8 {
        match self {
            DataKind::PortInfo => b'G',
            DataKind::PortCaps => b'g',
            DataKind::Register => b'X',
            DataKind::Connect => b'C',
            DataKind::Data => b'D',
            DataKind::Disconnect => b'd',
            DataKind::PortBacklog => b'y',
            DataKind::ConnBacklog => b'Y',
            DataKind::Unproto => b'M',
            DataKind::Other(code) => code,
        }
    }

    /// Map a wire byte to a kind.
    pub fn from_code(code: u8) -> Self {
        match code {
            b'G' => DataKind::PortInfo,
            b'g' => DataKind::PortCaps,
            b'X' => DataKind::Register,
            b'C' => DataKind::Connect,
            b'D' => DataKind::Data,
            b'd' => DataKind::Disconnect,
            b'y' => DataKind::PortBacklog,
            b'Y' => DataKind::ConnBacklog,
            b'M' => DataKind::Unproto,
            other => DataKind::Other(other),
        }
    }

    /// The kind as a printable character, for logs.
    pub fn as_char(self) -> char {
        let code = self.code();
        if code.is_ascii_graphic() {
            code as char
        } else {
            '?'
        }
    }
}

/// One AGWPE protocol message, decoded.
///
/// Call signs are held unpadded; an absent call sign is the empty string.
/// An absent PID is [`NO_PID`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Physical port index
    pub port: u8,
    /// Frame-type discriminator
    pub kind: DataKind,
    /// AX.25 protocol ID
    pub pid: u8,
    /// Originating call sign ("" when absent)
    pub call_from: String,
    /// Destination call sign ("" when absent)
    pub call_to: String,
    /// Engine-defined 32-bit value
    pub user: u32,
    /// Payload bytes (may be empty)
    pub data: Vec<u8>,
}

impl Frame {
    /// A frame with no call signs and no payload (port-level control).
    pub fn control(kind: DataKind, port: u8) -> Self {
        Frame {
            port,
            kind,
            pid: NO_PID,
            call_from: String::new(),
            call_to: String::new(),
            user: 0,
            data: Vec::new(),
        }
    }

    /// A frame addressed between two call signs, carrying raw bytes.
    pub fn addressed(
        port: u8,
        kind: DataKind,
        call_from: impl Into<String>,
        call_to: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Frame {
            port,
            kind,
            pid: NO_PID,
            call_from: call_from.into(),
            call_to: call_to.into(),
            user: 0,
            data,
        }
    }

    /// An addressed frame carrying UTF-8 text.
    pub fn text(
        port: u8,
        kind: DataKind,
        call_from: impl Into<String>,
        call_to: impl Into<String>,
        text: &str,
    ) -> Self {
        Self::addressed(port, kind, call_from, call_to, text.as_bytes().to_vec())
    }

    /// Encode to wire format: header followed by payload,
    /// exactly `HEADER_LEN + data.len()` bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut wire = vec![0u8; HEADER_LEN + self.data.len()];
        wire[0] = self.port;
        wire[4] = self.kind.code();
        wire[6] = self.pid;
        write_call(&mut wire[8..8 + CALL_LEN], &self.call_from)?;
        write_call(&mut wire[18..18 + CALL_LEN], &self.call_to)?;
        wire[28..32].copy_from_slice(&(self.data.len() as u32).to_le_bytes());
        wire[32..36].copy_from_slice(&self.user.to_le_bytes());
        wire[HEADER_LEN..].copy_from_slice(&self.data);
        Ok(wire)
    }

    /// Decode a header into a frame with an empty payload.
    ///
    /// Fails when `header` is structurally too short to be a header.
    pub fn parse_header(header: &[u8]) -> Result<Frame, FrameError> {
        if header.len() < HEADER_LEN {
            return Err(FrameError::TruncatedHeader {
                actual: header.len(),
                expected: HEADER_LEN,
            });
        }
        Ok(Frame {
            port: header[0],
            kind: DataKind::from_code(header[4]),
            pid: header[6],
            call_from: read_call(&header[8..8 + CALL_LEN]),
            call_to: read_call(&header[18..18 + CALL_LEN]),
            user: u32::from_le_bytes([header[32], header[33], header[34], header[35]]),
            data: Vec::new(),
        })
    }

    /// The payload length declared by an encoded header.
    pub(crate) fn declared_data_len(header: &[u8]) -> usize {
        u32::from_le_bytes([header[28], header[29], header[30], header[31]]) as usize
    }
}

fn write_call(field: &mut [u8], call: &str) -> Result<(), FrameError> {
    if !call.is_ascii() {
        return Err(FrameError::CallSignNotAscii(call.to_string()));
    }
    if call.len() > field.len() {
        return Err(FrameError::CallSignTooLong(call.to_string()));
    }
    field[..call.len()].copy_from_slice(call.as_bytes());
    Ok(())
}

fn read_call(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_round_trip() {
        for code in 0u8..=255 {
            assert_eq!(DataKind::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_encode_layout() {
        let frame = Frame {
            port: 2,
            kind: DataKind::Data,
            pid: NO_PID,
            call_from: "N0CALL".into(),
            call_to: "KE9YQ-1".into(),
            user: 7,
            data: b"hi".to_vec(),
        };
        let wire = frame.encode().unwrap();
        assert_eq!(wire.len(), HEADER_LEN + 2);
        assert_eq!(wire[0], 2);
        assert_eq!(wire[4], b'D');
        assert_eq!(wire[6], NO_PID);
        assert_eq!(&wire[8..14], b"N0CALL");
        assert_eq!(wire[14], 0);
        assert_eq!(&wire[18..25], b"KE9YQ-1");
        assert_eq!(&wire[28..32], &2u32.to_le_bytes());
        assert_eq!(&wire[32..36], &7u32.to_le_bytes());
        assert_eq!(&wire[36..], b"hi");
    }

    #[test]
    fn test_call_sign_too_long() {
        let mut frame = Frame::control(DataKind::Register, 0);
        frame.call_from = "WAY2LONGCALL".into();
        assert_eq!(
            frame.encode(),
            Err(FrameError::CallSignTooLong("WAY2LONGCALL".into()))
        );
    }

    #[test]
    fn test_short_header_rejected() {
        let err = Frame::parse_header(&[0u8; 35]).unwrap_err();
        assert_eq!(
            err,
            FrameError::TruncatedHeader {
                actual: 35,
                expected: HEADER_LEN
            }
        );
    }

    #[test]
    fn test_absent_fields_normalize() {
        let wire = Frame::control(DataKind::PortInfo, 0).encode().unwrap();
        let parsed = Frame::parse_header(&wire).unwrap();
        assert_eq!(parsed.call_from, "");
        assert_eq!(parsed.call_to, "");
        assert_eq!(parsed.pid, NO_PID);
        assert_eq!(parsed.user, 0);
    }
}
