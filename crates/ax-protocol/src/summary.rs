//! Log-friendly renderings of frames and payloads
//!
//! Payloads are shown truncated to 32 bytes, with CRs escaped so one
//! log line stays one line. Frame kinds that carry binary counters or
//! flags render their payload as hex instead of text.

use crate::frame::{DataKind, Frame};

const SUMMARY_LEN: usize = 32;

/// Render up to 32 payload bytes as printable text.
pub fn data_summary(data: &[u8]) -> String {
    let shown = &data[..data.len().min(SUMMARY_LEN)];
    let mut out = String::with_capacity(shown.len() + 4);
    for &b in shown {
        match b {
            b'\r' => out.push_str("\\r"),
            0x20..=0x7E => out.push(b as char),
            _ => out.push('.'),
        }
    }
    if data.len() > SUMMARY_LEN {
        out.push_str("...");
    }
    out
}

fn hex_summary(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render a frame for debug logs: kind, port, calls, payload summary.
pub fn frame_summary(frame: &Frame) -> String {
    let mut out = format!("{} port={}", frame.kind.as_char(), frame.port);
    if !frame.call_from.is_empty() {
        out.push_str(&format!(" from={}", frame.call_from));
    }
    if !frame.call_to.is_empty() {
        out.push_str(&format!(" to={}", frame.call_to));
    }
    if frame.user != 0 {
        out.push_str(&format!(" user={}", frame.user));
    }
    if !frame.data.is_empty() {
        let binary_payload = matches!(
            frame.kind,
            DataKind::PortCaps
                | DataKind::Register
                | DataKind::PortBacklog
                | DataKind::ConnBacklog
                | DataKind::Other(b'K')
                | DataKind::Other(b'R')
        );
        if binary_payload && frame.data.len() <= SUMMARY_LEN {
            out.push_str(&format!(" data=[{}]", hex_summary(&frame.data)));
        } else {
            out.push_str(&format!(" data={:?}", data_summary(&frame.data)));
            if frame.data.len() > SUMMARY_LEN {
                out.push_str(&format!(" len={}", frame.data.len()));
            }
        }
    }
    out
}
