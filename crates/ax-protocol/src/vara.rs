//! VARA control-protocol grammar
//!
//! VARA's control socket speaks CR-terminated ASCII lines. Commands go
//! out one at a time; most expect a specific reply keyword before the
//! next command may be sent. Replies are dispatched on their first
//! token, case-insensitively.

/// An outbound control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaraCommand {
    /// `VERSION` — ask the modem for its version string
    Version,
    /// `MYCALL <calls>` — register the local call signs
    MyCall(Vec<String>),
    /// `LISTEN ON` — accept incoming connections
    ListenOn,
    /// `DISCONNECT` — tear down the active connection
    Disconnect,
}

impl VaraCommand {
    /// The command as a wire line, without the trailing CR.
    pub fn line(&self) -> String {
        match self {
            VaraCommand::Version => "VERSION".to_string(),
            VaraCommand::MyCall(calls) => format!("MYCALL {}", calls.join(" ")),
            VaraCommand::ListenOn => "LISTEN ON".to_string(),
            VaraCommand::Disconnect => "DISCONNECT".to_string(),
        }
    }

    /// The reply token this command waits for, if any.
    ///
    /// While a command is waiting, subsequent commands are held in the
    /// queue; a `WRONG` reply also releases the wait.
    pub fn expected_reply(&self) -> Option<&'static str> {
        match self {
            VaraCommand::Version => Some("version"),
            VaraCommand::MyCall(_) => Some("ok"),
            VaraCommand::ListenOn => Some("ok"),
            VaraCommand::Disconnect => None,
        }
    }
}

/// One inbound control line, classified by its first token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaraReply {
    /// An incoming or outgoing connection is being negotiated
    Pending,
    /// Connection negotiation was abandoned
    CancelPending,
    /// `CONNECTED <their> <my>` — the data phase has started
    Connected { their_call: String, my_call: String },
    /// `DISCONNECTED [reason]`
    Disconnected(Option<String>),
    /// `BUFFER <n>` — bytes queued in the modem, not yet transmitted
    Buffer(u32),
    /// `VERSION ...` reply
    Version(String),
    /// `OK`
    Ok,
    /// `WRONG ...` — the last command was rejected
    Wrong(String),
    /// `MISSING ...` — fatal configuration problem
    Missing(String),
    /// `BUSY ON` / `BUSY OFF` — channel busy indication
    Busy(String),
    /// Keep-alive
    IAmAlive,
    /// `PTT ON` / `PTT OFF`
    Ptt(String),
    /// Blank line
    Empty,
    /// Anything else; logged and otherwise ignored
    Other(String),
}

impl VaraReply {
    /// Parse one control line (without its CR terminator).
    pub fn parse(line: &str) -> VaraReply {
        let mut parts = line.split_whitespace();
        let token = parts.next().unwrap_or("").to_ascii_lowercase();
        let rest = || line[token.len()..].trim().to_string();
        match token.as_str() {
            "" => VaraReply::Empty,
            "pending" => VaraReply::Pending,
            "cancelpending" => VaraReply::CancelPending,
            "connected" => VaraReply::Connected {
                their_call: parts.next().unwrap_or("").to_string(),
                my_call: parts.next().unwrap_or("").to_string(),
            },
            "disconnected" => {
                VaraReply::Disconnected(parts.next().map(|reason| reason.to_string()))
            }
            "buffer" => {
                // An unparsable count reads as zero, like the original.
                let n = parts.next().and_then(|n| n.parse().ok()).unwrap_or(0);
                VaraReply::Buffer(n)
            }
            "version" => VaraReply::Version(rest()),
            "ok" => VaraReply::Ok,
            "wrong" => VaraReply::Wrong(rest()),
            "missing" => VaraReply::Missing(rest()),
            "busy" => VaraReply::Busy(rest()),
            "iamalive" => VaraReply::IAmAlive,
            "ptt" => VaraReply::Ptt(rest()),
            _ => VaraReply::Other(line.to_string()),
        }
    }

    /// The first token of the line, lowercased, for reply matching.
    pub fn token(&self) -> &'static str {
        match self {
            VaraReply::Pending => "pending",
            VaraReply::CancelPending => "cancelpending",
            VaraReply::Connected { .. } => "connected",
            VaraReply::Disconnected(_) => "disconnected",
            VaraReply::Buffer(_) => "buffer",
            VaraReply::Version(_) => "version",
            VaraReply::Ok => "ok",
            VaraReply::Wrong(_) => "wrong",
            VaraReply::Missing(_) => "missing",
            VaraReply::Busy(_) => "busy",
            VaraReply::IAmAlive => "iamalive",
            VaraReply::Ptt(_) => "ptt",
            VaraReply::Empty => "",
            VaraReply::Other(_) => "?",
        }
    }

    /// True for the chatty status lines worth only trace-level logging.
    pub fn is_chatter(&self) -> bool {
        matches!(
            self,
            VaraReply::Busy(_) | VaraReply::IAmAlive | VaraReply::Ptt(_)
        )
    }
}

/// Accumulates socket bytes and splits out CR-terminated lines.
#[derive(Debug, Default)]
pub struct LineReader {
    buffer: String,
}

impl LineReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the control socket.
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(data));
    }

    /// Extract the next complete line, without its CR.
    pub fn next_line(&mut self) -> Option<String> {
        let cr = self.buffer.find('\r')?;
        let line = self.buffer[..cr].to_string();
        self.buffer.drain(..=cr);
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tokens_case_insensitive() {
        assert_eq!(VaraReply::parse("PENDING"), VaraReply::Pending);
        assert_eq!(VaraReply::parse("pending"), VaraReply::Pending);
        assert_eq!(VaraReply::parse("Ok"), VaraReply::Ok);
    }

    #[test]
    fn test_parse_connected() {
        assert_eq!(
            VaraReply::parse("CONNECTED KE9YQ N0CALL"),
            VaraReply::Connected {
                their_call: "KE9YQ".into(),
                my_call: "N0CALL".into(),
            }
        );
    }

    #[test]
    fn test_parse_buffer_count() {
        assert_eq!(VaraReply::parse("BUFFER 120"), VaraReply::Buffer(120));
        assert_eq!(VaraReply::parse("BUFFER 0"), VaraReply::Buffer(0));
        assert_eq!(VaraReply::parse("BUFFER junk"), VaraReply::Buffer(0));
    }

    #[test]
    fn test_parse_disconnected_reason() {
        assert_eq!(
            VaraReply::parse("DISCONNECTED TIMEOUT"),
            VaraReply::Disconnected(Some("TIMEOUT".into()))
        );
        assert_eq!(VaraReply::parse("DISCONNECTED"), VaraReply::Disconnected(None));
    }

    #[test]
    fn test_unknown_token_is_other() {
        assert_eq!(
            VaraReply::parse("REGISTERED N0CALL"),
            VaraReply::Other("REGISTERED N0CALL".into())
        );
    }

    #[test]
    fn test_command_lines() {
        assert_eq!(VaraCommand::Version.line(), "VERSION");
        assert_eq!(
            VaraCommand::MyCall(vec!["N0CALL".into(), "N0CALL-1".into()]).line(),
            "MYCALL N0CALL N0CALL-1"
        );
        assert_eq!(VaraCommand::ListenOn.line(), "LISTEN ON");
        assert_eq!(VaraCommand::Disconnect.expected_reply(), None);
    }

    #[test]
    fn test_line_reader_splits_on_cr() {
        let mut reader = LineReader::new();
        reader.push_bytes(b"VERSION 4.");
        assert_eq!(reader.next_line(), None);
        reader.push_bytes(b"8.7\rOK\rPEND");
        assert_eq!(reader.next_line(), Some("VERSION 4.8.7".into()));
        assert_eq!(reader.next_line(), Some("OK".into()));
        assert_eq!(reader.next_line(), None);
        reader.push_bytes(b"ING\r");
        assert_eq!(reader.next_line(), Some("PENDING".into()));
    }
}
