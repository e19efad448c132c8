//! STOMP frame encoding and decoding.

use bytes::{BufMut, Bytes, BytesMut};

use super::{HeartBeat, JSON_CONTENT_TYPE, STOMP_VERSION};

/// STOMP commands used by the sync channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // Client frames
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,

    // Server frames
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED headers are never escaped
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl TryFrom<&str> for Command {
    type Error = FrameError;

    fn try_from(value: &str) -> Result<Self, FrameError> {
        match value {
            "CONNECT" => Ok(Command::Connect),
            "STOMP" => Ok(Command::Stomp),
            "SEND" => Ok(Command::Send),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            "DISCONNECT" => Ok(Command::Disconnect),
            "CONNECTED" => Ok(Command::Connected),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            other => Err(FrameError::UnknownCommand(other.to_string())),
        }
    }
}

/// Frame codec errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("Unknown STOMP command: {0}")]
    UnknownCommand(String),

    #[error("Malformed header line: {0}")]
    MalformedHeader(String),

    #[error("Invalid header escape sequence: \\{0}")]
    InvalidEscape(char),

    #[error("Frame is missing the header terminator")]
    Truncated,

    #[error("Body shorter than content-length: expected {0}, got {1}")]
    ShortBody(usize, usize),

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,
}

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header (repeated headers: the first one wins)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Body as text, with any trailing NULs some brokers append removed
    pub fn body_text(&self) -> Result<&str, FrameError> {
        let text = std::str::from_utf8(&self.body).map_err(|_| FrameError::InvalidUtf8)?;
        Ok(text.trim_end_matches('\0'))
    }

    /// CONNECT frame carrying the bearer token
    pub fn connect(host: &str, token: &str, heart_beat: HeartBeat) -> Self {
        Frame::new(Command::Connect)
            .with_header("accept-version", STOMP_VERSION)
            .with_header("host", host)
            .with_header("heart-beat", heart_beat.header_value())
            .with_header("Authorization", format!("Bearer {}", token))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).with_header("id", id)
    }

    /// SEND frame with a JSON body
    pub fn send(destination: &str, body: impl Into<Bytes>) -> Self {
        Frame::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-type", JSON_CONTENT_TYPE)
            .with_body(body)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Frame::new(Command::Disconnect).with_header("receipt", receipt)
    }

    /// Encode into wire bytes (terminated by NUL)
    pub fn encode(&self) -> Bytes {
        let escape = self.command.escapes_headers();
        let mut buf = BytesMut::with_capacity(64 + self.body.len());

        buf.put_slice(self.command.as_str().as_bytes());
        buf.put_u8(b'\n');

        for (name, value) in &self.headers {
            if escape {
                put_escaped(&mut buf, name);
                buf.put_u8(b':');
                put_escaped(&mut buf, value);
            } else {
                buf.put_slice(name.as_bytes());
                buf.put_u8(b':');
                buf.put_slice(value.as_bytes());
            }
            buf.put_u8(b'\n');
        }

        if !self.body.is_empty() && self.header("content-length").is_none() {
            buf.put_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }

        buf.put_u8(b'\n');
        buf.put_slice(&self.body);
        buf.put_u8(0);

        buf.freeze()
    }

    /// Encode as the text payload of a WebSocket message
    pub fn encode_text(&self) -> Result<String, FrameError> {
        String::from_utf8(self.encode().to_vec()).map_err(|_| FrameError::InvalidUtf8)
    }

    /// Decode one frame.
    ///
    /// Returns `Ok(None)` for a heart-beat (only EOLs).
    pub fn decode(data: &[u8]) -> Result<Option<Frame>, FrameError> {
        let start = data
            .iter()
            .position(|b| *b != b'\n' && *b != b'\r')
            .unwrap_or(data.len());
        let data = &data[start..];
        if data.is_empty() || data.iter().all(|b| *b == 0) {
            return Ok(None);
        }

        let mut pos = 0;
        let command_line = next_line(data, &mut pos).ok_or(FrameError::Truncated)?;
        let command = Command::try_from(command_line)?;
        let unescape = command.escapes_headers();

        let mut headers = Vec::new();
        loop {
            let line = next_line(data, &mut pos).ok_or(FrameError::Truncated)?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if unescape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let rest = &data[pos..];
        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .and_then(|(_, v)| v.trim().parse::<usize>().ok());

        let body = match content_length {
            Some(len) => {
                if rest.len() < len {
                    return Err(FrameError::ShortBody(len, rest.len()));
                }
                Bytes::copy_from_slice(&rest[..len])
            }
            None => {
                let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
                Bytes::copy_from_slice(&rest[..end])
            }
        };

        Ok(Some(Frame {
            command,
            headers,
            body,
        }))
    }
}

/// Read one line (EOL is `\n` or `\r\n`) starting at `pos`
fn next_line<'a>(data: &'a [u8], pos: &mut usize) -> Option<&'a str> {
    let rest = &data[*pos..];
    let nl = rest.iter().position(|b| *b == b'\n')?;
    *pos += nl + 1;
    let line = &rest[..nl];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    std::str::from_utf8(line).ok()
}

fn put_escaped(buf: &mut BytesMut, value: &str) {
    for c in value.chars() {
        match c {
            '\\' => buf.put_slice(b"\\\\"),
            '\n' => buf.put_slice(b"\\n"),
            '\r' => buf.put_slice(b"\\r"),
            ':' => buf.put_slice(b"\\c"),
            other => {
                let mut tmp = [0u8; 4];
                buf.put_slice(other.encode_utf8(&mut tmp).as_bytes());
            }
        }
    }
}

fn unescape_header(value: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => return Err(FrameError::InvalidEscape(other)),
            None => return Err(FrameError::InvalidEscape(' ')),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_send_frame() {
        let frame = Frame::send("/app/bookmark/5", r#"{"action":"DELETE","bookmarkId":3}"#);
        let text = frame.encode_text().unwrap();

        assert!(text.starts_with("SEND\n"));
        assert!(text.contains("destination:/app/bookmark/5\n"));
        assert!(text.contains("content-type:application/json\n"));
        assert!(text.contains("content-length:34\n"));
        assert!(text.ends_with("{\"action\":\"DELETE\",\"bookmarkId\":3}\0"));
    }

    #[test]
    fn test_connect_headers_not_escaped() {
        let frame = Frame::connect("localhost", "abcdefghijkl", HeartBeat::default());
        let text = frame.encode_text().unwrap();

        assert!(text.starts_with("CONNECT\n"));
        assert!(text.contains("Authorization:Bearer abcdefghijkl\n"));
        assert!(text.contains("heart-beat:10000,10000\n"));
    }

    #[test]
    fn test_decode_message_frame() {
        let raw = b"MESSAGE\nsubscription:sub-1\ndestination:/topic/bookmark/5\nmessage-id:7\n\n{\"action\":\"CREATE\"}\0";
        let frame = Frame::decode(raw).unwrap().unwrap();

        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.header("subscription"), Some("sub-1"));
        assert_eq!(frame.header("destination"), Some("/topic/bookmark/5"));
        assert_eq!(frame.body_text().unwrap(), "{\"action\":\"CREATE\"}");
    }

    #[test]
    fn test_decode_heartbeat() {
        assert!(Frame::decode(b"\n").unwrap().is_none());
        assert!(Frame::decode(b"\r\n\r\n").unwrap().is_none());
        assert!(Frame::decode(b"").unwrap().is_none());
    }

    #[test]
    fn test_decode_content_length_keeps_nul() {
        let raw = b"MESSAGE\ncontent-length:3\n\na\0b\0";
        let frame = Frame::decode(raw).unwrap().unwrap();
        assert_eq!(&frame.body[..], b"a\0b");
    }

    #[test]
    fn test_decode_crlf_and_leading_heartbeats() {
        let raw = b"\n\nCONNECTED\r\nversion:1.2\r\nheart-beat:0,0\r\n\r\n\0";
        let frame = Frame::decode(raw).unwrap().unwrap();
        assert_eq!(frame.command, Command::Connected);
        assert_eq!(frame.header("version"), Some("1.2"));
    }

    #[test]
    fn test_header_escaping_roundtrip() {
        let frame = Frame::new(Command::Message).with_header("note", "a:b\nc\\d");
        let encoded = frame.encode();
        let text = std::str::from_utf8(&encoded).unwrap();
        assert!(text.contains("note:a\\cb\\nc\\\\d\n"));

        let decoded = Frame::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded.header("note"), Some("a:b\nc\\d"));
    }

    #[test]
    fn test_first_repeated_header_wins() {
        let raw = b"MESSAGE\nfoo:first\nfoo:second\n\n\0";
        let frame = Frame::decode(raw).unwrap().unwrap();
        assert_eq!(frame.header("foo"), Some("first"));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            Frame::decode(b"BOGUS\n\n\0"),
            Err(FrameError::UnknownCommand(_))
        ));
        assert!(matches!(
            Frame::decode(b"MESSAGE\nno-colon\n\n\0"),
            Err(FrameError::MalformedHeader(_))
        ));
        assert!(matches!(
            Frame::decode(b"MESSAGE\nbad:\\t\n\n\0"),
            Err(FrameError::InvalidEscape('t'))
        ));
        assert!(matches!(
            Frame::decode(b"MESSAGE\ncontent-length:10\n\nabc\0"),
            Err(FrameError::ShortBody(10, 4))
        ));
        assert!(matches!(Frame::decode(b"MESSAGE"), Err(FrameError::Truncated)));
    }

    #[test]
    fn test_body_text_strips_trailing_nuls() {
        let frame = Frame::new(Command::Message).with_body(&b"{}\0\0"[..]);
        assert_eq!(frame.body_text().unwrap(), "{}");
    }
}
