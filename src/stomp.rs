//! STOMP 1.2 frame grammar.
//!
//! Covers the subset this client speaks: `CONNECT`/`CONNECTED` handshake,
//! `SUBSCRIBE`/`UNSUBSCRIBE`, inbound `MESSAGE` and `ERROR`, `DISCONNECT`,
//! and heart-beat negotiation. Frames travel as WebSocket text messages; a
//! lone `\n` is a heart-beat, not a frame.
//!
//! Header values are escaped per STOMP 1.2 (`\\`, `\r`, `\n`, `\c`), except
//! on `CONNECT`/`CONNECTED` frames where escaping does not apply.

use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Frame commands this client sends or understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Client handshake request.
    Connect,
    /// Server handshake acknowledgement.
    Connected,
    /// Open a subscription.
    Subscribe,
    /// Close a subscription.
    Unsubscribe,
    /// Publish to a destination.
    Send,
    /// Server-delivered message on a subscription.
    Message,
    /// Fatal server error; the server closes the connection after it.
    Error,
    /// Graceful client goodbye.
    Disconnect,
}

impl Command {
    /// Wire spelling of the command.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Send => "SEND",
            Self::Message => "MESSAGE",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "CONNECT" => Self::Connect,
            "CONNECTED" => Self::Connected,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "SEND" => Self::Send,
            "MESSAGE" => Self::Message,
            "ERROR" => Self::Error,
            "DISCONNECT" => Self::Disconnect,
            other => bail!("unknown STOMP command {other:?}"),
        })
    }

    /// Header escaping applies to every frame except CONNECT and CONNECTED.
    fn escaping_applies(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame.
///
/// Headers keep wire order; repeated names are allowed and [`Self::header`]
/// returns the first occurrence, as STOMP requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// Headers in wire order.
    pub headers: Vec<(String, String)>,
    /// Frame body, empty for most commands.
    pub body: String,
}

impl Frame {
    /// A bodyless, headerless frame.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header, unescaped.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize to wire text: command line, headers, blank line, body,
    /// trailing NUL.
    #[must_use]
    pub fn encode(&self) -> String {
        let escaping = self.command.escaping_applies();
        let mut out = String::new();
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escaping {
                out.push_str(&escape(name));
                out.push(':');
                out.push_str(&escape(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame from wire text.
    ///
    /// # Errors
    ///
    /// Returns an error on an unknown command, a header line without a
    /// colon, or an invalid escape sequence.
    pub fn parse(text: &str) -> Result<Self> {
        // Only the EOLs after the terminating NUL are padding; trailing
        // newlines before it belong to the body.
        let text = text.trim_end_matches(['\n', '\r']);
        let text = text.strip_suffix('\0').unwrap_or(text);
        let mut lines = text.split('\n');

        let command_line = lines.next().context("empty frame")?.trim_end_matches('\r');
        let command = Command::parse(command_line)?;
        let escaping = command.escaping_applies();

        let mut headers = Vec::new();
        let mut body = String::new();
        for line in lines.by_ref() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                // Blank line ends the headers; the rest is the body verbatim
                body = lines.collect::<Vec<_>>().join("\n");
                break;
            }
            let (name, value) = line
                .split_once(':')
                .with_context(|| format!("header line without colon: {line:?}"))?;
            if escaping {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        Ok(Self {
            command,
            headers,
            body,
        })
    }
}

/// Whether a WebSocket text message is a STOMP heart-beat rather than a frame.
#[must_use]
pub fn is_heartbeat(text: &str) -> bool {
    text.is_empty() || text == "\n" || text == "\r\n"
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            other => bail!("invalid escape sequence \\{:?}", other),
        }
    }
    Ok(out)
}

/// A heart-beat capability pair: what this side can send and wants to
/// receive, in milliseconds. Zero disables a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartBeat {
    /// Smallest interval this side can emit beats at.
    pub send_ms: u64,
    /// Desired interval for inbound beats.
    pub recv_ms: u64,
}

/// Outcome of heart-beat negotiation. `None` disables a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// How often to send beats, when sending is enabled.
    pub send_every: Option<Duration>,
    /// Longest tolerable inbound silence, when expecting is enabled.
    pub expect_within: Option<Duration>,
}

impl HeartBeat {
    /// Wire value for the `heart-beat` header.
    #[must_use]
    pub fn header_value(self) -> String {
        format!("{},{}", self.send_ms, self.recv_ms)
    }

    /// Parse a `heart-beat` header into its (sx, sy) pair.
    ///
    /// # Errors
    ///
    /// Returns an error unless the value is two comma-separated integers.
    pub fn parse_header(value: &str) -> Result<(u64, u64)> {
        let (sx, sy) = value
            .split_once(',')
            .with_context(|| format!("malformed heart-beat header {value:?}"))?;
        let sx = sx
            .trim()
            .parse()
            .with_context(|| format!("malformed heart-beat header {value:?}"))?;
        let sy = sy
            .trim()
            .parse()
            .with_context(|| format!("malformed heart-beat header {value:?}"))?;
        Ok((sx, sy))
    }

    /// Negotiate against the server's (sx, sy) offer. Each direction is
    /// enabled only when both sides are non-zero, at the larger interval.
    #[must_use]
    pub fn negotiate(self, server: (u64, u64)) -> Negotiated {
        let (server_send, server_recv) = server;
        let send_every = if self.send_ms == 0 || server_recv == 0 {
            None
        } else {
            Some(Duration::from_millis(self.send_ms.max(server_recv)))
        };
        let expect_within = if self.recv_ms == 0 || server_send == 0 {
            None
        } else {
            Some(Duration::from_millis(self.recv_ms.max(server_send)))
        };
        Negotiated {
            send_every,
            expect_within,
        }
    }
}

/// Handshake frame offering STOMP 1.2 and the given heart-beat pair.
#[must_use]
pub fn connect_frame(host: &str, heartbeat: HeartBeat) -> Frame {
    Frame::new(Command::Connect)
        .with_header("accept-version", "1.2")
        .with_header("host", host)
        .with_header("heart-beat", heartbeat.header_value())
}

/// Subscription frame with auto acknowledgement.
#[must_use]
pub fn subscribe_frame(id: &str, destination: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .with_header("id", id)
        .with_header("destination", destination)
        .with_header("ack", "auto")
}

/// Unsubscription frame for a previously subscribed id.
#[must_use]
pub fn unsubscribe_frame(id: &str) -> Frame {
    Frame::new(Command::Unsubscribe).with_header("id", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_frame_format() {
        let frame = connect_frame(
            "example.com:8080",
            HeartBeat {
                send_ms: 4000,
                recv_ms: 4000,
            },
        );
        assert_eq!(
            frame.encode(),
            "CONNECT\naccept-version:1.2\nhost:example.com:8080\nheart-beat:4000,4000\n\n\0"
        );
    }

    #[test]
    fn test_subscribe_frame_format() {
        let frame = subscribe_frame("sub-private", "/topic/progress.alice");
        assert_eq!(
            frame.encode(),
            "SUBSCRIBE\nid:sub-private\ndestination:/topic/progress.alice\nack:auto\n\n\0"
        );
    }

    #[test]
    fn test_parse_message_frame_with_body() {
        let text = "MESSAGE\nsubscription:sub-public\nmessage-id:m-1\n\n{\"a\":1}\0";
        let frame = Frame::parse(text).expect("valid frame");
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.header("subscription"), Some("sub-public"));
        assert_eq!(frame.body, "{\"a\":1}");
    }

    #[test]
    fn test_roundtrip_with_escaped_headers() {
        let frame = Frame::new(Command::Message)
            .with_header("weird", "a:b\nc\\d")
            .with_body("body");
        let parsed = Frame::parse(&frame.encode()).expect("valid frame");
        assert_eq!(parsed.header("weird"), Some("a:b\nc\\d"));
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_connect_headers_not_escaped() {
        // host values legitimately contain colons on CONNECT frames
        let frame = connect_frame(
            "localhost:9090",
            HeartBeat {
                send_ms: 0,
                recv_ms: 0,
            },
        );
        assert!(frame.encode().contains("host:localhost:9090"));

        let parsed = Frame::parse("CONNECTED\nversion:1.2\nserver:x:y\n\n\0").expect("parses");
        assert_eq!(parsed.header("server"), Some("x:y"));
    }

    #[test]
    fn test_body_trailing_newline_survives_roundtrip() {
        let frame = Frame::new(Command::Message)
            .with_header("subscription", "sub-public")
            .with_body("line one\nline two\n");
        let parsed = Frame::parse(&frame.encode()).expect("valid frame");
        assert_eq!(parsed.body, "line one\nline two\n");

        // EOL padding after the NUL is still discarded
        let padded = format!("{}\r\n", frame.encode());
        assert_eq!(Frame::parse(&padded).expect("valid frame").body, "line one\nline two\n");
    }

    #[test]
    fn test_repeated_header_first_wins() {
        let text = "MESSAGE\nfoo:first\nfoo:second\n\n\0";
        let frame = Frame::parse(text).expect("valid frame");
        assert_eq!(frame.header("foo"), Some("first"));
    }

    #[test]
    fn test_heartbeat_detection_and_rejects() {
        assert!(is_heartbeat("\n"));
        assert!(is_heartbeat(""));
        assert!(!is_heartbeat("MESSAGE\n\n\0"));

        assert!(Frame::parse("NOTACOMMAND\n\n\0").is_err());
        assert!(Frame::parse("MESSAGE\nno-colon-here\n\n\0").is_err());
    }

    #[test]
    fn test_heartbeat_negotiation() {
        let client = HeartBeat {
            send_ms: 4000,
            recv_ms: 4000,
        };

        // Both directions on, larger interval wins
        let n = client.negotiate((10_000, 2000));
        assert_eq!(n.send_every, Some(Duration::from_secs(4)));
        assert_eq!(n.expect_within, Some(Duration::from_secs(10)));

        // Server disables both
        let n = client.negotiate((0, 0));
        assert_eq!(n.send_every, None);
        assert_eq!(n.expect_within, None);

        // Client offers nothing
        let silent = HeartBeat {
            send_ms: 0,
            recv_ms: 0,
        };
        let n = silent.negotiate((4000, 4000));
        assert_eq!(n.send_every, None);
        assert_eq!(n.expect_within, None);

        assert_eq!(HeartBeat::parse_header("4000, 2000").expect("parses"), (4000, 2000));
        assert!(HeartBeat::parse_header("4000").is_err());
        assert!(HeartBeat::parse_header("a,b").is_err());
    }
}
