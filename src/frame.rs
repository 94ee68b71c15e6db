//! STOMP frames and the SockJS envelope codec.
//!
//! A frame travels inside a one-element JSON string array:
//!
//! ```text
//! a["SUBSCRIBE\nid:42\ndestination:/topic/news\n\n\u0000"]
//! ```
//!
//! Outbound frames are written without the leading `a` tag; inbound payloads
//! carry it. Newlines, quotes and the terminating NUL appear as the literal
//! escape sequences `\n`, `\"` and `\u0000`.
//!
//! # Example
//!
//! ```
//! use stomp_websocket::frame::{Command, Frame};
//!
//! let frame = Frame::new(Command::Subscribe)
//!     .header("id", "sub-0")
//!     .header("destination", "/topic/news");
//!
//! assert_eq!(frame.contains("destination"), Some("/topic/news"));
//! ```

use crate::error::StompError;

/// Well-known header keys.
pub mod headers {
    /// Asks the broker to acknowledge a client frame.
    pub const RECEIPT: &str = "receipt";
    /// Subscription id on `SUBSCRIBE` / `UNSUBSCRIBE`.
    pub const ID: &str = "id";
    /// Correlates a `RECEIPT` with the frame that asked for it.
    pub const RECEIPT_ID: &str = "receipt-id";
    /// Subscription id a `MESSAGE` belongs to.
    pub const SUBSCRIPTION: &str = "subscription";
    /// Human-readable text on `ERROR` frames.
    pub const MESSAGE: &str = "message";
    /// Topic or queue name.
    pub const DESTINATION: &str = "destination";
    /// Protocol versions offered on `CONNECT`.
    pub const ACCEPT_VERSION: &str = "accept-version";
    /// Heartbeat intervals offered on `CONNECT`.
    pub const HEART_BEAT: &str = "heart-beat";
}

/// Bytes stripped from the front of an inbound payload: `a["`.
const ENVELOPE_PREFIX_LEN: usize = 3;
/// Bytes stripped from the back of an inbound payload: `"]`.
const ENVELOPE_SUFFIX_LEN: usize = 2;

/// Escaped line terminator as it appears on the wire.
const ESCAPED_NEWLINE: &str = "\\n";
/// Escaped frame terminator as it appears on the wire.
const ESCAPED_NUL: &str = "\\u0000";
/// Escaped double quote as it appears on the wire.
const ESCAPED_QUOTE: &str = "\\\"";

/// STOMP command vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client handshake.
    Connect,
    /// Broker handshake reply.
    Connected,
    /// Register interest in a destination.
    Subscribe,
    /// Drop a subscription.
    Unsubscribe,
    /// Graceful shutdown.
    Disconnect,
    /// Message delivered on a subscription.
    Message,
    /// Acknowledgment of a client frame.
    Receipt,
    /// Broker-side failure; terminal for the connection.
    Error,
    /// Anything outside the vocabulary above.
    Other(String),
}

impl Command {
    /// Wire spelling of the command.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Other(other) => other,
        }
    }
}

impl From<&str> for Command {
    fn from(s: &str) -> Self {
        match s {
            "CONNECT" => Self::Connect,
            "CONNECTED" => Self::Connected,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// Raw `key:value` header lines in wire order. Duplicates allowed.
    pub headers: Vec<String>,
    /// Frame body, possibly empty.
    pub body: String,
}

impl Frame {
    /// Create a frame with no headers and an empty body.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Create a frame from pre-joined `key:value` header lines.
    #[must_use]
    pub fn with_headers(command: Command, headers: Vec<String>) -> Self {
        Self {
            command,
            headers,
            body: String::new(),
        }
    }

    /// Synthetic `ERROR` frame carrying `message` in its `message` header.
    ///
    /// Used when the connection itself has to fail every waiter.
    #[must_use]
    pub fn error(message: impl std::fmt::Display) -> Self {
        Self::new(Command::Error).header(headers::MESSAGE, message.to_string())
    }

    /// Append a `key:value` header line.
    #[must_use]
    pub fn header(mut self, key: &str, value: impl AsRef<str>) -> Self {
        self.headers.push(format!("{key}:{}", value.as_ref()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of the first header whose key is exactly `key`.
    ///
    /// The key ends at the first `:`; the value may contain further colons.
    pub fn contains(&self, key: &str) -> Option<&str> {
        self.headers.iter().find_map(|line| {
            let (k, v) = line.split_once(':')?;
            (k == key).then_some(v)
        })
    }

    /// `message` header of an `ERROR` frame, or a generic fallback.
    pub fn error_message(&self) -> &str {
        self.contains(headers::MESSAGE).unwrap_or("unknown error")
    }

    /// Serialize for sending: `["<command>\n<headers>\n\n<body>\u0000"]`.
    ///
    /// Header lines and the body are written verbatim.
    pub fn encode(&self) -> String {
        let header_len: usize = self.headers.iter().map(|h| h.len() + 2).sum();
        let mut out = String::with_capacity(
            self.command.as_str().len() + header_len + self.body.len() + 16,
        );
        out.push_str("[\"");
        out.push_str(self.command.as_str());
        out.push_str(ESCAPED_NEWLINE);
        for header in &self.headers {
            out.push_str(header);
            out.push_str(ESCAPED_NEWLINE);
        }
        out.push_str(ESCAPED_NEWLINE);
        out.push_str(&self.body);
        out.push_str(ESCAPED_NUL);
        out.push_str("\"]");
        out
    }

    /// Parse an inbound `a[...]` payload.
    ///
    /// Everything after the first empty line is body, so bodies with
    /// embedded newlines survive intact.
    ///
    /// # Errors
    ///
    /// Returns [`StompError::MalformedFrame`] if the input is shorter than
    /// the envelope, not UTF-8, has an empty command, or has a header line
    /// without a `:`.
    pub fn decode(data: &[u8]) -> Result<Self, StompError> {
        if data.len() < ENVELOPE_PREFIX_LEN + ENVELOPE_SUFFIX_LEN {
            return Err(StompError::MalformedFrame(format!(
                "{} bytes is shorter than the envelope",
                data.len()
            )));
        }
        let text = std::str::from_utf8(data)
            .map_err(|e| StompError::MalformedFrame(format!("payload is not UTF-8: {e}")))?;
        let inner = text
            .get(ENVELOPE_PREFIX_LEN..text.len() - ENVELOPE_SUFFIX_LEN)
            .ok_or_else(|| {
                StompError::MalformedFrame("envelope boundary splits a character".to_string())
            })?;

        let unescaped = inner
            .replace(ESCAPED_NEWLINE, "\n")
            .replace(ESCAPED_QUOTE, "\"")
            .replace(ESCAPED_NUL, "\0");
        let payload = unescaped.trim_end_matches('\0');

        let mut lines = payload.split('\n');
        let command = lines.next().unwrap_or_default();
        if command.is_empty() {
            return Err(StompError::MalformedFrame("empty command".to_string()));
        }

        let mut headers = Vec::new();
        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            }
            if !line.contains(':') {
                return Err(StompError::MalformedFrame(format!(
                    "header line without ':': {line}"
                )));
            }
            headers.push(line.to_string());
        }

        // The iterator now sits just past the blank separator line.
        let body = lines.collect::<Vec<_>>().join("\n");

        Ok(Self {
            command: Command::from(command),
            headers,
            body,
        })
    }
}
