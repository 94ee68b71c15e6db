//! Errors surfaced by the STOMP client.

/// Errors that can occur while connecting or talking to a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompError {
    /// URL scheme other than `ws` or `wss` on the token-authenticated path.
    UnsupportedScheme(String),
    /// URL could not be used to build the session endpoint.
    InvalidUrl(String),
    /// Dialing or the first write failed.
    ConnectionFailed(String),
    /// The broker did not answer the `CONNECT` frame with `CONNECTED`.
    Handshake(String),
    /// Wire input did not hold a decodable frame.
    MalformedFrame(String),
    /// The broker sent an `ERROR` frame (or the connection synthesized one).
    Server(String),
    /// The connection is gone.
    Closed,
    /// Operation timed out.
    Timeout,
}

impl std::fmt::Display for StompError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedScheme(scheme) => {
                write!(f, "Unsupported URL scheme '{scheme}': expected ws or wss")
            }
            Self::InvalidUrl(msg) => write!(f, "Invalid URL: {msg}"),
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::Handshake(msg) => write!(f, "Handshake failed: {msg}"),
            Self::MalformedFrame(msg) => write!(f, "Malformed frame: {msg}"),
            Self::Server(msg) => write!(f, "Server error: {msg}"),
            Self::Closed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl std::error::Error for StompError {}
