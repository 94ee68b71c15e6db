//! SockJS framing around the STOMP stream.
//!
//! Every raw WebSocket message starts with a one-byte tag:
//!
//! | tag | meaning |
//! |-----|---------|
//! | `o` | session opened |
//! | `h` | heartbeat |
//! | `a` | array of payload strings (one STOMP frame) |
//! | `c` | session closed |
//!
//! The endpoint URL carries a server id and a session id chosen by the
//! client: `<base path>/<server id>/<session id>/websocket`.

use rand::distr::Alphanumeric;
use rand::Rng;
use url::Url;

use crate::error::StompError;

/// Exclusive upper bound for the random server id.
pub const SERVER_ID_MAX: u32 = 999;

/// Length of the random session id.
pub const SESSION_ID_LEN: usize = 16;

/// Path segment terminating every session URL.
const TRANSPORT_SUFFIX: &str = "websocket";

/// Kind of a raw SockJS message, decided by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `o`: session open notice.
    Open,
    /// `h`: heartbeat.
    Heartbeat,
    /// `a`: payload carrying a STOMP frame.
    Payload,
    /// `c`: session closed by the server.
    Close,
    /// Zero-length message.
    Empty,
    /// Any other leading byte.
    Unknown(u8),
}

/// Classify a raw message by its leading tag byte.
pub fn classify(raw: &[u8]) -> MessageKind {
    match raw.first() {
        None => MessageKind::Empty,
        Some(b'o') => MessageKind::Open,
        Some(b'h') => MessageKind::Heartbeat,
        Some(b'a') => MessageKind::Payload,
        Some(b'c') => MessageKind::Close,
        Some(&other) => MessageKind::Unknown(other),
    }
}

/// Source of the random pieces of a session URL.
///
/// Swapped for fixed values in tests.
pub trait SessionTokens: Send {
    /// Server id segment.
    fn server_id(&mut self) -> String;
    /// Session id segment.
    fn session_id(&mut self) -> String;
}

/// [`SessionTokens`] backed by the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSessionTokens;

impl SessionTokens for RandomSessionTokens {
    fn server_id(&mut self) -> String {
        random_server_id(SERVER_ID_MAX)
    }

    fn session_id(&mut self) -> String {
        random_session_id(SESSION_ID_LEN)
    }
}

/// Random number below `max`, zero-padded to the digit count of `max`.
pub fn random_server_id(max: u32) -> String {
    let width = max.to_string().len();
    let n = rand::rng().random_range(0..max.max(1));
    format!("{n:0width$}")
}

/// `len` characters drawn uniformly from `[A-Za-z0-9]`.
///
/// `Alphanumeric` samples by rejection, so there is no modulo bias.
pub fn random_session_id(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Append `/<server id>/<session id>/websocket` to the path of `base`.
///
/// Query and fragment are preserved.
pub fn session_url(base: &Url, tokens: &mut dyn SessionTokens) -> Result<Url, StompError> {
    if base.cannot_be_a_base() {
        return Err(StompError::InvalidUrl(format!("{base} cannot carry a path")));
    }
    let mut url = base.clone();
    let path = format!(
        "{}/{}/{}/{}",
        base.path().trim_end_matches('/'),
        tokens.server_id(),
        tokens.session_id(),
        TRANSPORT_SUFFIX
    );
    url.set_path(&path);
    Ok(url)
}

/// HTTP scheme matching a WebSocket scheme, used for the `Origin` header.
pub fn origin_scheme(url: &Url) -> Result<&'static str, StompError> {
    match url.scheme() {
        "ws" => Ok("http"),
        "wss" => Ok("https"),
        other => Err(StompError::UnsupportedScheme(other.to_string())),
    }
}

/// `host[:port]` of `url`, as sent in the `Host` header.
pub fn host_header(url: &Url) -> Result<String, StompError> {
    let host = url
        .host_str()
        .ok_or_else(|| StompError::InvalidUrl(format!("{url} has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
