//! Transport seams.
//!
//! The client only needs a duplex channel of raw messages. Dialing yields a
//! writer half owned by the dispatch loop and a reader half owned by the
//! reader task, so neither side needs a lock.
//!
//! [`crate::ws`] provides the WebSocket implementation; tests plug in
//! in-memory ones.

use anyhow::Result;
use async_trait::async_trait;
use url::Url;

use crate::header::Header;

/// Sending half of a connection.
#[async_trait]
pub trait TransportWriter: Send {
    /// Send one raw message.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Close the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Receiving half of a connection.
#[async_trait]
pub trait TransportReader: Send {
    /// Next raw message. `None` once the peer has closed the stream.
    async fn receive(&mut self) -> Option<Result<Vec<u8>>>;
}

/// A freshly dialed connection, split into halves.
pub struct Transport {
    /// Sending half.
    pub writer: Box<dyn TransportWriter>,
    /// Receiving half.
    pub reader: Box<dyn TransportReader>,
}

impl Transport {
    /// Bundle two halves.
    pub fn new(writer: Box<dyn TransportWriter>, reader: Box<dyn TransportReader>) -> Self {
        Self { writer, reader }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens transports.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `url`, sending `headers` with the opening request.
    async fn dial(&self, url: &Url, headers: &Header) -> Result<Transport>;
}
