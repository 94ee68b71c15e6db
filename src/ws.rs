//! WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves that implement the [`crate::transport`] traits.
//!
//! # Architecture
//!
//! A single [`connect`] function handles URL→request building, header
//! insertion, and TLS negotiation. It returns a ([`WsWriter`], [`WsReader`])
//! pair; [`WsDialer`] wraps it as a [`Dialer`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use url::Url;

use crate::header::Header;
use crate::transport::{Dialer, Transport, TransportReader, TransportWriter};

/// Concrete WebSocket stream type (avoids repeating the 6-line generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails (connection closed, I/O error).
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    /// Send a close frame, then flush and close the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if the close frame cannot be sent.
    pub async fn send_close(&mut self) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Close(None))
            .await
            .context("WebSocket send_close failed")?;
        self.sink.close().await.context("WebSocket close failed")
    }
}

#[async_trait]
impl TransportWriter for WsWriter {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(data).context("outbound frame is not UTF-8")?;
        self.send_text(text).await
    }

    async fn close(&mut self) -> Result<()> {
        self.send_close().await
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next data message, returning `None` when the stream ends
    /// or the peer sends a close frame.
    ///
    /// Ping, pong and raw frames are skipped; tungstenite answers pings.
    pub async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(text.into_bytes()));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(data));
                }
                Some(Ok(
                    tungstenite::Message::Ping(_)
                    | tungstenite::Message::Pong(_)
                    | tungstenite::Message::Frame(_),
                )) => {
                    continue;
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    if let Some(cf) = close_frame {
                        log::debug!("[ws] Close frame: {} {}", u16::from(cf.code), cf.reason);
                    }
                    return None;
                }
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}

#[async_trait]
impl TransportReader for WsReader {
    async fn receive(&mut self) -> Option<Result<Vec<u8>>> {
        self.recv().await
    }
}

/// Connect to a WebSocket URL with optional headers.
///
/// Builds an HTTP request from `url`, inserts each `(name, value)` header,
/// then performs the WebSocket handshake. Returns split (writer, reader)
/// halves for independent use.
///
/// # Errors
///
/// Returns an error if the URL is invalid, header values are malformed,
/// or the WebSocket handshake fails.
pub async fn connect(url: &str, headers: &[(&str, &str)]) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    for &(name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// [`Dialer`] over [`connect`].
#[derive(Debug, Default, Clone, Copy)]
pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, url: &Url, headers: &Header) -> Result<Transport> {
        let pairs: Vec<(&str, &str)> = headers.iter().collect();
        let (writer, reader) = connect(url.as_str(), &pairs).await?;
        Ok(Transport::new(Box::new(writer), Box::new(reader)))
    }
}
