//! STOMP client: connect, handshake, subscribe, disconnect.
//!
//! # Connection setup
//!
//! ```text
//! base URL ──► session URL (/<server>/<session>/websocket)
//!          ──► Dialer::dial ──► CONNECT ──► wait for CONNECTED
//!          ──► spawn reader task + dispatch loop
//! ```
//!
//! Everything after setup goes through the dispatch loop; [`StompClient`] is
//! a cheap handle that can be cloned and shared between tasks.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::dispatch::{self, Outbox};
use crate::error::StompError;
use crate::frame::{headers, Command, Frame};
use crate::header::Header;
use crate::sockjs::{self, MessageKind, RandomSessionTokens, SessionTokens};
use crate::subscription::Subscription;
use crate::transport::{Dialer, Transport, TransportReader};
use crate::ws::WsDialer;

/// Handle to a live STOMP connection.
#[derive(Debug, Clone)]
pub struct StompClient {
    outbox: Outbox,
    config: ClientConfig,
    label: String,
}

impl StompClient {
    /// Start building a connection to `url` (a `ws://` or `wss://` base URL).
    pub fn builder(url: impl Into<String>) -> StompClientBuilder {
        StompClientBuilder::new(url)
    }

    /// Connect through `dialer`, sending `request_headers` with the opening
    /// request.
    pub async fn connect(
        url: &str,
        request_headers: Header,
        dialer: &dyn Dialer,
        config: ClientConfig,
    ) -> Result<Self, StompError> {
        let base = parse_url(url)?;
        establish(&base, &request_headers, dialer, &mut RandomSessionTokens, config).await
    }

    /// Connect over WebSocket with bearer-token authentication.
    ///
    /// Adds `Host`, `Origin` and `Authorization: Bearer <token>` to the
    /// opening request. Only `ws` and `wss` URLs are accepted.
    pub async fn connect_with_token(
        url: &str,
        token: &str,
        config: ClientConfig,
    ) -> Result<Self, StompError> {
        Self::builder(url)
            .bearer_token(token)
            .config(config)
            .connect()
            .await
    }

    /// Subscribe to `topic` without waiting for the broker to confirm.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription, StompError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.config.subscription_capacity());
        let frame = Frame::new(Command::Subscribe)
            .header(headers::ID, &id)
            .header(headers::DESTINATION, topic);

        self.outbox.submit(frame, Some(tx)).await?;
        log::info!("[stomp] {}: Subscribed to {topic} as {id}", self.label);

        Ok(Subscription::new(
            id,
            topic.to_string(),
            rx,
            VecDeque::new(),
            self.outbox.clone(),
            self.label.clone(),
        ))
    }

    /// Subscribe to `topic` and wait for the broker's `RECEIPT`.
    ///
    /// Messages that arrive before the receipt are kept and returned first by
    /// the subscription.
    pub async fn subscribe_with_receipt(&self, topic: &str) -> Result<Subscription, StompError> {
        let id = Uuid::new_v4().to_string();
        let receipt = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::channel(self.config.subscription_capacity());
        let frame = Frame::new(Command::Subscribe)
            .header(headers::ID, &id)
            .header(headers::DESTINATION, topic)
            .header(headers::RECEIPT, &receipt);

        self.outbox.submit(frame, Some(tx)).await?;

        let mut pending = VecDeque::new();
        let confirmed = async {
            while let Some(frame) = rx.recv().await {
                match frame.command {
                    Command::Receipt => return Ok(()),
                    Command::Error => {
                        return Err(StompError::Server(frame.error_message().to_string()))
                    }
                    _ => pending.push_back(frame),
                }
            }
            Err(StompError::Closed)
        };
        let outcome = match tokio::time::timeout(self.config.receipt_timeout(), confirmed).await {
            Ok(result) => result,
            Err(_elapsed) => Err(StompError::Timeout),
        };
        if let Err(e) = outcome {
            log::warn!(
                "[stomp] {}: Subscribe to {topic} not confirmed ({e}); withdrawing {id}",
                self.label
            );
            self.withdraw(&id).await;
            return Err(e);
        }
        log::info!(
            "[stomp] {}: Subscribed to {topic} as {id} (receipt {receipt})",
            self.label
        );

        Ok(Subscription::new(
            id,
            topic.to_string(),
            rx,
            pending,
            self.outbox.clone(),
            self.label.clone(),
        ))
    }

    /// Fire-and-forget `UNSUBSCRIBE` for a subscription that never got going.
    async fn withdraw(&self, id: &str) {
        let frame = Frame::new(Command::Unsubscribe).header(headers::ID, id);
        if let Err(e) = self.outbox.submit(frame, None).await {
            log::debug!("[stomp] {}: Can't withdraw {id}: {e}", self.label);
        }
    }

    /// Send `DISCONNECT` and wait for its receipt.
    ///
    /// On `RECEIPT` the connection shuts down and this returns `Ok`. An
    /// `ERROR` reply is returned as [`StompError::Server`]; the connection is
    /// torn down either way.
    pub async fn disconnect(&self) -> Result<(), StompError> {
        let receipt = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::channel(1);
        let frame = Frame::new(Command::Disconnect).header(headers::RECEIPT, &receipt);

        self.outbox.submit(frame, Some(tx)).await?;

        match tokio::time::timeout(self.config.receipt_timeout(), rx.recv()).await {
            Ok(Some(reply)) if reply.command == Command::Receipt => {
                log::info!("[stomp] {}: Disconnected", self.label);
                Ok(())
            }
            Ok(Some(reply)) => {
                log::warn!(
                    "[stomp] {}: Disconnect answered with {}: {}",
                    self.label,
                    reply.command,
                    reply.error_message()
                );
                Err(StompError::Server(reply.error_message().to_string()))
            }
            Ok(None) => Err(StompError::Closed),
            Err(_elapsed) => Err(StompError::Timeout),
        }
    }

    /// Stop the connection immediately, without a `DISCONNECT`.
    ///
    /// Every waiter and subscription receives an `ERROR` frame and closes.
    pub fn close(&self) {
        self.outbox.cancel();
    }

    /// Whether the connection has shut down.
    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }

    /// Session path identifying this connection in log lines.
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Options for [`StompClient`] connections.
pub struct StompClientBuilder {
    url: String,
    dialer: Box<dyn Dialer>,
    session_tokens: Box<dyn SessionTokens>,
    headers: Header,
    bearer_token: Option<String>,
    config: ClientConfig,
}

impl std::fmt::Debug for StompClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StompClientBuilder")
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "[REDACTED]"))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StompClientBuilder {
    /// Builder with the WebSocket dialer, random session tokens and default
    /// configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dialer: Box::new(WsDialer),
            session_tokens: Box::new(RandomSessionTokens),
            headers: Header::new(),
            bearer_token: None,
            config: ClientConfig::default(),
        }
    }

    /// Use a custom transport.
    pub fn dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Box::new(dialer);
        self
    }

    /// Use a custom source for the session URL segments.
    pub fn session_tokens(mut self, tokens: impl SessionTokens + 'static) -> Self {
        self.session_tokens = Box::new(tokens);
        self
    }

    /// Add a header to the opening request.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(key, value);
        self
    }

    /// Authenticate with `Authorization: Bearer <token>`.
    ///
    /// Also sets `Host` and `Origin`, and restricts the URL to `ws`/`wss`.
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Replace the configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Dial, perform the handshake and start the connection.
    pub async fn connect(mut self) -> Result<StompClient, StompError> {
        let base = parse_url(&self.url)?;

        if let Some(token) = &self.bearer_token {
            let scheme = sockjs::origin_scheme(&base)?;
            let host = sockjs::host_header(&base)?;
            self.headers.add("Host", host.clone());
            self.headers.add("Origin", format!("{scheme}://{host}"));
            self.headers.add("Authorization", format!("Bearer {token}"));
        }

        establish(
            &base,
            &self.headers,
            self.dialer.as_ref(),
            self.session_tokens.as_mut(),
            self.config,
        )
        .await
    }
}

fn parse_url(url: &str) -> Result<Url, StompError> {
    Url::parse(url).map_err(|e| StompError::InvalidUrl(format!("{url}: {e}")))
}

async fn establish(
    base: &Url,
    request_headers: &Header,
    dialer: &dyn Dialer,
    tokens: &mut dyn SessionTokens,
    config: ClientConfig,
) -> Result<StompClient, StompError> {
    let url = sockjs::session_url(base, tokens)?;
    let label = url.path().to_string();

    log::info!("[stomp] {label}: Connecting to {}", base);
    let mut transport = dialer.dial(&url, request_headers).await.map_err(|e| {
        log::error!("[stomp] {label}: Dial failed: {e:#}");
        StompError::ConnectionFailed(format!("{e:#}"))
    })?;

    if let Err(e) = handshake(&mut transport, &config, &label).await {
        log::error!("[stomp] {label}: {e}");
        if let Err(close_err) = transport.writer.close().await {
            log::debug!("[stomp] {label}: close after failed handshake: {close_err:#}");
        }
        return Err(e);
    }
    log::info!("[stomp] {label}: Connected");

    let outbox = dispatch::spawn_connection(transport, &config, label.clone());
    Ok(StompClient {
        outbox,
        config,
        label,
    })
}

/// Send `CONNECT` and read the broker's reply.
async fn handshake(
    transport: &mut Transport,
    config: &ClientConfig,
    label: &str,
) -> Result<(), StompError> {
    let connect = Frame::new(Command::Connect)
        .header(headers::ACCEPT_VERSION, &config.accept_version)
        .header(headers::HEART_BEAT, &config.heart_beat);
    transport
        .writer
        .send(connect.encode().as_bytes())
        .await
        .map_err(|e| StompError::ConnectionFailed(format!("{e:#}")))?;

    let reply = match tokio::time::timeout(
        config.handshake_timeout(),
        first_frame(transport.reader.as_mut()),
    )
    .await
    {
        Ok(reply) => reply?,
        Err(_elapsed) => return Err(StompError::Timeout),
    };
    log::debug!("[stomp] {label}: Handshake reply {}", reply.command);

    if !config.validate_handshake {
        return Ok(());
    }
    match reply.command {
        Command::Connected => Ok(()),
        Command::Error => Err(StompError::Handshake(reply.error_message().to_string())),
        other => Err(StompError::Handshake(format!(
            "expected CONNECTED, got {other}"
        ))),
    }
}

/// First payload frame, skipping SockJS open and heartbeat messages.
async fn first_frame(reader: &mut dyn TransportReader) -> Result<Frame, StompError> {
    loop {
        match reader.receive().await {
            Some(Ok(raw)) => match sockjs::classify(&raw) {
                MessageKind::Payload => return Frame::decode(&raw),
                MessageKind::Close => {
                    return Err(StompError::Handshake(
                        "session closed by server".to_string(),
                    ))
                }
                MessageKind::Open
                | MessageKind::Heartbeat
                | MessageKind::Empty
                | MessageKind::Unknown(_) => continue,
            },
            Some(Err(e)) => return Err(StompError::ConnectionFailed(format!("{e:#}"))),
            None => return Err(StompError::Closed),
        }
    }
}
