//! Connection dispatch engine.
//!
//! One connection runs two tasks:
//!
//! ```text
//!  TransportReader ──► reader task ──(Frame)──► dispatch loop ──► TransportWriter
//!                                                 ▲   │
//!        StompClient / Subscription ──(WriteRequest)  └──► receipt / subscription sinks
//! ```
//!
//! The dispatch loop is the only code that touches the receipt and
//! subscription tables, so they are plain `HashMap`s. Callers reach the loop
//! exclusively through the request queue held by [`Outbox`].
//!
//! Errors raised inside the loop never return to a caller directly. They
//! arrive as `ERROR` frames on the sink the caller is already waiting on.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, DeliveryPolicy};
use crate::error::StompError;
use crate::frame::{headers, Command, Frame};
use crate::sockjs::{self, MessageKind};
use crate::transport::{Transport, TransportReader, TransportWriter};

/// Where the loop delivers frames for one waiter.
pub(crate) type FrameSink = mpsc::Sender<Frame>;

/// A frame to send plus the sink that should see its replies.
#[derive(Debug)]
pub(crate) struct WriteRequest {
    pub(crate) frame: Frame,
    pub(crate) reply: Option<FrameSink>,
}

/// Caller-side handle for handing requests to the dispatch loop.
#[derive(Debug, Clone)]
pub(crate) struct Outbox {
    requests: mpsc::Sender<WriteRequest>,
    cancel: CancellationToken,
    submit_timeout: Duration,
}

impl Outbox {
    pub(crate) fn new(
        requests: mpsc::Sender<WriteRequest>,
        cancel: CancellationToken,
        submit_timeout: Duration,
    ) -> Self {
        Self {
            requests,
            cancel,
            submit_timeout,
        }
    }

    /// Queue `frame` for sending.
    ///
    /// Fails with [`StompError::Closed`] once the connection is cancelled or
    /// the loop has exited, and with [`StompError::Timeout`] if the queue
    /// stays full for the submit timeout.
    pub(crate) async fn submit(
        &self,
        frame: Frame,
        reply: Option<FrameSink>,
    ) -> Result<(), StompError> {
        if self.cancel.is_cancelled() {
            return Err(StompError::Closed);
        }
        let request = WriteRequest { frame, reply };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(StompError::Closed),
            sent = tokio::time::timeout(self.submit_timeout, self.requests.send(request)) => {
                match sent {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_closed)) => Err(StompError::Closed),
                    Err(_elapsed) => Err(StompError::Timeout),
                }
            }
        }
    }

    /// Stop the connection without a `DISCONNECT` handshake.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the connection has shut down or been cancelled.
    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.requests.is_closed()
    }
}

/// Spawn the reader task and the dispatch loop for an established transport.
pub(crate) fn spawn_connection(transport: Transport, config: &ClientConfig, label: String) -> Outbox {
    let cancel = CancellationToken::new();
    let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity());
    let (request_tx, request_rx) = mpsc::channel(config.queue_capacity());

    tokio::spawn(run_reader(
        transport.reader,
        inbound_tx,
        cancel.clone(),
        label.clone(),
    ));

    let dispatcher = Dispatcher::new(
        transport.writer,
        Delivery::new(config.delivery, cancel.clone(), config.submit_timeout()),
        label,
    );
    tokio::spawn(dispatcher.run(inbound_rx, request_rx));

    Outbox::new(request_tx, cancel, config.submit_timeout())
}

/// Delivery policy bound to the connection's cancellation token.
#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    policy: DeliveryPolicy,
    cancel: CancellationToken,
    /// Per-sink bound on handing over a terminal `ERROR`.
    terminal_timeout: Duration,
}

impl Delivery {
    pub(crate) fn new(
        policy: DeliveryPolicy,
        cancel: CancellationToken,
        terminal_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            cancel,
            terminal_timeout,
        }
    }

    /// Hand a terminal frame to `sink`, ignoring the delivery policy.
    ///
    /// Waits for buffer space for at most the terminal timeout, so a
    /// consumer that stopped reading cannot hold up shutdown.
    async fn deliver_terminal(&self, sink: &FrameSink, frame: Frame) -> bool {
        match tokio::time::timeout(self.terminal_timeout, sink.send(frame)).await {
            Ok(sent) => sent.is_ok(),
            Err(_elapsed) => false,
        }
    }

    /// Hand `frame` to `sink`. Returns `false` if the receiving side is gone
    /// (or, when blocking, the connection was cancelled first).
    async fn deliver(&self, sink: &FrameSink, frame: Frame) -> bool {
        match self.policy {
            DeliveryPolicy::Block => tokio::select! {
                biased;
                sent = sink.send(frame) => sent.is_ok(),
                () = self.cancel.cancelled() => false,
            },
            DeliveryPolicy::DropWhenFull => match sink.try_send(frame) {
                Ok(()) => true,
                Err(TrySendError::Full(dropped)) => {
                    log::warn!(
                        "[stomp] Subscriber buffer full, dropping {} frame",
                        dropped.command
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            },
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Owner of the transport writer and both correlation tables.
pub(crate) struct Dispatcher {
    writer: Box<dyn TransportWriter>,
    /// receipt id -> single-use sink.
    receipts: HashMap<String, FrameSink>,
    /// subscription id -> sink for every `MESSAGE` on it.
    subscriptions: HashMap<String, FrameSink>,
    /// Receipt id of an outstanding `DISCONNECT`.
    disconnect_receipt: Option<String>,
    delivery: Delivery,
    label: String,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("label", &self.label)
            .field("receipts", &self.receipts.len())
            .field("subscriptions", &self.subscriptions.len())
            .field("disconnect_receipt", &self.disconnect_receipt)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub(crate) fn new(writer: Box<dyn TransportWriter>, delivery: Delivery, label: String) -> Self {
        Self {
            writer,
            receipts: HashMap::new(),
            subscriptions: HashMap::new(),
            disconnect_receipt: None,
            delivery,
            label,
        }
    }

    /// Run until an `ERROR`, the `DISCONNECT` receipt, cancellation, loss of
    /// the inbound feed, or every caller handle being dropped.
    ///
    /// The transport is closed exactly once, on the way out.
    pub(crate) async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Frame>,
        mut requests: mpsc::Receiver<WriteRequest>,
    ) {
        log::debug!("[stomp] {}: dispatch loop started", self.label);
        let cancel = self.delivery.cancel.clone();

        loop {
            let flow = tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(frame) => self.route(frame).await,
                    None => {
                        log::warn!("[stomp] {}: inbound feed ended", self.label);
                        self.fail_all(Frame::error("session closed")).await;
                        Flow::Stop
                    }
                },

                request = requests.recv() => match request {
                    Some(request) => {
                        self.handle_write(request).await;
                        Flow::Continue
                    }
                    None => {
                        log::debug!("[stomp] {}: all client handles dropped", self.label);
                        Flow::Stop
                    }
                },

                () = cancel.cancelled() => {
                    log::info!("[stomp] {}: connection cancelled", self.label);
                    self.fail_all(Frame::error("connection cancelled")).await;
                    Flow::Stop
                }
            };

            if matches!(flow, Flow::Stop) {
                break;
            }
        }

        self.shutdown().await;
    }

    /// Route one inbound frame.
    async fn route(&mut self, frame: Frame) -> Flow {
        match frame.command {
            Command::Receipt => self.route_receipt(frame).await,
            Command::Error => {
                log::error!(
                    "[stomp] {}: received ERROR ({}); closing underlying connection",
                    self.label,
                    frame.error_message()
                );
                self.fail_all(frame).await;
                Flow::Stop
            }
            Command::Message => {
                self.route_message(frame).await;
                Flow::Continue
            }
            _ => {
                log::debug!("[stomp] {}: ignoring {} frame", self.label, frame.command);
                Flow::Continue
            }
        }
    }

    async fn route_receipt(&mut self, frame: Frame) -> Flow {
        let Some(id) = frame.contains(headers::RECEIPT_ID).map(str::to_string) else {
            log::error!("[stomp] {}: RECEIPT without receipt-id", self.label);
            self.fail_all(Frame::error("missing receipt-id")).await;
            return Flow::Stop;
        };

        match self.receipts.remove(&id) {
            // The sink is dropped after this arm, closing it for the waiter.
            Some(sink) => {
                if !self.delivery.deliver(&sink, frame).await {
                    log::debug!("[stomp] {}: waiter for receipt {id} is gone", self.label);
                }
            }
            None => log::debug!("[stomp] {}: no pending receipt {id}", self.label),
        }

        if self.disconnect_receipt.as_deref() == Some(id.as_str()) {
            log::info!("[stomp] {}: disconnect acknowledged", self.label);
            return Flow::Stop;
        }
        Flow::Continue
    }

    async fn route_message(&mut self, frame: Frame) {
        let Some(id) = frame.contains(headers::SUBSCRIPTION).map(str::to_string) else {
            log::warn!("[stomp] {}: MESSAGE without subscription header dropped", self.label);
            return;
        };

        let Some(sink) = self.subscriptions.get(&id) else {
            log::info!("[stomp] {}: ignored MESSAGE for subscription {id}", self.label);
            return;
        };

        if !self.delivery.deliver(sink, frame).await {
            log::info!(
                "[stomp] {}: subscriber for {id} went away; removing subscription",
                self.label
            );
            self.subscriptions.remove(&id);
        }
    }

    /// Register the request's sink, then write the frame.
    async fn handle_write(&mut self, request: WriteRequest) {
        let WriteRequest { frame, reply } = request;

        if let Some(sink) = reply {
            if let Some(receipt) = frame.contains(headers::RECEIPT) {
                self.receipts.insert(receipt.to_string(), sink.clone());
            }
            if frame.command == Command::Subscribe {
                match frame.contains(headers::ID) {
                    Some(id) => {
                        self.subscriptions.insert(id.to_string(), sink);
                    }
                    None => log::warn!(
                        "[stomp] {}: SUBSCRIBE without id; its messages cannot be routed",
                        self.label
                    ),
                }
            }
        }

        match frame.command {
            Command::Unsubscribe => {
                // Removed before sending: anything still in flight for this
                // id becomes a routing miss.
                if let Some(id) = frame.contains(headers::ID) {
                    if self.subscriptions.remove(id).is_some() {
                        log::debug!("[stomp] {}: removed subscription {id}", self.label);
                    }
                }
            }
            Command::Disconnect => {
                self.disconnect_receipt = frame.contains(headers::RECEIPT).map(str::to_string);
            }
            _ => {}
        }

        if let Err(e) = self.writer.send(frame.encode().as_bytes()).await {
            log::warn!(
                "[stomp] {}: Can't send {} frame: {e:#}",
                self.label,
                frame.command
            );
        }
    }

    /// Deliver `frame` to every waiter once, then drop every sink.
    async fn fail_all(&mut self, frame: Frame) {
        let mut sinks: Vec<FrameSink> = Vec::new();
        let drained = self
            .receipts
            .drain()
            .chain(self.subscriptions.drain())
            .map(|(_, sink)| sink);
        for sink in drained {
            // A subscription that asked for a receipt sits in both tables.
            if !sinks.iter().any(|s| s.same_channel(&sink)) {
                sinks.push(sink);
            }
        }

        log::debug!(
            "[stomp] {}: failing {} waiter(s) with: {}",
            self.label,
            sinks.len(),
            frame.error_message()
        );
        let handoffs = sinks
            .iter()
            .map(|sink| self.delivery.deliver_terminal(sink, frame.clone()));
        let missed = futures_util::future::join_all(handoffs)
            .await
            .into_iter()
            .filter(|delivered| !delivered)
            .count();
        if missed > 0 {
            log::warn!(
                "[stomp] {}: {missed} waiter(s) gone or not reading; terminal frame not delivered to them",
                self.label
            );
        }
    }

    async fn shutdown(mut self) {
        self.delivery.cancel.cancel();
        if let Err(e) = self.writer.close().await {
            log::debug!("[stomp] {}: transport close failed: {e:#}", self.label);
        }
        log::info!("[stomp] {}: Connection closed", self.label);
    }
}

/// Read raw messages, decode payloads and forward frames to the loop.
///
/// Stops on cancellation, on a SockJS close, at end of stream, or after
/// forwarding a synthetic `ERROR` for a receive failure.
pub(crate) async fn run_reader(
    mut reader: Box<dyn TransportReader>,
    inbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    label: String,
) {
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => break,
            received = reader.receive() => received,
        };

        let frame = match received {
            Some(Ok(raw)) => match sockjs::classify(&raw) {
                MessageKind::Heartbeat | MessageKind::Open | MessageKind::Empty => continue,
                MessageKind::Payload => match Frame::decode(&raw) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("[stomp] {label}: skipping undecodable payload: {e}");
                        continue;
                    }
                },
                MessageKind::Close => {
                    log::info!("[stomp] {label}: session closed by server");
                    break;
                }
                MessageKind::Unknown(tag) => {
                    log::debug!(
                        "[stomp] {label}: skipping message with tag {:?}",
                        char::from(tag)
                    );
                    continue;
                }
            },
            Some(Err(e)) => {
                log::error!("[stomp] {label}: An error occurred while reading message: {e:#}");
                forward(&inbound, &cancel, Frame::error(format!("{e:#}"))).await;
                break;
            }
            None => {
                log::info!("[stomp] {label}: transport stream ended");
                break;
            }
        };

        if !forward(&inbound, &cancel, frame).await {
            break;
        }
    }
    log::debug!("[stomp] {label}: reader stopped");
}

async fn forward(inbound: &mpsc::Sender<Frame>, cancel: &CancellationToken, frame: Frame) -> bool {
    tokio::select! {
        sent = inbound.send(frame) => sent.is_ok(),
        () = cancel.cancelled() => false,
    }
}
