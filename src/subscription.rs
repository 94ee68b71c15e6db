//! Caller-facing handle for one subscription.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::dispatch::Outbox;
use crate::error::StompError;
use crate::frame::{headers, Command, Frame};

/// Stream of frames for one topic.
///
/// Yields `MESSAGE` frames routed to this subscription, then at most one
/// `ERROR` frame if the connection fails, then `None`.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    topic: String,
    frames: mpsc::Receiver<Frame>,
    /// Frames that arrived before a subscribe receipt was confirmed.
    pending: VecDeque<Frame>,
    outbox: Outbox,
    /// Label of the owning connection, for log lines.
    label: String,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        topic: String,
        frames: mpsc::Receiver<Frame>,
        pending: VecDeque<Frame>,
        outbox: Outbox,
        label: String,
    ) -> Self {
        Self {
            id,
            topic,
            frames,
            pending,
            outbox,
            label,
        }
    }

    /// Subscription id sent in the `id` header.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Destination this subscription listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Session path of the connection this subscription belongs to.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Next frame, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        if let Some(frame) = self.pending.pop_front() {
            return Some(frame);
        }
        self.frames.recv().await
    }

    /// Next frame if one is already buffered.
    pub fn try_recv(&mut self) -> Result<Frame, TryRecvError> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(frame);
        }
        self.frames.try_recv()
    }

    /// Send `UNSUBSCRIBE` for this subscription without waiting for a reply.
    ///
    /// The routing entry is removed when the frame is dispatched, after which
    /// [`recv`](Self::recv) drains what was already buffered and returns
    /// `None`.
    pub async fn unsubscribe(&self) -> Result<(), StompError> {
        log::debug!(
            "[stomp] {}: Unsubscribing {} from {}",
            self.label,
            self.id,
            self.topic
        );
        let frame = Frame::new(Command::Unsubscribe).header(headers::ID, &self.id);
        self.outbox.submit(frame, None).await
    }
}
