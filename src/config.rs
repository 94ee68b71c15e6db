//! Client configuration.
//!
//! Values come from defaults, an optional JSON file, then `STOMP_WS_*`
//! environment variables, in that order.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Versions offered in the `accept-version` header of `CONNECT`.
pub const DEFAULT_ACCEPT_VERSION: &str = "1.2,1.1,1.0";

/// Intervals offered in the `heart-beat` header of `CONNECT`.
///
/// Heartbeats from the broker are discarded; the value only tells the broker
/// what to expect.
pub const DEFAULT_HEART_BEAT: &str = "10000,10000";

/// What the dispatch loop does when a subscriber's buffer is full.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Wait for buffer space. A slow consumer stalls routing for the whole
    /// connection until it catches up or the connection is cancelled.
    #[default]
    Block,
    /// Drop the frame and log a warning. The loop never waits.
    DropWhenFull,
}

/// Configuration for a STOMP connection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// `accept-version` header value sent on `CONNECT`.
    pub accept_version: String,
    /// `heart-beat` header value sent on `CONNECT`.
    pub heart_beat: String,
    /// Fail the connect unless the broker answers with `CONNECTED`.
    pub validate_handshake: bool,
    /// Milliseconds to wait for the handshake reply.
    pub handshake_timeout_ms: u64,
    /// Milliseconds a caller may wait to hand a request to the dispatch loop.
    /// Also bounds handing a terminal `ERROR` to each waiter.
    pub submit_timeout_ms: u64,
    /// Milliseconds to wait for a requested receipt.
    pub receipt_timeout_ms: u64,
    /// Capacity of the inbound frame and outbound request queues.
    pub channel_capacity: usize,
    /// Frames buffered per subscription before the delivery policy applies.
    pub subscription_buffer: usize,
    /// Behavior on a full subscription buffer.
    pub delivery: DeliveryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            accept_version: DEFAULT_ACCEPT_VERSION.to_string(),
            heart_beat: DEFAULT_HEART_BEAT.to_string(),
            validate_handshake: true,
            handshake_timeout_ms: 10_000,
            submit_timeout_ms: 5_000,
            receipt_timeout_ms: 10_000,
            channel_capacity: 64,
            subscription_buffer: 256,
            delivery: DeliveryPolicy::Block,
        }
    }
}

impl ClientConfig {
    /// Load from a JSON file, then apply environment overrides.
    ///
    /// Missing fields keep their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `STOMP_WS_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(version) = lookup("STOMP_WS_ACCEPT_VERSION") {
            self.accept_version = version;
        }

        if let Some(heart_beat) = lookup("STOMP_WS_HEART_BEAT") {
            self.heart_beat = heart_beat;
        }

        if let Some(validate) = lookup("STOMP_WS_VALIDATE_HANDSHAKE") {
            match validate.parse::<bool>() {
                Ok(v) => self.validate_handshake = v,
                Err(_) => log::warn!("Ignoring STOMP_WS_VALIDATE_HANDSHAKE={validate}"),
            }
        }

        override_number(&lookup, "STOMP_WS_HANDSHAKE_TIMEOUT_MS", &mut self.handshake_timeout_ms);
        override_number(&lookup, "STOMP_WS_SUBMIT_TIMEOUT_MS", &mut self.submit_timeout_ms);
        override_number(&lookup, "STOMP_WS_RECEIPT_TIMEOUT_MS", &mut self.receipt_timeout_ms);
        override_number(&lookup, "STOMP_WS_CHANNEL_CAPACITY", &mut self.channel_capacity);
        override_number(&lookup, "STOMP_WS_SUBSCRIPTION_BUFFER", &mut self.subscription_buffer);

        if let Some(delivery) = lookup("STOMP_WS_DELIVERY") {
            match delivery.as_str() {
                "block" => self.delivery = DeliveryPolicy::Block,
                "drop_when_full" => self.delivery = DeliveryPolicy::DropWhenFull,
                other => log::warn!("Ignoring STOMP_WS_DELIVERY={other}"),
            }
        }
    }

    /// Handshake reply timeout.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Request hand-off timeout.
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    /// Receipt wait timeout.
    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(self.receipt_timeout_ms)
    }

    /// Queue capacity, never zero (tokio channels reject zero).
    pub(crate) fn queue_capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }

    /// Per-subscription buffer, never zero.
    pub(crate) fn subscription_capacity(&self) -> usize {
        self.subscription_buffer.max(1)
    }
}

fn override_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => log::warn!("Ignoring {key}={raw}: not a number"),
        }
    }
}
