//! STOMP client over SockJS-framed WebSocket connections.
//!
//! A caller connects to a broker, subscribes to destinations, receives
//! messages asynchronously and issues commands that expect a receipt.
//!
//! # Architecture
//!
//! One transport is multiplexed across every logical consumer:
//!
//! - **Reader task** - decodes raw SockJS messages into frames
//! - **Dispatch loop** - owns the transport writer and the receipt and
//!   subscription tables; routes inbound frames by correlation id
//! - **Handles** - [`StompClient`] and [`Subscription`] talk to the loop
//!   through bounded channels only
//!
//! # Modules
//!
//! - [`frame`] - frame model and envelope codec
//! - [`header`] - ordered header list
//! - [`sockjs`] - message tags and session URLs
//! - [`transport`] / [`ws`] - transport traits and the WebSocket binding
//! - [`client`] / [`subscription`] - the public API
//! - [`config`] - configuration loading
//!
//! # Example
//!
//! ```no_run
//! use stomp_websocket::{ClientConfig, StompClient};
//!
//! # async fn run() -> Result<(), stomp_websocket::StompError> {
//! let client =
//!     StompClient::connect_with_token("wss://broker.example.com/stomp", "token", ClientConfig::default())
//!         .await?;
//! let mut news = client.subscribe("/topic/news").await?;
//! while let Some(frame) = news.recv().await {
//!     println!("{}", frame.body);
//! }
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod header;
pub mod sockjs;
pub mod subscription;
pub mod transport;
pub mod ws;

mod dispatch;

// Re-export commonly used types
pub use client::{StompClient, StompClientBuilder};
pub use config::{ClientConfig, DeliveryPolicy};
pub use error::StompError;
pub use frame::{Command, Frame};
pub use header::Header;
pub use subscription::Subscription;
