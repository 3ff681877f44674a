//! # parley-client
//!
//! Client SDK core for the Parley realtime chat protocol.
//!
//! This is the library that mobile and desktop apps embed to talk to a
//! Parley relay.
//!
//! ## Features
//!
//! - **Offline-first**: messages queue in an outbox and drain on reconnect
//! - **Gap-free delivery**: per-conversation cursors with automatic resync
//! - **Transport Abstraction**: Pluggable transport layer (WebSocket, mock)
//! - **Pure State Machine**: Uses parley-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use parley_client::{ChatClient, ClientConfig, DefaultPlatform, WsTransport};
//!
//! let config = ClientConfig::new("ws://localhost:8080/socket", "acme", "device-1", "token");
//! let (client, mut notifications) = ChatClient::new(config, WsTransport::new(), DefaultPlatform);
//! client.connect()?;
//!
//! // Queued until the connection is up, then sent in order
//! client.send_message(None, "Hi there")?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod acks;
pub mod client;
pub mod connection;
pub mod platform;
pub mod transport;

pub use acks::{AckError, AckRegistry, ACK_TIMEOUT};
pub use client::{ChatClient, ClientConfig, ClientError, ClientNotification};
pub use connection::{Connection, ConnectionConfig, ConnectionSignal, Signal};
pub use platform::{DefaultPlatform, Platform};
pub use transport::{MockTransport, Transport, TransportError, WsTransport};
