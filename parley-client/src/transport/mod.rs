//! Transport abstraction for Parley.
//!
//! This module provides a pluggable transport layer that abstracts
//! the underlying connection mechanism (WebSocket, mock for testing).
//!
//! # Design
//!
//! The transport trait is async and connection-oriented and carries whole
//! text frames; it knows nothing about the frame grammar:
//! - `connect()` establishes a connection
//! - `send()` transmits one encoded frame
//! - `recv()` receives one encoded frame
//! - `close()` gracefully terminates
//!
//! `send()` and `recv()` take `&self` so one writer task and one reader task
//! can share the transport without an outer lock.
//!
//! # Example
//!
//! ```ignore
//! let transport = WsTransport::new();
//! transport.connect("ws://localhost:8080/socket").await?;
//! transport.send("2".to_string()).await?;
//! let frame = transport.recv().await?;
//! ```

mod mock;
mod ws;

pub use mock::MockTransport;
pub use ws::WsTransport;

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// Transport trait for exchanging protocol frames.
///
/// Implementations handle the underlying connection mechanism
/// (WebSocket, mock, etc).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to the server at `url`.
    ///
    /// Calling `connect` again replaces any previous connection.
    async fn connect(&self, url: &str) -> Result<(), TransportError>;

    /// Send one encoded frame.
    async fn send(&self, frame: String) -> Result<(), TransportError>;

    /// Receive one encoded frame.
    ///
    /// Blocks until a frame is available or the connection closes.
    async fn recv(&self) -> Result<String, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}
