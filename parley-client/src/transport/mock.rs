//! Mock transport for testing.
//!
//! Allows scripting server frames and capturing sent frames for verification.
//! Every `connect()` opens a fresh in-memory channel; frames queued with
//! [`MockTransport::queue_response`] are delivered on the next connection,
//! and an optional responder answers sent frames like a tiny server.

use super::{Transport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type Responder = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// Mock transport for testing.
#[derive(Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    incoming: Arc<tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
}

#[derive(Default)]
struct MockTransportInner {
    connected: bool,
    connected_address: Option<String>,
    connect_count: usize,
    sent_frames: Vec<String>,
    pending: VecDeque<String>,
    on_connect: Vec<String>,
    responder: Option<Responder>,
    feed: Option<mpsc::UnboundedSender<String>>,
    fail_next_connect: Option<String>,
    fail_next_send: Option<String>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("MockTransport")
            .field("connected", &inner.connected)
            .field("connect_count", &inner.connect_count)
            .field("sent_frames", &inner.sent_frames.len())
            .finish()
    }
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame for `recv()`.
    ///
    /// Delivered immediately when connected, otherwise on the next connect.
    pub fn queue_response(&self, frame: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        let frame = frame.into();
        match &inner.feed {
            Some(feed) if inner.connected => {
                let _ = feed.send(frame);
            }
            _ => inner.pending.push_back(frame),
        }
    }

    /// Frames delivered at the start of every connection (e.g. the OPEN frame).
    pub fn on_every_connect(&self, frames: Vec<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.on_connect = frames;
    }

    /// Answer every sent frame with the frames returned by `responder`.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.responder = Some(Arc::new(responder));
    }

    /// Simulate the server dropping the connection.
    pub fn drop_connection(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        inner.feed = None;
    }

    /// Get all frames that were sent.
    pub fn sent_frames(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.sent_frames.clone()
    }

    /// Get the last frame that was sent.
    pub fn last_sent(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.sent_frames.last().cloned()
    }

    /// Get the address that was connected to.
    pub fn connected_address(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.connected_address.clone()
    }

    /// Number of successful `connect()` calls.
    pub fn connect_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.connect_count
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_connect = Some(error.to_string());
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_send = Some(error.to_string());
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            incoming: Arc::clone(&self.incoming),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let rx = {
            let mut inner = self.inner.lock().unwrap();

            // Check for forced failure
            if let Some(error) = inner.fail_next_connect.take() {
                return Err(TransportError::ConnectionFailed(error));
            }

            // Dropping the old feed ends any recv() still parked on it.
            let (tx, rx) = mpsc::unbounded_channel();
            for frame in inner.on_connect.iter().cloned() {
                let _ = tx.send(frame);
            }
            while let Some(frame) = inner.pending.pop_front() {
                let _ = tx.send(frame);
            }
            inner.feed = Some(tx);
            inner.connected = true;
            inner.connect_count += 1;
            inner.connected_address = Some(address.to_string());
            rx
        };
        *self.incoming.lock().await = Some(rx);
        Ok(())
    }

    async fn send(&self, frame: String) -> Result<(), TransportError> {
        let responder = {
            let mut inner = self.inner.lock().unwrap();

            if !inner.connected {
                return Err(TransportError::NotConnected);
            }

            // Check for forced failure
            if let Some(error) = inner.fail_next_send.take() {
                return Err(TransportError::SendFailed(error));
            }

            inner.sent_frames.push(frame.clone());
            inner.responder.clone()
        };

        if let Some(responder) = responder {
            let replies = responder(&frame);
            let inner = self.inner.lock().unwrap();
            if let Some(feed) = &inner.feed {
                for reply in replies {
                    let _ = feed.send(reply);
                }
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut incoming = self.incoming.lock().await;
        let rx = incoming.as_mut().ok_or(TransportError::NotConnected)?;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        inner.feed = None;
        Ok(())
    }
}
