//! Request/response correlation over EVENT and ACK packets.
//!
//! Every acked emit takes a fresh 64-bit id from a per-connection counter,
//! parks a completion in the registry and waits at most [`ACK_TIMEOUT`].
//! Exactly one of these removes the entry: the matching ACK, the timeout,
//! or connection teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use parley_types::{AckReply, RemoteError};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Fixed time to wait for an ACK.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Why an acked emit did not produce a reply payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AckError {
    /// No reply within [`ACK_TIMEOUT`].
    #[error("ack timed out")]
    Timeout,

    /// The connection closed before the reply arrived.
    #[error("connection closed before ack")]
    ConnectionClosed,

    /// The server answered with an error.
    #[error("server rejected request: {0}")]
    Remote(#[from] RemoteError),

    /// The reply could not be decoded.
    #[error("malformed ack: {0}")]
    Malformed(String),
}

type Completion = oneshot::Sender<Vec<Value>>;

/// Pending acks of one connection.
#[derive(Debug, Default)]
pub struct AckRegistry {
    next_id: AtomicU64,
    closed: AtomicBool,
    pending: Mutex<HashMap<u64, Completion>>,
}

/// A registered ack waiting for its reply.
#[derive(Debug)]
pub struct PendingAck {
    /// Id to put on the outgoing EVENT packet.
    pub id: u64,
    rx: oneshot::Receiver<Vec<Value>>,
}

impl AckRegistry {
    /// Create an empty registry. Ids start at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id and park a completion for it.
    pub fn register(&self) -> Result<PendingAck, AckError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AckError::ConnectionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        Ok(PendingAck { id, rx })
    }

    /// Deliver an ACK. Unknown or already-settled ids are ignored.
    pub fn resolve(&self, id: u64, args: Vec<Value>) -> bool {
        match self.lock().remove(&id) {
            Some(tx) => tx.send(args).is_ok(),
            None => {
                debug!(ack_id = id, "ignoring ack for unknown id");
                false
            }
        }
    }

    /// Forget a pending ack (timeout or failed send).
    pub fn cancel(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Fail every pending ack and refuse new ones (connection teardown).
    pub fn fail_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.lock().drain().collect();
        // Dropping the senders wakes every waiter with ConnectionClosed.
        drained.len()
    }

    /// Number of acks still waiting.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Wait for the reply to `pending`, honoring [`ACK_TIMEOUT`].
    pub async fn wait(&self, pending: PendingAck) -> Result<Value, AckError> {
        self.wait_for(pending, ACK_TIMEOUT).await
    }

    /// Wait for the reply with a custom timeout.
    pub async fn wait_for(&self, pending: PendingAck, timeout: Duration) -> Result<Value, AckError> {
        let PendingAck { id, rx } = pending;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(args)) => {
                let reply = AckReply::from_args(&args)
                    .map_err(|e| AckError::Malformed(e.to_string()))?;
                Ok(reply.into_result()?)
            }
            Ok(Err(_)) => Err(AckError::ConnectionClosed),
            Err(_) => {
                self.cancel(id);
                Err(AckError::Timeout)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Completion>> {
        // A poisoned map only means a waiter panicked; the entries are still valid.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
