//! Offline outbox for Parley.
//!
//! Outgoing messages flow through the outbox in this order:
//! 1. `enqueue()` - QUEUED, waiting for a connection
//! 2. `next_ready()` - SENDING, handed to the transport
//! 3. `mark_sent()` - SENT, removed (the server stored it)
//!
//! A failed attempt moves the entry back to QUEUED. After [`MAX_ATTEMPTS`]
//! failed attempts the entry is FAILED and stays put until the application
//! calls `retry()` or `discard()`. Entries keep their enqueue order.

use std::collections::VecDeque;

use parley_types::{ChatMessage, ConversationId, DeliveryStatus, LocalId};
use thiserror::Error;

/// Failed attempts before an entry is surfaced as FAILED.
pub const MAX_ATTEMPTS: u32 = 3;

/// Default maximum number of entries (queued + sending + failed).
pub const DEFAULT_CAPACITY: usize = 1000;

/// Error type for outbox operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutboxError {
    /// Outbox is at capacity.
    #[error("outbox full (capacity: {capacity})")]
    Full {
        /// Current outbox capacity.
        capacity: usize,
    },

    /// No entry with this local id.
    #[error("no outbox entry for {0}")]
    NotFound(LocalId),

    /// Entry exists but is not in the FAILED state.
    #[error("outbox entry {0} is not failed")]
    NotFailed(LocalId),
}

/// An outgoing message tracked by the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Idempotency key sent with every attempt.
    pub local_id: LocalId,
    /// Target conversation (`None` starts a new one).
    pub conversation_id: Option<ConversationId>,
    /// Message text.
    pub body: String,
    /// Delivery state.
    pub status: DeliveryStatus,
    /// Failed attempts so far.
    pub attempts: u32,
}

impl OutgoingMessage {
    /// Create a QUEUED message with a fresh local id.
    pub fn new(conversation_id: Option<ConversationId>, body: impl Into<String>) -> Self {
        Self {
            local_id: LocalId::new(),
            conversation_id,
            body: body.into(),
            status: DeliveryStatus::Queued,
            attempts: 0,
        }
    }
}

/// FIFO outbox with per-entry delivery state.
#[derive(Debug, Clone)]
pub struct Outbox {
    capacity: usize,
    entries: VecDeque<OutgoingMessage>,
}

impl Outbox {
    /// Create an outbox holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::new(),
        }
    }

    /// Add a message. Fails if the outbox is full.
    pub fn enqueue(&mut self, message: OutgoingMessage) -> Result<LocalId, OutboxError> {
        if self.entries.len() >= self.capacity {
            return Err(OutboxError::Full {
                capacity: self.capacity,
            });
        }
        let local_id = message.local_id;
        self.entries.push_back(message);
        Ok(local_id)
    }

    /// Mark the oldest QUEUED entry as SENDING and return a copy of it.
    pub fn next_ready(&mut self) -> Option<OutgoingMessage> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.status == DeliveryStatus::Queued)?;
        entry.status = DeliveryStatus::Sending;
        Some(entry.clone())
    }

    /// The server stored the message: remove it and return it as SENT.
    ///
    /// Matching is by local id only, so an ack reply and a live echo of the
    /// same message resolve the same entry; the second one returns `None`.
    pub fn mark_sent(&mut self, stored: &ChatMessage) -> Option<OutgoingMessage> {
        let index = self
            .entries
            .iter()
            .position(|e| e.local_id == stored.local_id)?;
        let mut entry = self.entries.remove(index)?;
        entry.status = DeliveryStatus::Sent;
        entry.conversation_id = Some(stored.conversation_id);
        Some(entry)
    }

    /// Record a failed attempt (timeout or error reply).
    ///
    /// Returns the resulting status: QUEUED for another try, or FAILED once
    /// [`MAX_ATTEMPTS`] is reached.
    pub fn mark_attempt_failed(&mut self, local_id: &LocalId) -> Option<DeliveryStatus> {
        let entry = self.entry_mut(local_id)?;
        entry.attempts += 1;
        entry.status = if entry.attempts >= MAX_ATTEMPTS {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::Queued
        };
        Some(entry.status)
    }

    /// The connection went away mid-send: back to QUEUED without counting
    /// an attempt.
    pub fn requeue(&mut self, local_id: &LocalId) {
        if let Some(entry) = self.entry_mut(local_id) {
            if entry.status == DeliveryStatus::Sending {
                entry.status = DeliveryStatus::Queued;
            }
        }
    }

    /// Requeue every SENDING entry (connection teardown).
    pub fn requeue_in_flight(&mut self) -> usize {
        let mut count = 0;
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.status == DeliveryStatus::Sending)
        {
            entry.status = DeliveryStatus::Queued;
            count += 1;
        }
        count
    }

    /// Manually retry a FAILED entry with a fresh attempt budget.
    pub fn retry(&mut self, local_id: &LocalId) -> Result<(), OutboxError> {
        let entry = self
            .entry_mut(local_id)
            .ok_or(OutboxError::NotFound(*local_id))?;
        if entry.status != DeliveryStatus::Failed {
            return Err(OutboxError::NotFailed(*local_id));
        }
        entry.status = DeliveryStatus::Queued;
        entry.attempts = 0;
        Ok(())
    }

    /// Drop an entry regardless of state.
    pub fn discard(&mut self, local_id: &LocalId) -> Option<OutgoingMessage> {
        let index = self.entries.iter().position(|e| &e.local_id == local_id)?;
        self.entries.remove(index)
    }

    /// Look up an entry.
    pub fn get(&self, local_id: &LocalId) -> Option<&OutgoingMessage> {
        self.entries.iter().find(|e| &e.local_id == local_id)
    }

    /// Entries waiting for manual retry.
    pub fn failed(&self) -> Vec<OutgoingMessage> {
        self.entries
            .iter()
            .filter(|e| e.status == DeliveryStatus::Failed)
            .cloned()
            .collect()
    }

    /// Whether any entry is QUEUED.
    pub fn has_ready(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.status == DeliveryStatus::Queued)
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the outbox is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_mut(&mut self, local_id: &LocalId) -> Option<&mut OutgoingMessage> {
        self.entries.iter_mut().find(|e| &e.local_id == local_id)
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
