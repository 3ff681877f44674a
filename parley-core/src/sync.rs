//! Ordered, idempotent application of incoming messages.
//!
//! Messages reach the client two ways: live pushes (`new_message`) and
//! resync pages (`sync` replies). Both go through [`ConversationSync`], which
//! guarantees the application sees every message exactly once and in
//! non-decreasing sequence order:
//!
//! - a sequence at or below the cursor is a duplicate and is dropped
//! - the next expected sequence is delivered, followed by any held
//!   messages it unblocks
//! - a sequence beyond the next expected one is held back and the caller is
//!   told to resync from the cursor
//!
//! A stored message has exactly one sequence, so deduplicating by sequence
//! also deduplicates by `localId` and `serverId`.

use std::collections::{BTreeMap, HashMap};

use parley_types::{ChatMessage, ConversationId, DeviceId, Sequence, ServerId};

use crate::cursor::CursorTracker;

/// Held-back messages kept per conversation before the oldest are dropped.
pub const MAX_HELD: usize = 500;

/// Result of applying one or more messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    /// Messages to hand to the application, in sequence order.
    pub delivered: Vec<ChatMessage>,
    /// A gap was detected; fetch messages after [`ConversationSync::cursor`].
    pub needs_resync: bool,
}

impl Applied {
    /// Server ids of delivered messages not authored by `me`.
    ///
    /// These are acknowledged back with `messages_delivered`.
    pub fn receipts_for(&self, me: &DeviceId) -> Vec<ServerId> {
        self.delivered
            .iter()
            .filter(|m| !m.sender.is_device(me))
            .map(|m| m.server_id)
            .collect()
    }

    fn merge(&mut self, other: Applied) {
        self.delivered.extend(other.delivered);
        self.needs_resync |= other.needs_resync;
    }
}

/// Sync state of one conversation.
#[derive(Debug, Clone)]
pub struct ConversationSync {
    conversation_id: ConversationId,
    cursor: CursorTracker,
    held: BTreeMap<u64, ChatMessage>,
}

impl ConversationSync {
    /// Start tracking a conversation from sequence zero.
    pub fn new(conversation_id: ConversationId) -> Self {
        Self::with_cursor(conversation_id, Sequence::zero())
    }

    /// Resume tracking from a persisted cursor.
    pub fn with_cursor(conversation_id: ConversationId, cursor: Sequence) -> Self {
        Self {
            conversation_id,
            cursor: CursorTracker::with_cursor(cursor),
            held: BTreeMap::new(),
        }
    }

    /// Conversation tracked.
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Highest sequence delivered with no gap below it.
    pub fn cursor(&self) -> Sequence {
        self.cursor.cursor()
    }

    /// Number of messages held back waiting for a gap to fill.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Apply one message (live push or resync page entry).
    pub fn apply(&mut self, message: ChatMessage) -> Applied {
        let mut applied = Applied::default();
        if message.conversation_id != self.conversation_id {
            return applied;
        }

        let sequence = message.sequence;
        if self.cursor.contains(sequence) {
            return applied;
        }

        if sequence == self.cursor().next() {
            self.cursor.observe(sequence);
            applied.delivered.push(message);
            self.release_held(&mut applied);
        } else {
            self.held.insert(sequence.value(), message);
            if self.held.len() > MAX_HELD {
                // Dropped entries come back with the resync.
                self.held.pop_last();
            }
            applied.needs_resync = true;
        }
        applied
    }

    /// Apply a resync page. Order within the page does not matter.
    pub fn apply_batch(&mut self, mut messages: Vec<ChatMessage>) -> Applied {
        messages.sort_by_key(|m| m.sequence);
        let mut applied = Applied::default();
        for message in messages {
            applied.merge(self.apply(message));
        }
        // Gaps inside a page are resolved by the page itself; anything still
        // held after it is reported once.
        applied.needs_resync = !self.held.is_empty();
        applied
    }

    fn release_held(&mut self, applied: &mut Applied) {
        loop {
            let next = self.cursor().next().value();
            let Some(message) = self.held.remove(&next) else {
                break;
            };
            self.cursor.observe(message.sequence);
            applied.delivered.push(message);
        }
        // Anything left at or below the cursor is stale.
        let cursor = self.cursor().value();
        self.held.retain(|&s, _| s > cursor);
    }
}

/// Sync state for every conversation the client has seen.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    conversations: HashMap<ConversationId, ConversationSync>,
}

impl SyncState {
    /// Create empty sync state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or start tracking a conversation.
    pub fn conversation(&mut self, id: ConversationId) -> &mut ConversationSync {
        self.conversations
            .entry(id)
            .or_insert_with(|| ConversationSync::new(id))
    }

    /// Restore a persisted cursor.
    pub fn restore(&mut self, id: ConversationId, cursor: Sequence) {
        self.conversations
            .insert(id, ConversationSync::with_cursor(id, cursor));
    }

    /// Apply a message to its conversation.
    pub fn apply(&mut self, message: ChatMessage) -> Applied {
        self.conversation(message.conversation_id).apply(message)
    }

    /// Current cursor of every tracked conversation.
    pub fn cursors(&self) -> Vec<(ConversationId, Sequence)> {
        self.conversations
            .values()
            .map(|c| (c.conversation_id(), c.cursor()))
            .collect()
    }
}
