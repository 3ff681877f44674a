//! Per-conversation sequence cursor.
//!
//! Sequences are gap-free per conversation and assigned by the persistence
//! layer. The tracker records which sequences have been observed and exposes
//! the highest contiguous one, which is the resync cursor: everything up to
//! it has been applied, so a resync asks for messages strictly after it.

use std::collections::BTreeSet;

use parley_types::Sequence;

/// Tracks observed sequences and detects gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorTracker {
    /// Sequences observed above the contiguous point.
    ahead: BTreeSet<u64>,
    /// Highest sequence with no gaps below it.
    contiguous: u64,
}

impl CursorTracker {
    /// Maximum gap enumerated by [`missing`](Self::missing).
    const MAX_GAP: u64 = 10_000;

    /// Create a tracker that has observed nothing.
    pub fn new() -> Self {
        Self::with_cursor(Sequence::zero())
    }

    /// Resume from a persisted cursor.
    pub fn with_cursor(cursor: Sequence) -> Self {
        Self {
            ahead: BTreeSet::new(),
            contiguous: cursor.value(),
        }
    }

    /// Record an observed sequence. Returns `false` if it was already seen.
    pub fn observe(&mut self, sequence: Sequence) -> bool {
        let value = sequence.value();
        if value <= self.contiguous || !self.ahead.insert(value) {
            return false;
        }
        let mut next = self.contiguous + 1;
        while self.ahead.remove(&next) {
            self.contiguous = next;
            next += 1;
        }
        true
    }

    /// Whether `sequence` has already been observed.
    pub fn contains(&self, sequence: Sequence) -> bool {
        let value = sequence.value();
        value <= self.contiguous || self.ahead.contains(&value)
    }

    /// Highest contiguous sequence (the resync cursor).
    pub fn cursor(&self) -> Sequence {
        Sequence::new(self.contiguous)
    }

    /// Highest sequence observed, contiguous or not.
    pub fn highest(&self) -> Sequence {
        Sequence::new(self.ahead.last().copied().unwrap_or(self.contiguous))
    }

    /// Check if there are sequences missing below the highest observed.
    pub fn has_gaps(&self) -> bool {
        !self.ahead.is_empty()
    }

    /// Sequences missing between the cursor and the highest observed.
    ///
    /// Returns empty when the gap exceeds 10 000 entries; the caller should
    /// resync from the cursor instead.
    pub fn missing(&self) -> Vec<Sequence> {
        let Some(&max) = self.ahead.last() else {
            return Vec::new();
        };
        if max - self.contiguous > Self::MAX_GAP {
            return Vec::new();
        }
        ((self.contiguous + 1)..max)
            .filter(|s| !self.ahead.contains(s))
            .map(Sequence::new)
            .collect()
    }

    /// Treat everything up to `sequence` as observed.
    ///
    /// Used when the server reports a cursor the client has no use
    /// for catching up to (for example a freshly joined room).
    pub fn advance_to(&mut self, sequence: Sequence) {
        let value = sequence.value();
        if value <= self.contiguous {
            return;
        }
        self.ahead.retain(|&s| s > value);
        self.contiguous = value;
        let mut next = value + 1;
        while self.ahead.remove(&next) {
            self.contiguous = next;
            next += 1;
        }
    }
}

impl Default for CursorTracker {
    fn default() -> Self {
        Self::new()
    }
}
