//! # parley-core
//!
//! Pure logic for Parley (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms of the realtime
//! transport without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (network, timers) is performed by `parley-client`, which
//! interprets the actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cursor;
pub mod outbox;
pub mod state;
pub mod sync;

pub use cursor::CursorTracker;
pub use outbox::{OutboxError, Outbox, OutgoingMessage, DEFAULT_CAPACITY, MAX_ATTEMPTS};
pub use state::{
    Action, Backoff, ConnectionMachine, ConnectionState, Event, LifecycleEvent,
    HEARTBEAT_INTERVAL, IDLE_TIMEOUT, INITIAL_BACKOFF, MAX_BACKOFF,
};
pub use sync::{Applied, ConversationSync, SyncState};
