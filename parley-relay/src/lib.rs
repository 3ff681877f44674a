//! # parley-relay
//!
//! Realtime relay server for Parley chat.
//!
//! The relay speaks a Socket.IO-compatible protocol over WebSockets:
//! - end-user devices connect to `/` and chat within their conversation
//! - operators connect to `/admin` and see every conversation of their app
//! - messages are persisted with per-conversation sequences so clients can
//!   resume from a cursor after going offline
//!
//! ## Architecture
//!
//! ```text
//! Device ──┐                      ┌── Operator
//!          │   WebSocket (/)      │   WebSocket (/admin)
//!          ▼                      ▼
//!      ┌──────────────────────────────┐
//!      │          parley-relay         │
//!      │  sessions → ChatRelay → Router │
//!      │  ┌────────────┐ ┌──────────┐  │
//!      │  │ SQLite log │ │ KV store │  │
//!      │  └────────────┘ └──────────┘  │
//!      └──────────────────────────────┘
//! ```
//!
//! The KV store holds presence records and room membership; SQLite holds
//! conversations, messages, and delivery receipts.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod http;
pub mod kv;
pub mod limits;
pub mod presence;
pub mod push;
pub mod router;
pub mod server;
pub mod session;
pub mod storage;
pub mod ws;
