//! Key-value store collaborator.
//!
//! Presence and room membership live here instead of in process memory, so
//! several relay processes can share them. The operations mirror what a
//! Redis-like server offers: plain values and sets, each with an optional
//! TTL, with set mutations reporting the resulting cardinality atomically.

mod memory;

pub use memory::MemoryStore;

use crate::error::KvResult;
use async_trait::async_trait;
use std::time::Duration;

/// Outcome of a set mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetChange {
    /// Whether the member was actually added or removed.
    pub changed: bool,
    /// Cardinality of the set after the mutation.
    pub cardinality: usize,
}

/// Trait for key-value backends.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store a plain value, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> KvResult<()>;

    /// Read a plain value.
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Delete a key of any kind. Returns whether it existed.
    async fn delete(&self, key: &str) -> KvResult<bool>;

    /// Add a member to a set and re-arm the set's TTL.
    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> KvResult<SetChange>;

    /// Remove a member from a set. Empty sets are deleted.
    async fn set_remove(&self, key: &str, member: &str) -> KvResult<SetChange>;

    /// All members of a set (empty when the key is missing).
    async fn members(&self, key: &str) -> KvResult<Vec<String>>;

    /// Cardinality of a set (0 when the key is missing).
    async fn cardinality(&self, key: &str) -> KvResult<usize>;

    /// Read several plain values in one atomic step.
    async fn get_many(&self, keys: &[String]) -> KvResult<Vec<Option<String>>>;

    /// Re-arm the TTL of an existing key. Returns whether the key exists.
    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool>;

    /// Drop every expired entry. Returns how many were removed.
    async fn sweep_expired(&self) -> KvResult<usize>;
}
