//! Rate limiting for parley-relay.
//!
//! Provides protection against connection flooding and event spam.
//!
//! ## Design Notes
//!
//! WebSocket peers are rate limited by:
//! - **remote IP** for new connections
//! - **ConnectionId** for inbound events
//!
//! plus one global limiter on events across all connections. Keyed limiters
//! use the governor crate backed by DashMap.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parley_types::ConnectionId;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the relay server.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits connection attempts per remote IP.
    connection_limiter: Arc<KeyedLimiter<IpAddr>>,

    /// Limits inbound events per connection.
    event_limiter: Arc<KeyedLimiter<ConnectionId>>,

    /// Caps aggregate event throughput even when every connection is
    /// within its own quota.
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_limiter", &"KeyedLimiter<IpAddr>")
            .field("event_limiter", &"KeyedLimiter<ConnectionId>")
            .field("global_limiter", &"DirectLimiter")
            .finish()
    }
}

/// A zero quota would make governor panic; treat it as one.
fn quota_value(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

impl RateLimits {
    /// Create rate limiters from configuration.
    pub fn new(config: &LimitsConfig) -> Self {
        let connection_quota = Quota::per_minute(quota_value(config.connections_per_ip));
        let event_quota = Quota::per_minute(quota_value(config.events_per_minute));
        let global_quota = Quota::per_second(quota_value(config.global_events_per_second));

        Self {
            connection_limiter: Arc::new(RateLimiter::keyed(connection_quota)),
            event_limiter: Arc::new(RateLimiter::keyed(event_quota)),
            global_limiter: Arc::new(RateLimiter::direct(global_quota)),
        }
    }

    /// Check if a connection attempt from `ip` is allowed.
    pub fn check_connection(&self, ip: &IpAddr) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(ip)
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Check if an inbound event on `connection` is allowed.
    ///
    /// The global limit is checked after the per-connection one, so a noisy
    /// connection cannot drain the shared budget.
    pub fn check_event(&self, connection: &ConnectionId) -> Result<(), RateLimitError> {
        self.event_limiter
            .check_key(connection)
            .map_err(|_| RateLimitError::EventLimitExceeded)?;
        self.check_global()
    }

    /// Check if the global event rate is within limits.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }

    /// Get the number of tracked connection keys (for metrics).
    pub fn connection_keys_count(&self) -> usize {
        self.connection_limiter.len()
    }

    /// Get the number of tracked event keys (for metrics).
    pub fn event_keys_count(&self) -> usize {
        self.event_limiter.len()
    }

    /// Evict stale entries from the keyed limiters.
    ///
    /// `retain_recent()` removes entries whose cells have fully recharged,
    /// which covers closed connections. Called from the cleanup task.
    pub fn shrink(&self) {
        self.connection_limiter.retain_recent();
        self.event_limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many connection attempts from this address.
    #[error("connection rate limit exceeded")]
    ConnectionLimitExceeded,
    /// Too many events on this connection.
    #[error("event rate limit exceeded")]
    EventLimitExceeded,
    /// Global event rate exceeded across all connections.
    #[error("global rate limit exceeded")]
    GlobalLimitExceeded,
}
