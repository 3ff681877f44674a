//! Prometheus metrics endpoint.

use crate::server::ChatRelay;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(relay): Extension<Arc<ChatRelay>>) -> impl IntoResponse {
    let m = relay.metrics();

    // Gauges
    let connections = relay.router().connection_count();
    let limiter_keys = relay.rate_limits().event_keys_count();

    // Counters
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let conns_rejected = m.connections_rejected.load(Ordering::Relaxed);
    let auth_failures = m.auth_failures.load(Ordering::Relaxed);
    let events = m.events_total.load(Ordering::Relaxed);
    let stored = m.messages_stored.load(Ordering::Relaxed);
    let duplicates = m.duplicate_messages.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let malformed = m.malformed_frames.load(Ordering::Relaxed);
    let pushes = m.push_notifications.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);
    let dropped = relay.router().dropped_frames();
    let failed_broadcasts = relay.router().failed_broadcasts();

    // Best effort, a storage failure only blanks this gauge.
    let total_messages = relay.store().total_messages().await.unwrap_or(0);

    let body = format!(
        r#"# HELP parley_relay_connections_active Number of attached connections
# TYPE parley_relay_connections_active gauge
parley_relay_connections_active {connections}

# HELP parley_relay_rate_limiter_keys Connections tracked by the event limiter
# TYPE parley_relay_rate_limiter_keys gauge
parley_relay_rate_limiter_keys {limiter_keys}

# HELP parley_relay_info Server information
# TYPE parley_relay_info gauge
parley_relay_info{{version="{version}"}} 1

# HELP parley_relay_connections_total Total connections accepted
# TYPE parley_relay_connections_total counter
parley_relay_connections_total {conns_total}

# HELP parley_relay_connections_rejected_total Connections refused before the handshake
# TYPE parley_relay_connections_rejected_total counter
parley_relay_connections_rejected_total {conns_rejected}

# HELP parley_relay_auth_failures_total CONNECT attempts refused
# TYPE parley_relay_auth_failures_total counter
parley_relay_auth_failures_total {auth_failures}

# HELP parley_relay_events_total Typed events handled
# TYPE parley_relay_events_total counter
parley_relay_events_total {events}

# HELP parley_relay_messages_stored_total Messages stored since startup
# TYPE parley_relay_messages_stored_total counter
parley_relay_messages_stored_total {stored}

# HELP parley_relay_duplicate_messages_total Sends resolved to an existing message
# TYPE parley_relay_duplicate_messages_total counter
parley_relay_duplicate_messages_total {duplicates}

# HELP parley_relay_rate_limit_hits_total Total rate limit rejections
# TYPE parley_relay_rate_limit_hits_total counter
parley_relay_rate_limit_hits_total {rate_limits}

# HELP parley_relay_malformed_frames_total Frames dropped as undecodable
# TYPE parley_relay_malformed_frames_total counter
parley_relay_malformed_frames_total {malformed}

# HELP parley_relay_dropped_frames_total Frames dropped on full outbound queues
# TYPE parley_relay_dropped_frames_total counter
parley_relay_dropped_frames_total {dropped}

# HELP parley_relay_failed_broadcasts_total Broadcasts abandoned on room lookup failure
# TYPE parley_relay_failed_broadcasts_total counter
parley_relay_failed_broadcasts_total {failed_broadcasts}

# HELP parley_relay_push_notifications_total Offline push notifications requested
# TYPE parley_relay_push_notifications_total counter
parley_relay_push_notifications_total {pushes}

# HELP parley_relay_errors_total Events answered with an error
# TYPE parley_relay_errors_total counter
parley_relay_errors_total {errors}

# HELP parley_relay_storage_messages Number of messages in the database
# TYPE parley_relay_storage_messages gauge
parley_relay_storage_messages {total_messages}
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kv::MemoryStore;
    use crate::storage::SqliteStorage;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn counters_appear_in_output() {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let relay = Arc::new(ChatRelay::new(
            Config::default(),
            storage,
            Arc::new(MemoryStore::new()),
        ));
        relay.metrics().malformed_frames.fetch_add(3, Ordering::Relaxed);

        let response = metrics_handler(Extension(relay)).await.into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(body.contains("# TYPE parley_relay_connections_active gauge"));
        assert!(body.contains("parley_relay_malformed_frames_total 3"));
        assert!(body.contains("parley_relay_storage_messages 0"));
    }
}
