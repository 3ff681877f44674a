//! HTTP endpoints for parley-relay.
//!
//! Provides health checks, metrics, and the admin session listing.

pub mod health;
mod metrics;
mod sessions;

use crate::server::ChatRelay;
use axum::{routing::get, Extension, Router};
use std::sync::Arc;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: Arc<ChatRelay>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health::health_handler))
        .route("/apps/:app_id/sessions", get(sessions::sessions_handler));
    if relay.config().http.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }
    router.layer(Extension(relay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppCredentials, Config};
    use crate::kv::MemoryStore;
    use crate::server::Peer;
    use crate::storage::SqliteStorage;
    use axum::body::Body;
    use axum::http::{header::AUTHORIZATION, Request, StatusCode};
    use parley_types::{ConnectionId, SessionsReply};
    use std::collections::HashMap;
    use tokio::sync::mpsc;
    use tower::util::ServiceExt;

    async fn test_relay(config: Config) -> Arc<ChatRelay> {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        Arc::new(ChatRelay::new(config, storage, Arc::new(MemoryStore::new())))
    }

    fn config_with_app() -> Config {
        let mut config = Config::default();
        config.auth.apps.insert(
            "acme".to_string(),
            AppCredentials {
                client_secret: "s3cret".to_string(),
                admin_token: "adm1n".to_string(),
                agents: HashMap::new(),
            },
        );
        config
    }

    fn sessions_request(token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/apps/acme/sessions");
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let relay = test_relay(Config::default()).await;
        let app = build_router(relay);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_ok() {
        let relay = test_relay(Config::default()).await;
        let app = build_router(relay);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_can_be_disabled() {
        let mut config = Config::default();
        config.http.metrics_enabled = false;
        let app = build_router(test_relay(config).await);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sessions_require_admin_token() {
        let relay = test_relay(config_with_app()).await;

        let missing = build_router(relay.clone())
            .oneshot(sessions_request(None))
            .await
            .unwrap();
        let wrong = build_router(relay)
            .oneshot(sessions_request(Some("s3cret")))
            .await
            .unwrap();

        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn sessions_lists_live_devices() {
        let relay = test_relay(config_with_app()).await;
        let peer = Peer {
            connection_id: ConnectionId::new(),
            identity: crate::auth::Identity::User {
                app_id: "acme".into(),
                device_id: "d1".into(),
            },
            connected_at: 0,
        };
        let (tx, _rx) = mpsc::channel(8);
        relay.attach(&peer, tx).await.unwrap();

        let response = build_router(relay)
            .oneshot(sessions_request(Some("adm1n")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let reply: SessionsReply = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply.sessions.len(), 1);
        assert_eq!(reply.sessions[0].connection_id, peer.connection_id);
    }
}
