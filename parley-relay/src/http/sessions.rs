//! Admin session listing.

use crate::server::ChatRelay;
use axum::extract::Path;
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use parley_types::AppId;
use std::sync::Arc;

/// `GET /apps/{appId}/sessions`, authorized with `Bearer {admin_token}`.
pub async fn sessions_handler(
    Extension(relay): Extension<Arc<ChatRelay>>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let app_id = AppId::from(app_id);
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(token) if relay.authenticator().is_admin_token(&app_id, token) => {}
        _ => return StatusCode::UNAUTHORIZED.into_response(),
    }

    match relay.list_sessions(&app_id).await {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => {
            tracing::error!(app = %app_id, error = %e, "session listing failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
