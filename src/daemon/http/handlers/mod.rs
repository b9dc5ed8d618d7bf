//! HTTP API handlers organized by surface.

pub mod admin;
pub mod auth;
pub mod events;
pub mod files;

use axum::Json;

use super::types::HealthResponse;
use crate::utils::now_ms;

// Re-export all handlers for use in routing
pub(crate) use admin::{
    admin_cleanup, admin_lock_release, admin_locks_list, admin_session_revoke, admin_sessions_list,
    admin_stats, admin_user_get, admin_user_update, admin_users_create, admin_users_list,
};
pub(crate) use auth::{session_create, session_delete, session_get, sessions_list, sessions_revoke};
pub(crate) use events::{events_list, events_stream};
pub(crate) use files::path_request;

/// GET /health - Liveness probe.
pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: now_ms(),
        version: env!("CARGO_PKG_VERSION"),
    })
}
