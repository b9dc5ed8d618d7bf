//! HTTP API for the storage engine.
//!
//! Named routes cover health, auth, events and admin; every other path is
//! a file or directory and goes through a single method-dispatching
//! fallback handler. Handlers are thin: they extract credentials and
//! headers, call the [`Engine`], and translate results into responses.

pub mod audit;
mod handlers;
mod types;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use subtle::ConstantTimeEq;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use crate::config::{Config, ListingConfig};
use crate::constants::{ADMIN_KEY_HEADER, SESSION_COOKIE};
use crate::daemon::engine::Engine;
use crate::daemon::services::sessions::Session;
use crate::error::Error;
use audit::{AuditEvent, audit_auth_error, log_audit_event};
use types::ErrorResponse;

/// State shared by every handler.
pub struct AppState {
    pub engine: Engine,
    pub listing: ListingConfig,
    pub admin_key: Option<String>,
    pub max_file_size: usize,
    pub session_ttl_secs: u64,
}

impl AppState {
    pub fn new(engine: Engine, config: &Config) -> Self {
        Self {
            engine,
            listing: config.listing.clone(),
            admin_key: config.admin.key.clone().filter(|k| !k.is_empty()),
            max_file_size: config.storage.max_file_size,
            session_ttl_secs: config.sessions.ttl_secs,
        }
    }
}

pub type SharedState = Arc<AppState>;

/// Build the application router.
pub fn router(state: SharedState) -> Router {
    let body_limit = state.max_file_size;
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/auth/session",
            post(handlers::session_create)
                .get(handlers::session_get)
                .delete(handlers::session_delete),
        )
        .route("/auth/sessions", get(handlers::sessions_list))
        .route("/auth/sessions/{id}", delete(handlers::sessions_revoke))
        .route("/events", get(handlers::events_list))
        .route("/events/stream", get(handlers::events_stream))
        .route(
            "/admin/users",
            get(handlers::admin_users_list).post(handlers::admin_users_create),
        )
        .route(
            "/admin/users/{owner}",
            get(handlers::admin_user_get).put(handlers::admin_user_update),
        )
        .route("/admin/stats", get(handlers::admin_stats))
        .route("/admin/sessions", get(handlers::admin_sessions_list))
        .route("/admin/sessions/{id}", delete(handlers::admin_session_revoke))
        .route("/admin/locks", get(handlers::admin_locks_list))
        .route("/admin/locks/{*path}", delete(handlers::admin_lock_release))
        .route("/admin/cleanup", post(handlers::admin_cleanup))
        .fallback(handlers::path_request)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

/// Error type for HTTP handlers.
#[derive(Debug)]
pub(crate) struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self(Error::Internal(err))
    }
}

impl AppError {
    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self(Error::validation(message))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = ErrorResponse {
            error: err.label(),
            message: String::new(),
            current_etag: None,
            locked_by: None,
            expires_at: None,
        };
        match err {
            Error::Internal(e) => {
                error!(error = ?e, "Internal error");
                body.message = "An unexpected error occurred".to_string();
            },
            Error::PreconditionFailed {
                message,
                current_etag,
            } => {
                body.message = message;
                body.current_etag = current_etag;
            },
            Error::Locked { lock } => {
                body.message = format!("{} is locked by another session", lock.path);
                body.locked_by = Some(lock.locked_by);
                body.expires_at = Some(lock.expires_at);
            },
            Error::Validation(message)
            | Error::Unauthenticated(message)
            | Error::Forbidden(message)
            | Error::NotFound(message)
            | Error::Conflict(message)
            | Error::StorageLimitExceeded(message)
            | Error::Unavailable(message) => body.message = message,
        }
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Session id from `Authorization: Bearer`, else the session cookie.
pub(crate) fn session_id(headers: &HeaderMap) -> Option<&str> {
    if let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok())
        && let Some(token) = auth.strip_prefix("Bearer ")
    {
        return Some(token.trim());
    }
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE).then_some(value)
        })
}

/// Resolve the caller's session, auditing failures.
pub(crate) async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Session, AppError> {
    state
        .engine
        .authenticate(session_id(headers))
        .await
        .inspect_err(audit_auth_error)
        .map_err(AppError::from)
}

/// Check the admin key header in constant time.
pub(crate) fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.admin_key.as_deref() else {
        log_audit_event(AuditEvent::AdminKeyRejected {
            reason: "no admin key configured",
        });
        return Err(Error::Unavailable("Admin interface is not configured".into()).into());
    };
    let provided = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
        Ok(())
    } else {
        log_audit_event(AuditEvent::AdminKeyRejected {
            reason: "invalid admin key",
        });
        Err(Error::Unauthenticated("Invalid admin key".into()).into())
    }
}

pub(crate) fn session_cookie(session_id: &str, max_age_secs: u64) -> HeaderValue {
    let cookie = format!(
        "{SESSION_COOKIE}={session_id}; HttpOnly; SameSite=Strict; Path=/; Max-Age={max_age_secs}"
    );
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static(""))
}

pub(crate) fn cleared_session_cookie() -> HeaderValue {
    HeaderValue::from_static("hengdang_session=; HttpOnly; SameSite=Strict; Path=/; Max-Age=0")
}
