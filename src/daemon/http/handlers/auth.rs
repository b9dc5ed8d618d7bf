//! Session handlers.
//!
//! Sessions are minted from a signed identity assertion and carried either
//! in the `hengdang_session` cookie or as a bearer token.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};

use super::super::audit::{AuditEvent, audit_auth_error, log_audit_event};
use super::super::types::{SessionCreatedResponse, SessionListResponse, SessionView};
use super::super::{
    AppError, SharedState, authenticate, cleared_session_cookie, session_cookie,
};
use crate::daemon::auth::IdentityAssertion;

/// POST /auth/session - Exchange a signed identity assertion for a session.
pub(crate) async fn session_create(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let assertion: IdentityAssertion = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("Invalid identity assertion: {e}")))?;
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());

    let session = state
        .engine
        .create_session(&assertion, host)
        .await
        .inspect_err(audit_auth_error)?;
    log_audit_event(AuditEvent::SessionCreated {
        owner: session.owner.clone(),
    });

    Ok((
        StatusCode::CREATED,
        [(
            header::SET_COOKIE,
            session_cookie(&session.session_id, state.session_ttl_secs),
        )],
        Json(SessionCreatedResponse {
            session_id: session.session_id,
            permissions: session.permissions,
            expires_at: session.expires_at,
        }),
    )
        .into_response())
}

/// GET /auth/session - Describe the current session.
pub(crate) async fn session_get(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<SessionView>, AppError> {
    let session = authenticate(&state, &headers).await?;
    Ok(Json(SessionView::new(session, None)))
}

/// DELETE /auth/session - Log out and release every lock the session holds.
pub(crate) async fn session_delete(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let session = authenticate(&state, &headers).await?;
    let status = if state.engine.logout(&session).await? {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    };
    Ok((status, [(header::SET_COOKIE, cleared_session_cookie())]).into_response())
}

/// GET /auth/sessions - All live sessions of the caller's identity.
pub(crate) async fn sessions_list(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<SessionListResponse<SessionView>>, AppError> {
    let session = authenticate(&state, &headers).await?;
    let current = session.session_id.clone();
    let sessions = state
        .engine
        .own_sessions(&session)
        .await?
        .into_iter()
        .map(|s| SessionView::new(s, Some(&current)))
        .collect();
    Ok(Json(SessionListResponse { sessions }))
}

/// DELETE /auth/sessions/{id} - Revoke one of the caller's own sessions.
pub(crate) async fn sessions_revoke(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let session = authenticate(&state, &headers).await?;
    state.engine.revoke_own_session(&session, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
