//! Administration handlers, gated by the `X-Admin-Key` header.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
};
use tracing::info;

use super::super::types::{
    CleanupResponse, LockListResponse, ProvisionUserRequest, SessionListResponse, UserDetailResponse,
    UserResponse, UsersQuery,
};
use super::super::{AppError, SharedState, require_admin};
use crate::daemon::engine::SystemStats;
use crate::daemon::services::quota::{QuotaPage, QuotaUpdate};
use crate::daemon::services::sessions::Session;

const DEFAULT_USER_PAGE: usize = 50;
const MAX_USER_PAGE: usize = 200;

/// GET /admin/users - Page through identity records.
pub(crate) async fn admin_users_list(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<UsersQuery>,
) -> Result<Json<QuotaPage>, AppError> {
    require_admin(&state, &headers)?;
    let limit = query.limit.unwrap_or(DEFAULT_USER_PAGE).clamp(1, MAX_USER_PAGE);
    let page = state
        .engine
        .list_users(limit, query.cursor, query.enabled.unwrap_or(false))
        .await?;
    Ok(Json(page))
}

/// POST /admin/users - Add an identity to the allow-list.
pub(crate) async fn admin_users_create(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<ProvisionUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), AppError> {
    require_admin(&state, &headers)?;
    let user = state.engine.provision_user(&req.pubkey, req.update).await?;
    info!(owner = %user.owner, "Identity provisioned");
    Ok((StatusCode::CREATED, Json(UserResponse { user })))
}

/// GET /admin/users/{owner} - One identity with usage statistics.
pub(crate) async fn admin_user_get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(owner): Path<String>,
) -> Result<Json<UserDetailResponse>, AppError> {
    require_admin(&state, &headers)?;
    let (user, stats) = state.engine.user(&owner).await?;
    Ok(Json(UserDetailResponse { user, stats }))
}

/// PUT /admin/users/{owner} - Enable, disable, or change limits.
pub(crate) async fn admin_user_update(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(owner): Path<String>,
    Json(update): Json<QuotaUpdate>,
) -> Result<Json<UserResponse>, AppError> {
    require_admin(&state, &headers)?;
    let user = state.engine.update_user(&owner, update).await?;
    Ok(Json(UserResponse { user }))
}

/// GET /admin/stats - Server-wide statistics.
pub(crate) async fn admin_stats(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<SystemStats>, AppError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.engine.system_stats().await?))
}

/// GET /admin/sessions - Every live session.
pub(crate) async fn admin_sessions_list(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<SessionListResponse<Session>>, AppError> {
    require_admin(&state, &headers)?;
    let sessions = state.engine.all_sessions().await?;
    Ok(Json(SessionListResponse { sessions }))
}

/// DELETE /admin/sessions/{id} - Revoke a session and release its locks.
pub(crate) async fn admin_session_revoke(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    require_admin(&state, &headers)?;
    if state.engine.admin_revoke_session(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

/// GET /admin/locks - Every live lock.
pub(crate) async fn admin_locks_list(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<LockListResponse>, AppError> {
    require_admin(&state, &headers)?;
    let locks = state.engine.all_locks().await?;
    Ok(Json(LockListResponse { locks }))
}

/// DELETE /admin/locks/{*path} - Force-release a lock.
pub(crate) async fn admin_lock_release(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Result<StatusCode, AppError> {
    require_admin(&state, &headers)?;
    let path = format!("/{}", path.trim_start_matches('/'));
    if state.engine.force_release_lock(&path).await? {
        info!(path = %path, "Lock force-released");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

/// POST /admin/cleanup - Sweep expired sessions and locks.
pub(crate) async fn admin_cleanup(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<CleanupResponse>, AppError> {
    require_admin(&state, &headers)?;
    let report = state.engine.cleanup().await?;
    Ok(Json(CleanupResponse {
        message: "Cleanup completed",
        expired_sessions: report.expired_sessions,
        expired_locks: report.expired_locks,
    }))
}
