//! Request and response types for the HTTP API.

use serde::{Deserialize, Serialize};

use crate::daemon::services::events::{EntryKind, Event, Operation};
use crate::daemon::services::files::FileRecord;
use crate::daemon::services::locks::FileLock;
use crate::daemon::services::quota::{QuotaRecord, QuotaUpdate};
use crate::daemon::services::sessions::Session;
use crate::daemon::engine::UserStats;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
    #[serde(rename = "currentETag", skip_serializing_if = "Option::is_none")]
    pub current_etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

// =============================================================================
// Health
// =============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub status: &'static str,
    pub timestamp: i64,
    pub version: &'static str,
}

// =============================================================================
// Files and directories
// =============================================================================

/// Query string accepted on file and directory paths.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct PathQuery {
    pub lock: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub reverse: Option<bool>,
    pub shallow: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WriteResponse {
    pub path: String,
    pub size: u64,
    pub content_type: String,
    pub hash: String,
    pub timestamp: i64,
    pub created: bool,
}

impl WriteResponse {
    pub fn new(record: &FileRecord, created: bool) -> Self {
        Self {
            path: record.path.clone(),
            size: record.content_length,
            content_type: record.content_type.clone(),
            hash: record.content_hash.clone(),
            timestamp: record.timestamp,
            created,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct MkdirResponse {
    pub path: String,
    pub owner: String,
    pub created: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LockAcquiredResponse {
    pub message: &'static str,
    pub path: String,
    pub session_id: String,
    pub expires_at: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct LockMessageResponse {
    pub message: &'static str,
    pub path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LockStatusResponse {
    pub locked: bool,
    pub lock: Option<FileLock>,
    pub owned_by_this_session: bool,
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub(crate) struct EventsQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub reverse: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamQuery {
    pub path: Option<String>,
}

/// An event as clients see it; the owner stays server-side.
#[derive(Debug, Serialize)]
pub(crate) struct EventView {
    pub timestamp: String,
    pub operation: Operation,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

impl From<Event> for EventView {
    fn from(event: Event) -> Self {
        Self {
            timestamp: event.timestamp,
            operation: event.operation,
            path: event.path,
            kind: event.kind,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EventsResponse {
    pub events: Vec<EventView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

// =============================================================================
// Auth
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionCreatedResponse {
    pub session_id: String,
    pub permissions: Vec<String>,
    pub expires_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionView {
    pub session_id: String,
    pub permissions: Vec<String>,
    pub app_name: Option<String>,
    pub created_at: i64,
    pub last_used: i64,
    pub expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_current: Option<bool>,
}

impl SessionView {
    pub fn new(session: Session, current: Option<&str>) -> Self {
        let is_current = current.map(|id| id == session.session_id);
        Self {
            session_id: session.session_id,
            permissions: session.permissions,
            app_name: session.app_name,
            created_at: session.created_at,
            last_used: session.last_used,
            expires_at: session.expires_at,
            is_current,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct SessionListResponse<T> {
    pub sessions: Vec<T>,
}

// =============================================================================
// Admin
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub(crate) struct UsersQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProvisionUserRequest {
    pub pubkey: String,
    #[serde(flatten)]
    pub update: QuotaUpdate,
}

#[derive(Debug, Serialize)]
pub(crate) struct UserResponse {
    pub user: QuotaRecord,
}

#[derive(Debug, Serialize)]
pub(crate) struct UserDetailResponse {
    pub user: QuotaRecord,
    pub stats: UserStats,
}

#[derive(Debug, Serialize)]
pub(crate) struct LockListResponse {
    pub locks: Vec<FileLock>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CleanupResponse {
    pub message: &'static str,
    pub expired_sessions: usize,
    pub expired_locks: usize,
}
