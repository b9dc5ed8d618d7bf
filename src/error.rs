//! Engine error types for typed error handling.
//!
//! Every storage-engine operation returns [`Result`], whose error variants
//! map one-to-one onto the HTTP status codes the server answers with.
//! Storage failures travel as [`Error::Internal`] and are never shown to
//! clients verbatim.

use crate::daemon::services::locks::FileLock;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors with structured context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed path, header, or request body.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Missing, unknown, or expired session.
    #[error("authentication required: {0}")]
    Unauthenticated(String),

    /// Caller does not own the resource.
    #[error("access denied: {0}")]
    Forbidden(String),

    /// Resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource already exists, or a directory is not empty.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An `If-*` precondition did not hold.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        message: String,
        current_etag: Option<String>,
    },

    /// Path is leased by another session.
    #[error("path is locked: {}", lock.path)]
    Locked { lock: FileLock },

    /// Write would exceed the owner's storage limit.
    #[error("storage limit exceeded: {0}")]
    StorageLimitExceeded(String),

    /// A feature is not configured on this server.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Storage or runtime failure.
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a forbidden error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    /// Create a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create a precondition failure carrying the resource's current ETag.
    pub fn precondition_failed(message: impl Into<String>, current_etag: Option<String>) -> Self {
        Self::PreconditionFailed {
            message: message.into(),
            current_etag,
        }
    }

    /// Get the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Unauthenticated(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::StorageLimitExceeded(_) => 413,
            Self::PreconditionFailed { .. } => 412,
            Self::Locked { .. } => 423,
            Self::Unavailable(_) => 503,
            Self::Internal(_) => 500,
        }
    }

    /// Short machine-readable label used in JSON error bodies.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Validation(_) => "Bad Request",
            Self::Unauthenticated(_) => "Authentication required",
            Self::Forbidden(_) => "Access denied",
            Self::NotFound(_) => "Not found",
            Self::Conflict(_) => "Conflict",
            Self::PreconditionFailed { .. } => "Precondition Failed",
            Self::Locked { .. } => "File is locked",
            Self::StorageLimitExceeded(_) => "Storage limit exceeded",
            Self::Unavailable(_) => "Service unavailable",
            Self::Internal(_) => "Internal server error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(Error::validation("bad path").status_code(), 400);
        assert_eq!(Error::Unauthenticated("no session".into()).status_code(), 401);
        assert_eq!(Error::forbidden("not yours").status_code(), 403);
        assert_eq!(Error::not_found("/a").status_code(), 404);
        assert_eq!(Error::conflict("exists").status_code(), 409);
        assert_eq!(Error::precondition_failed("etag", None).status_code(), 412);
        assert_eq!(
            Error::StorageLimitExceeded("full".into()).status_code(),
            413
        );
        assert_eq!(
            Error::Internal(anyhow::anyhow!("disk gone")).status_code(),
            500
        );
    }

    #[test]
    fn test_locked_maps_to_423() {
        let err = Error::Locked {
            lock: FileLock {
                path: "/a.txt".into(),
                locked_by: "s1".into(),
                locked_at: 0,
                expires_at: 1,
            },
        };
        assert_eq!(err.status_code(), 423);
        assert!(err.to_string().contains("/a.txt"));
    }
}
