//! Security audit logging for HTTP server events.
//!
//! Security-relevant rejections are logged under the `audit` target with
//! an `event_type` field so they can be filtered and alerted on separately
//! from request logs.

use tracing::{info, warn};

use crate::error::Error;

/// Security audit events that should be logged for monitoring and alerting.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    /// Missing, unknown, expired or unverifiable credentials
    AuthFailure { reason: String },
    /// Identity not on the allow-list, or disabled
    AccessDenied { owner: Option<String>, reason: String },
    /// Admin endpoint called without a valid key
    AdminKeyRejected { reason: &'static str },
    /// Request path failed validation
    PathRejected { path: String, reason: String },
    /// Write refused because another session holds the path
    LockContention { path: String, holder: String },
    /// Write refused by the storage limit
    QuotaRejected { owner: String, path: String },
    /// New session issued (for correlation)
    SessionCreated { owner: String },
}

/// Log a security audit event with structured fields.
pub fn log_audit_event(event: AuditEvent) {
    match event {
        AuditEvent::AuthFailure { reason } => {
            warn!(
                target: "audit",
                event_type = "auth_failure",
                %reason,
                "Authentication failed"
            );
        },
        AuditEvent::AccessDenied { owner, reason } => {
            warn!(
                target: "audit",
                event_type = "access_denied",
                owner = owner.as_deref().unwrap_or("-"),
                %reason,
                "Access denied"
            );
        },
        AuditEvent::AdminKeyRejected { reason } => {
            warn!(
                target: "audit",
                event_type = "admin_key_rejected",
                reason,
                "Admin request rejected"
            );
        },
        AuditEvent::PathRejected { path, reason } => {
            warn!(
                target: "audit",
                event_type = "path_rejected",
                %path,
                %reason,
                "Request path rejected"
            );
        },
        AuditEvent::LockContention { path, holder } => {
            info!(
                target: "audit",
                event_type = "lock_contention",
                %path,
                %holder,
                "Write blocked by lock"
            );
        },
        AuditEvent::QuotaRejected { owner, path } => {
            warn!(
                target: "audit",
                event_type = "quota_rejected",
                %owner,
                %path,
                "Write rejected by storage limit"
            );
        },
        AuditEvent::SessionCreated { owner } => {
            info!(
                target: "audit",
                event_type = "session_created",
                %owner,
                "Session created"
            );
        },
    }
}

/// Log the audit event, if any, that a failed path operation implies.
pub(crate) fn audit_path_error(err: &Error, path: &str, owner: &str) {
    match err {
        Error::Locked { lock } => log_audit_event(AuditEvent::LockContention {
            path: path.to_string(),
            holder: lock.locked_by.clone(),
        }),
        Error::StorageLimitExceeded(_) => log_audit_event(AuditEvent::QuotaRejected {
            owner: owner.to_string(),
            path: path.to_string(),
        }),
        Error::Forbidden(reason) => log_audit_event(AuditEvent::AccessDenied {
            owner: Some(owner.to_string()),
            reason: reason.clone(),
        }),
        _ => {},
    }
}

/// Log a rejected authentication attempt.
pub(crate) fn audit_auth_error(err: &Error) {
    match err {
        Error::Unauthenticated(reason) | Error::Validation(reason) => {
            log_audit_event(AuditEvent::AuthFailure {
                reason: reason.clone(),
            });
        },
        Error::Forbidden(reason) => log_audit_event(AuditEvent::AccessDenied {
            owner: None,
            reason: reason.clone(),
        }),
        _ => {},
    }
}
