//! The composed storage engine.
//!
//! [`Engine`] owns one instance of every service and runs the request
//! flows on top of them:
//!
//! ```text
//! write:  authenticate → validate → lease path → preconditions → ensure parents
//!         → chunks + metadata → quota delta → event → notify → release
//! read:   authenticate → validate → metadata → preconditions → chunks
//! list:   authenticate → validate → directory ownership → range scans
//! ```
//!
//! The HTTP layer is a thin translation of these methods.

use anyhow::Context;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{Config, StoreKind};
use crate::constants::{ACTIVE_USER_WINDOW_MS, RECENT_EVENT_WINDOW_MS};
use crate::daemon::auth::{AcceptUnsigned, IdentityAssertion, IdentityVerifier, RejectAll};
use crate::daemon::paths::get_database_path;
use crate::daemon::services::clock::MonotonicClock;
use crate::daemon::services::conditional::{Preconditions, ReadDecision};
use crate::daemon::services::directories::{
    DirectoryAttributes, DirectoryRecord, DirectoryStore, ListOptions, Listing,
};
use crate::daemon::services::events::{
    ChangeNotifier, EventLog, EventPage, EventQuery, PathFilter, Subscription,
};
use crate::daemon::services::files::{FileRecord, FileStore, WriteOutcome};
use crate::daemon::services::locks::{FileLock, LockManager, LockState};
use crate::daemon::services::path::{directory_key, validate_path};
use crate::daemon::services::quota::{QuotaPage, QuotaRecord, QuotaTracker, QuotaUpdate};
use crate::daemon::services::sessions::{Session, SessionStore};
use crate::daemon::store::Store;
use crate::error::{Error, Result};
use crate::utils::now_ms;

/// Result of a `GET` on a path.
#[derive(Debug)]
pub enum ReadOutcome {
    Listing(Listing),
    File { content: Bytes, record: FileRecord },
    NotModified(FileRecord),
}

/// Explicit lock operations (`?lock=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAction {
    Acquire,
    Release,
    Refresh,
    Status,
}

impl LockAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "acquire" => Some(Self::Acquire),
            "release" => Some(Self::Release),
            "refresh" => Some(Self::Refresh),
            "status" => Some(Self::Status),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum LockOutcome {
    Acquired(FileLock),
    Released,
    Refreshed,
    Status { state: LockState, owned_by_caller: bool },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub owner: String,
    pub file_count: usize,
    pub storage_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_file_modified: Option<i64>,
    pub session_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    pub total_users: usize,
    pub active_users: usize,
    pub total_storage: u64,
    pub total_files: usize,
    pub total_directories: usize,
    pub recent_events: usize,
    pub active_sessions: usize,
    pub live_streams: usize,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub expired_sessions: usize,
    pub expired_locks: usize,
}

pub struct Engine {
    files: FileStore,
    directories: DirectoryStore,
    locks: LockManager,
    events: EventLog,
    sessions: SessionStore,
    quota: QuotaTracker,
    verifier: Arc<dyn IdentityVerifier>,
    owner: Option<String>,
    public_url: Option<String>,
    max_assertion_age_secs: u64,
    max_file_size: usize,
}

impl Engine {
    /// Open the configured store and build the engine over it.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory or database cannot be opened.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let store = match config.storage.backend {
            StoreKind::Redb => {
                let path = get_database_path(&config.data_dir()?);
                info!(path = %path.display(), "Opening store");
                Store::file(&path)?
            },
            StoreKind::Memory => {
                warn!("Using in-memory store; data is lost on shutdown");
                Store::memory()
            },
        };
        Self::with_store(config, store)
            .await
            .context("Failed to initialize engine")
    }

    /// Build the engine over an existing store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the root directory
    /// cannot be created.
    pub async fn with_store(config: &Config, store: Store) -> Result<Self> {
        let last_event = EventLog::last_timestamp(&store).await?;
        let clock = Arc::new(MonotonicClock::new(last_event));

        let quota = QuotaTracker::new(store.clone(), config.quota.default_storage_limit);
        let events = EventLog::new(store.clone(), clock.clone(), ChangeNotifier::new());
        let files = FileStore::new(
            store.clone(),
            quota.clone(),
            events.clone(),
            clock,
            config.storage.chunk_size,
        );
        let directories = DirectoryStore::new(store.clone(), events.clone());
        let locks = LockManager::new(store.clone(), config.locks.ttl_secs);
        let sessions = SessionStore::new(store, config.sessions.ttl_secs);

        let verifier: Arc<dyn IdentityVerifier> = if config.auth.allow_unsigned {
            Arc::new(AcceptUnsigned)
        } else {
            Arc::new(RejectAll)
        };

        if let Some(owner) = &config.auth.owner {
            quota.ensure(owner).await?;
            directories.ensure_root(owner).await?;
        }

        Ok(Self {
            files,
            directories,
            locks,
            events,
            sessions,
            quota,
            verifier,
            owner: config.auth.owner.clone(),
            public_url: config.server.public_url.clone(),
            max_assertion_age_secs: config.auth.max_assertion_age_secs,
            max_file_size: config.storage.max_file_size,
        })
    }

    /// Replace the signature verifier.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    pub fn directories(&self) -> &DirectoryStore {
        &self.directories
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    // ---------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------

    /// Exchange a signed identity assertion for a session.
    ///
    /// `host` is the request's `Host` header, used to build the expected
    /// session URL when no public URL is configured.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for malformed or unbound assertions
    /// - [`Error::Forbidden`] for identities not on the allow-list
    /// - [`Error::Unauthenticated`] when the id or signature does not verify
    pub async fn create_session(&self, assertion: &IdentityAssertion, host: Option<&str>) -> Result<Session> {
        assertion.check_shape()?;

        if self.owner.as_deref() == Some(assertion.pubkey.as_str()) {
            self.quota.ensure(&assertion.pubkey).await?;
        } else if !self.quota.is_allowed(&assertion.pubkey).await? {
            return Err(Error::forbidden("Identity is not allowed on this server"));
        }

        if !assertion.id_matches() || !self.verifier.verify(assertion) {
            return Err(Error::Unauthenticated(
                "Assertion signature verification failed".into(),
            ));
        }

        let expected_url = self.session_url(host)?;
        assertion.check_binding(&expected_url, self.max_assertion_age_secs, now_ms() / 1000)?;

        let session = self
            .sessions
            .create(&assertion.pubkey, assertion.permissions(), Some(assertion.app_name()))
            .await?;
        if self.owner.is_none() {
            self.directories.ensure_root(&assertion.pubkey).await?;
        }
        info!(owner = %session.owner, app = ?session.app_name, "Session created");
        Ok(session)
    }

    fn session_url(&self, host: Option<&str>) -> Result<String> {
        match (&self.public_url, host) {
            (Some(base), _) => Ok(format!("{}/auth/session", base.trim_end_matches('/'))),
            (None, Some(host)) => Ok(format!("http://{host}/auth/session")),
            (None, None) => Err(Error::validation("Missing Host header")),
        }
    }

    /// Resolve a session id to a live session of an allowed identity.
    ///
    /// # Errors
    ///
    /// - [`Error::Unauthenticated`] when the id is missing, unknown or expired
    /// - [`Error::Forbidden`] when the identity has been disabled
    pub async fn authenticate(&self, session_id: Option<&str>) -> Result<Session> {
        let Some(session_id) = session_id.filter(|id| !id.is_empty()) else {
            return Err(Error::Unauthenticated(
                "No session cookie or authorization header found".into(),
            ));
        };
        let Some(session) = self.sessions.get(session_id).await? else {
            return Err(Error::Unauthenticated("Session not found or expired".into()));
        };
        if !self.quota.is_allowed(&session.owner).await? {
            return Err(Error::forbidden(
                "Identity has been disabled by an administrator",
            ));
        }
        let Some(session) = self.sessions.touch(&session).await? else {
            return Err(Error::Unauthenticated("Session not found or expired".into()));
        };
        self.quota.touch(&session.owner).await?;
        Ok(session)
    }

    /// End a session and release every lock it holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn logout(&self, session: &Session) -> Result<bool> {
        let released = self.locks.release_all_for_session(&session.session_id).await?;
        if released > 0 {
            debug!(count = released, "Released locks on logout");
        }
        self.sessions.delete(&session.session_id).await
    }

    /// Live sessions of the caller's identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn own_sessions(&self, session: &Session) -> Result<Vec<Session>> {
        self.sessions.list_for_owner(&session.owner).await
    }

    /// Revoke one of the caller's own sessions.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the session does not exist, [`Error::Forbidden`]
    /// if it belongs to another identity.
    pub async fn revoke_own_session(&self, session: &Session, target_id: &str) -> Result<()> {
        let Some(target) = self.sessions.get(target_id).await? else {
            return Err(Error::not_found("Target session does not exist"));
        };
        if target.owner != session.owner {
            return Err(Error::forbidden("Can only revoke your own sessions"));
        }
        self.revoke_session(target_id).await?;
        Ok(())
    }

    async fn revoke_session(&self, session_id: &str) -> Result<bool> {
        let deleted = self.sessions.delete(session_id).await?;
        if deleted {
            self.locks.release_all_for_session(session_id).await?;
        }
        Ok(deleted)
    }

    // ---------------------------------------------------------------------
    // Files and directories
    // ---------------------------------------------------------------------

    /// Metadata of a file owned by the caller.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] or [`Error::Forbidden`].
    pub async fn head(&self, session: &Session, path: &str) -> Result<FileRecord> {
        validate_path(path)?;
        let Some(record) = self.files.metadata(path).await? else {
            return Err(Error::not_found(format!("File not found: {path}")));
        };
        check_owner(&record.owner, session)?;
        Ok(record)
    }

    /// Read a file or list a directory. A directory at `path/` wins over a
    /// file at `path`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`], [`Error::Forbidden`], or a store failure.
    pub async fn read(
        &self,
        session: &Session,
        path: &str,
        preconditions: &Preconditions,
        options: &ListOptions,
    ) -> Result<ReadOutcome> {
        validate_path(path)?;

        if self.directories.exists(&directory_key(path)).await? {
            let listing = self.directories.list(path, options, &session.owner).await?;
            return Ok(ReadOutcome::Listing(listing));
        }

        let Some(record) = self.files.metadata(path).await? else {
            return Err(Error::not_found(format!("File or directory not found: {path}")));
        };
        check_owner(&record.owner, session)?;
        if preconditions.check_read(&record) == ReadDecision::NotModified {
            return Ok(ReadOutcome::NotModified(record));
        }

        match self.files.read_file(path).await? {
            Some((content, record)) => Ok(ReadOutcome::File { content, record }),
            None => Err(Error::not_found(format!("File not found: {path}"))),
        }
    }

    /// Create a directory.
    ///
    /// # Errors
    ///
    /// See [`DirectoryStore::create`].
    pub async fn mkdir(&self, session: &Session, path: &str, attrs: DirectoryAttributes) -> Result<DirectoryRecord> {
        validate_path(path)?;
        self.directories.create(path, &session.owner, attrs).await
    }

    /// Create or overwrite a file under the path lock.
    ///
    /// # Errors
    ///
    /// - [`Error::Locked`] if another session holds the path
    /// - [`Error::PreconditionFailed`] if a precondition does not hold
    /// - [`Error::Forbidden`] if the file or its parent belongs to someone else
    /// - [`Error::StorageLimitExceeded`] if the quota or size limit is hit
    pub async fn write(
        &self,
        session: &Session,
        path: &str,
        content: Bytes,
        preconditions: &Preconditions,
    ) -> Result<WriteOutcome> {
        validate_path(path)?;
        if path.ends_with('/') {
            return Err(Error::validation("Cannot write file content to a directory path"));
        }
        if content.len() > self.max_file_size {
            return Err(Error::StorageLimitExceeded(format!(
                "File exceeds the maximum size of {} bytes",
                self.max_file_size
            )));
        }

        let lease = self.locks.lease(path, &session.session_id).await?;
        let result = self.write_leased(session, path, content, preconditions).await;
        if let Err(e) = lease.finish().await {
            warn!(path = %path, error = %e, "Failed to end write lease");
        }
        result
    }

    async fn write_leased(
        &self,
        session: &Session,
        path: &str,
        content: Bytes,
        preconditions: &Preconditions,
    ) -> Result<WriteOutcome> {
        let existing = self.files.metadata(path).await?;
        if let Some(record) = &existing {
            check_owner(&record.owner, session)?;
        }
        preconditions.check_write(existing.as_ref())?;
        self.directories
            .ensure_parent_directories(path, &session.owner)
            .await?;
        self.files.write_file(path, content, &session.owner).await
    }

    /// Delete a file (under the path lock) or an empty directory.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`], [`Error::Forbidden`], [`Error::Conflict`] for a
    /// non-empty directory, [`Error::Locked`], [`Error::PreconditionFailed`].
    pub async fn delete(&self, session: &Session, path: &str, preconditions: &Preconditions) -> Result<()> {
        validate_path(path)?;

        let dir_key = directory_key(path);
        if self.directories.exists(&dir_key).await? {
            if !self.directories.delete(&dir_key, &session.owner).await? {
                return Err(Error::not_found(format!("Directory not found: {dir_key}")));
            }
            return Ok(());
        }

        let lease = self.locks.lease(path, &session.session_id).await?;
        let result = self.delete_leased(session, path, preconditions).await;
        if let Err(e) = lease.finish().await {
            warn!(path = %path, error = %e, "Failed to end write lease");
        }
        result
    }

    async fn delete_leased(&self, session: &Session, path: &str, preconditions: &Preconditions) -> Result<()> {
        let Some(record) = self.files.metadata(path).await? else {
            return Err(Error::not_found(format!("File not found: {path}")));
        };
        check_owner(&record.owner, session)?;
        preconditions.check_write(Some(&record))?;
        if !self.files.delete_file(path).await? {
            return Err(Error::not_found(format!("File not found: {path}")));
        }
        Ok(())
    }

    /// Run an explicit lock operation for the caller's session.
    ///
    /// # Errors
    ///
    /// [`Error::Locked`] when acquiring a path held by another session,
    /// [`Error::NotFound`] when releasing or refreshing a lock the session
    /// does not hold.
    pub async fn lock(&self, session: &Session, path: &str, action: LockAction) -> Result<LockOutcome> {
        validate_path(path)?;
        let id = session.session_id.as_str();
        match action {
            LockAction::Acquire => Ok(LockOutcome::Acquired(self.locks.acquire(path, id).await?.lock)),
            LockAction::Release => {
                if self.locks.release(path, Some(id)).await? {
                    Ok(LockOutcome::Released)
                } else {
                    Err(Error::not_found("No lock found or not owned by this session"))
                }
            },
            LockAction::Refresh => {
                if self.locks.refresh(path, id).await? {
                    Ok(LockOutcome::Refreshed)
                } else {
                    Err(Error::not_found("No lock found or not owned by this session"))
                }
            },
            LockAction::Status => {
                let state = self.locks.status(path, Some(id)).await?;
                let owned_by_caller = state.lock.as_ref().is_some_and(|l| l.locked_by == id);
                Ok(LockOutcome::Status {
                    state,
                    owned_by_caller,
                })
            },
        }
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    /// Page through the caller's events.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn events(&self, session: &Session, mut query: EventQuery) -> Result<EventPage> {
        query.owner = Some(session.owner.clone());
        self.events.list(&query).await
    }

    /// Open a live change stream for the caller's session.
    pub fn subscribe(&self, session: &Session, filter: Option<&str>) -> Subscription {
        self.events
            .notifier()
            .subscribe(&session.session_id, &session.owner, PathFilter::parse(filter))
    }

    // ---------------------------------------------------------------------
    // Administration
    // ---------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn list_users(&self, limit: usize, cursor: Option<String>, enabled_only: bool) -> Result<QuotaPage> {
        self.quota.list(limit, cursor, enabled_only).await
    }

    /// Add an identity to the allow-list, or update its record.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] if `owner` is not 64 hex characters or the
    /// limit is out of range.
    pub async fn provision_user(&self, owner: &str, update: QuotaUpdate) -> Result<QuotaRecord> {
        if owner.len() != 64 || !owner.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::validation("pubkey must be a 64-character hex string"));
        }
        self.quota.provision(owner, update).await
    }

    /// Update an existing record.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the identity has no record.
    pub async fn update_user(&self, owner: &str, update: QuotaUpdate) -> Result<QuotaRecord> {
        if self.quota.get(owner).await?.is_none() {
            return Err(Error::not_found(format!("User not found: {owner}")));
        }
        self.quota.provision(owner, update).await
    }

    /// Record and statistics of one identity.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the identity has no record.
    pub async fn user(&self, owner: &str) -> Result<(QuotaRecord, UserStats)> {
        let Some(record) = self.quota.get(owner).await? else {
            return Err(Error::not_found(format!("User not found: {owner}")));
        };
        let owned: Vec<FileRecord> = self
            .files
            .scan("")
            .await?
            .into_iter()
            .filter(|f| f.owner == owner)
            .collect();
        let stats = UserStats {
            owner: owner.to_string(),
            file_count: owned.len(),
            storage_used: record.storage_used,
            last_file_modified: owned.iter().map(|f| f.timestamp).max(),
            session_count: self.sessions.list_for_owner(owner).await?.len(),
        };
        Ok((record, stats))
    }

    /// Server-wide statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn system_stats(&self) -> Result<SystemStats> {
        let now = now_ms();
        let users = self.quota.all().await?;
        let active_since = now - ACTIVE_USER_WINDOW_MS;
        Ok(SystemStats {
            total_users: users.len(),
            active_users: users
                .iter()
                .filter(|u| u.enabled && u.last_active > active_since)
                .count(),
            total_storage: users.iter().map(|u| u.storage_used).sum(),
            total_files: self.files.scan("").await?.len(),
            total_directories: self.directories.count().await?,
            recent_events: self.events.count_since(now - RECENT_EVENT_WINDOW_MS).await?,
            active_sessions: self.sessions.list_live().await?.len(),
            live_streams: self.events.notifier().connection_count(),
            timestamp: now,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn all_sessions(&self) -> Result<Vec<Session>> {
        self.sessions.list_live().await
    }

    /// Revoke any session and release its locks. Returns false if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn admin_revoke_session(&self, session_id: &str) -> Result<bool> {
        self.revoke_session(session_id).await
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn all_locks(&self) -> Result<Vec<FileLock>> {
        self.locks.list_live().await
    }

    /// Force-release a lock regardless of holder.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn force_release_lock(&self, path: &str) -> Result<bool> {
        self.locks.release(path, None).await
    }

    /// Sweep expired sessions and locks.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let report = CleanupReport {
            expired_sessions: self.sessions.cleanup_expired().await?,
            expired_locks: self.locks.cleanup_expired().await?,
        };
        info!(
            expired_sessions = report.expired_sessions,
            expired_locks = report.expired_locks,
            "Cleanup completed"
        );
        Ok(report)
    }
}

fn check_owner(owner: &str, session: &Session) -> Result<()> {
    if owner != session.owner {
        return Err(Error::forbidden("You can only access your own files"));
    }
    Ok(())
}
