//! Per-path write leases.
//!
//! A lock is a time-bounded claim, not a blocking mutex: a caller that
//! cannot acquire it gets [`Error::Locked`] immediately. Expired locks are
//! treated as absent and removed when read. Mutations go through one async
//! mutex so the read-check-write of an acquire cannot interleave. The same
//! mutex guards the count of in-flight write leases per path and session.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::daemon::store::{Store, Table};
use crate::error::{Error, Result};
use crate::utils::now_ms;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLock {
    pub path: String,
    /// Session id of the holder.
    pub locked_by: String,
    pub locked_at: i64,
    pub expires_at: i64,
}

impl FileLock {
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

/// Lock state of a path as seen by one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockState {
    /// Held by someone else.
    pub locked: bool,
    pub lock: Option<FileLock>,
}

/// Result of a successful acquire.
#[derive(Debug, Clone)]
pub struct LockGrant {
    pub lock: FileLock,
    /// The session already held a live lock on this path.
    pub refreshed: bool,
}

/// In-flight write leases of one session on one path.
#[derive(Debug, Default)]
struct ActiveLeases {
    count: usize,
    /// The lock outlives the leases: it existed before the first one, or
    /// was acquired explicitly while they ran.
    keep: bool,
}

type LeaseKey = (String, String);

#[derive(Clone)]
pub struct LockManager {
    store: Store,
    ttl_ms: i64,
    write_lock: Arc<Mutex<HashMap<LeaseKey, ActiveLeases>>>,
}

impl LockManager {
    pub fn new(store: Store, ttl_secs: u64) -> Self {
        Self {
            store,
            ttl_ms: i64::try_from(ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX),
            write_lock: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn load_live(&self, path: &str, now: i64) -> Result<Option<FileLock>> {
        let Some(lock) = self.store.get_json::<FileLock>(Table::Locks, path).await? else {
            return Ok(None);
        };
        if lock.is_expired_at(now) {
            self.store.remove(Table::Locks, path).await?;
            debug!(path = %path, locked_by = %lock.locked_by, "Expired lock removed on read");
            return Ok(None);
        }
        Ok(Some(lock))
    }

    /// Acquire or refresh the lock on `path` for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Locked`] if another session holds a live lock.
    pub async fn acquire(&self, path: &str, session_id: &str) -> Result<LockGrant> {
        self.acquire_at(path, session_id, now_ms()).await
    }

    pub(crate) async fn acquire_at(&self, path: &str, session_id: &str, now: i64) -> Result<LockGrant> {
        let mut leases = self.write_lock.lock().await;
        let grant = self.store_lock(path, session_id, now).await?;
        if let Some(active) = leases.get_mut(&lease_key(path, session_id)) {
            active.keep = true;
        }
        Ok(grant)
    }

    /// Caller must hold `write_lock`.
    async fn store_lock(&self, path: &str, session_id: &str, now: i64) -> Result<LockGrant> {
        let existing = self.load_live(path, now).await?;
        if let Some(lock) = &existing
            && lock.locked_by != session_id
        {
            return Err(Error::Locked { lock: lock.clone() });
        }

        let lock = FileLock {
            path: path.to_string(),
            locked_by: session_id.to_string(),
            locked_at: now,
            expires_at: now.saturating_add(self.ttl_ms),
        };
        self.store.put_json(Table::Locks, path, &lock).await?;
        Ok(LockGrant {
            lock,
            refreshed: existing.is_some(),
        })
    }

    /// Release the lock on `path`.
    ///
    /// With `session_id`, only that session's lock is released. Returns
    /// false if there was no lock or it belongs to another session.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn release(&self, path: &str, session_id: Option<&str>) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.remove_lock(path, session_id).await
    }

    /// Caller must hold `write_lock`.
    async fn remove_lock(&self, path: &str, session_id: Option<&str>) -> Result<bool> {
        let Some(lock) = self.store.get_json::<FileLock>(Table::Locks, path).await? else {
            return Ok(false);
        };
        if session_id.is_some_and(|id| id != lock.locked_by) {
            return Ok(false);
        }
        Ok(self.store.remove(Table::Locks, path).await?)
    }

    /// Extend the TTL of a live lock held by `session_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn refresh(&self, path: &str, session_id: &str) -> Result<bool> {
        self.refresh_at(path, session_id, now_ms()).await
    }

    pub(crate) async fn refresh_at(&self, path: &str, session_id: &str, now: i64) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.extend_lock(path, session_id, now).await
    }

    /// Caller must hold `write_lock`.
    async fn extend_lock(&self, path: &str, session_id: &str, now: i64) -> Result<bool> {
        let Some(mut lock) = self.load_live(path, now).await? else {
            return Ok(false);
        };
        if lock.locked_by != session_id {
            return Ok(false);
        }
        lock.expires_at = now.saturating_add(self.ttl_ms);
        self.store.put_json(Table::Locks, path, &lock).await?;
        Ok(true)
    }

    /// Lock state of `path`. A lock held by `session_id` itself does not
    /// count as locked.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn status(&self, path: &str, session_id: Option<&str>) -> Result<LockState> {
        self.status_at(path, session_id, now_ms()).await
    }

    pub(crate) async fn status_at(&self, path: &str, session_id: Option<&str>, now: i64) -> Result<LockState> {
        let lock = self.load_live(path, now).await?;
        let locked = match (&lock, session_id) {
            (Some(lock), Some(id)) => lock.locked_by != id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        Ok(LockState { locked, lock })
    }

    /// Release every lock held by a session (logout, revocation).
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn release_all_for_session(&self, session_id: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let held: Vec<String> = self
            .store
            .scan_json::<FileLock>(Table::Locks, "")
            .await?
            .into_iter()
            .filter(|(_, lock)| lock.locked_by == session_id)
            .map(|(path, _)| path)
            .collect();
        Ok(self.store.remove_many(Table::Locks, held).await?)
    }

    /// Remove every expired lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.cleanup_expired_at(now_ms()).await
    }

    pub(crate) async fn cleanup_expired_at(&self, now: i64) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let expired: Vec<String> = self
            .store
            .scan_json::<FileLock>(Table::Locks, "")
            .await?
            .into_iter()
            .filter(|(_, lock)| lock.is_expired_at(now))
            .map(|(path, _)| path)
            .collect();
        Ok(self.store.remove_many(Table::Locks, expired).await?)
    }

    /// Every live lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn list_live(&self) -> Result<Vec<FileLock>> {
        let now = now_ms();
        Ok(self
            .store
            .scan_json::<FileLock>(Table::Locks, "")
            .await?
            .into_iter()
            .map(|(_, lock)| lock)
            .filter(|lock| !lock.is_expired_at(now))
            .collect())
    }

    /// Take a lease on `path` for the duration of one write.
    ///
    /// Leases of one session on one path are counted: the lock is only
    /// released when the last of them ends, and never if the session held
    /// it before the first lease began.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Locked`] if another session holds the path.
    pub async fn lease(&self, path: &str, session_id: &str) -> Result<WriteLease> {
        let mut leases = self.write_lock.lock().await;
        let grant = self.store_lock(path, session_id, now_ms()).await?;
        let active = leases
            .entry(lease_key(path, session_id))
            .or_insert_with(|| ActiveLeases {
                count: 0,
                keep: grant.refreshed,
            });
        active.count += 1;
        Ok(WriteLease {
            manager: self.clone(),
            path: path.to_string(),
            session_id: session_id.to_string(),
            finished: false,
        })
    }

    async fn end_lease(&self, path: &str, session_id: &str) -> Result<()> {
        let mut leases = self.write_lock.lock().await;
        let key = lease_key(path, session_id);
        let Some(active) = leases.get_mut(&key) else {
            return Ok(());
        };
        active.count = active.count.saturating_sub(1);
        let (remaining, keep) = (active.count, active.keep);
        if remaining == 0 {
            leases.remove(&key);
        }
        if remaining > 0 || keep {
            self.extend_lock(path, session_id, now_ms()).await?;
        } else {
            self.remove_lock(path, Some(session_id)).await?;
        }
        Ok(())
    }
}

fn lease_key(path: &str, session_id: &str) -> LeaseKey {
    (path.to_string(), session_id.to_string())
}

/// A lock held for the duration of one write request.
///
/// Call [`WriteLease::finish`] when the write completes. If the lease is
/// dropped unfinished (request cancelled, early return), ending it is
/// spawned onto the runtime.
pub struct WriteLease {
    manager: LockManager,
    path: String,
    session_id: String,
    finished: bool,
}

impl WriteLease {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// End the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.manager.end_lease(&self.path, &self.session_id).await
    }
}

impl Drop for WriteLease {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(path = %self.path, "No runtime to release write lease; lock will expire");
            return;
        };
        let manager = self.manager.clone();
        let path = std::mem::take(&mut self.path);
        let session_id = std::mem::take(&mut self.session_id);
        handle.spawn(async move {
            if let Err(e) = manager.end_lease(&path, &session_id).await {
                warn!(path = %path, error = %e, "Failed to release write lease");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL_MS: i64 = 30 * 60 * 1000;

    fn create_locks() -> LockManager {
        LockManager::new(Store::memory(), 30 * 60)
    }

    #[tokio::test]
    async fn test_second_session_blocked_until_ttl_elapses() {
        let locks = create_locks();
        locks.acquire_at("/a.txt", "s1", 0).await.unwrap();

        let err = locks.acquire_at("/a.txt", "s2", TTL_MS).await.unwrap_err();
        match err {
            Error::Locked { lock } => assert_eq!(lock.locked_by, "s1"),
            other => panic!("expected Locked, got {other:?}"),
        }

        let grant = locks.acquire_at("/a.txt", "s2", TTL_MS + 1).await.unwrap();
        assert_eq!(grant.lock.locked_by, "s2");
        assert!(!grant.refreshed);
    }

    #[tokio::test]
    async fn test_reacquire_refreshes_own_lock() {
        let locks = create_locks();
        locks.acquire_at("/a.txt", "s1", 0).await.unwrap();
        let grant = locks.acquire_at("/a.txt", "s1", 1000).await.unwrap();
        assert!(grant.refreshed);
        assert_eq!(grant.lock.expires_at, 1000 + TTL_MS);
    }

    #[tokio::test]
    async fn test_release_only_by_owner() {
        let locks = create_locks();
        locks.acquire("/a.txt", "s1").await.unwrap();

        assert!(!locks.release("/a.txt", Some("s2")).await.unwrap());
        assert!(locks.release("/a.txt", Some("s1")).await.unwrap());
        assert!(!locks.release("/a.txt", Some("s1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_forced_release_without_session() {
        let locks = create_locks();
        locks.acquire("/a.txt", "s1").await.unwrap();
        assert!(locks.release("/a.txt", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_only_for_live_owned_lock() {
        let locks = create_locks();
        locks.acquire_at("/a.txt", "s1", 0).await.unwrap();

        assert!(!locks.refresh_at("/a.txt", "s2", 10).await.unwrap());
        assert!(locks.refresh_at("/a.txt", "s1", 10).await.unwrap());
        assert!(!locks.refresh_at("/a.txt", "s1", 10 + TTL_MS + 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_ignores_own_lock() {
        let locks = create_locks();
        locks.acquire_at("/a.txt", "s1", 0).await.unwrap();

        let own = locks.status_at("/a.txt", Some("s1"), 1).await.unwrap();
        assert!(!own.locked);
        assert!(own.lock.is_some());

        let other = locks.status_at("/a.txt", Some("s2"), 1).await.unwrap();
        assert!(other.locked);

        let expired = locks.status_at("/a.txt", Some("s2"), TTL_MS + 1).await.unwrap();
        assert_eq!(expired, LockState { locked: false, lock: None });
    }

    #[tokio::test]
    async fn test_release_all_for_session_and_cleanup() {
        let locks = create_locks();
        locks.acquire_at("/a", "s1", 0).await.unwrap();
        locks.acquire_at("/b", "s1", 0).await.unwrap();
        locks.acquire_at("/c", "s2", 0).await.unwrap();

        assert_eq!(locks.release_all_for_session("s1").await.unwrap(), 2);
        assert_eq!(locks.cleanup_expired_at(TTL_MS + 1).await.unwrap(), 1);
        assert!(locks.list_live().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_live_skips_expired() {
        let locks = create_locks();
        locks.acquire_at("/old", "s1", 0).await.unwrap();
        locks.acquire("/new", "s1").await.unwrap();

        let live = locks.list_live().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].path, "/new");
    }

    #[tokio::test]
    async fn test_lease_releases_on_finish() {
        let locks = create_locks();
        let lease = locks.lease("/a.txt", "s1").await.unwrap();
        assert!(locks.status("/a.txt", Some("s2")).await.unwrap().locked);
        lease.finish().await.unwrap();
        assert!(!locks.status("/a.txt", Some("s2")).await.unwrap().locked);
    }

    #[tokio::test]
    async fn test_lease_keeps_long_lived_lock() {
        let locks = create_locks();
        locks.acquire("/a.txt", "s1").await.unwrap();
        let lease = locks.lease("/a.txt", "s1").await.unwrap();
        lease.finish().await.unwrap();
        assert!(locks.status("/a.txt", Some("s2")).await.unwrap().locked);
    }

    #[tokio::test]
    async fn test_overlapping_leases_hold_until_last_finishes() {
        let locks = create_locks();
        let first = locks.lease("/a.txt", "s1").await.unwrap();
        let second = locks.lease("/a.txt", "s1").await.unwrap();

        first.finish().await.unwrap();
        assert!(matches!(
            locks.acquire("/a.txt", "s2").await,
            Err(Error::Locked { .. })
        ));

        second.finish().await.unwrap();
        assert!(locks.acquire("/a.txt", "s2").await.is_ok());
    }

    #[tokio::test]
    async fn test_overlapping_leases_keep_preexisting_lock() {
        let locks = create_locks();
        locks.acquire("/a.txt", "s1").await.unwrap();
        let first = locks.lease("/a.txt", "s1").await.unwrap();
        let second = locks.lease("/a.txt", "s1").await.unwrap();

        second.finish().await.unwrap();
        first.finish().await.unwrap();
        assert!(locks.status("/a.txt", Some("s2")).await.unwrap().locked);
    }

    #[tokio::test]
    async fn test_explicit_acquire_during_lease_is_kept() {
        let locks = create_locks();
        let lease = locks.lease("/a.txt", "s1").await.unwrap();
        locks.acquire("/a.txt", "s1").await.unwrap();
        lease.finish().await.unwrap();
        assert!(locks.status("/a.txt", Some("s2")).await.unwrap().locked);
    }

    #[tokio::test]
    async fn test_dropped_lease_releases_in_background() {
        let locks = create_locks();
        let lease = locks.lease("/a.txt", "s1").await.unwrap();
        drop(lease);

        for _ in 0..50 {
            if !locks.status("/a.txt", Some("s2")).await.unwrap().locked {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("dropped lease was never released");
    }
}
