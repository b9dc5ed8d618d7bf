//! Session records.
//!
//! Sessions are minted after an identity assertion has been verified.
//! Expiry is a pure function of `expires_at` against the clock: an expired
//! session reads as absent and is deleted on that read. [`SessionStore::cleanup_expired`]
//! sweeps the rest. Touches and deletes are serialized so a touch can
//! never write back a session that was deleted under it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::daemon::store::{Store, Table};
use crate::error::Result;
use crate::utils::now_ms;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub owner: String,
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    pub created_at: i64,
    pub last_used: i64,
    pub expires_at: i64,
}

impl Session {
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

#[derive(Clone)]
pub struct SessionStore {
    store: Store,
    ttl_ms: i64,
    write_lock: Arc<Mutex<()>>,
}

impl SessionStore {
    pub fn new(store: Store, ttl_secs: u64) -> Self {
        Self {
            store,
            ttl_ms: i64::try_from(ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Mint and persist a session for an already-verified identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be persisted.
    pub async fn create(
        &self,
        owner: &str,
        permissions: Vec<String>,
        app_name: Option<String>,
    ) -> Result<Session> {
        self.create_at(owner, permissions, app_name, now_ms()).await
    }

    pub(crate) async fn create_at(
        &self,
        owner: &str,
        permissions: Vec<String>,
        app_name: Option<String>,
        now: i64,
    ) -> Result<Session> {
        let session = Session {
            session_id: generate_session_id(now),
            owner: owner.to_string(),
            permissions,
            app_name,
            created_at: now,
            last_used: now,
            expires_at: now.saturating_add(self.ttl_ms),
        };
        self.store
            .put_json(Table::Sessions, &session.session_id, &session)
            .await?;
        debug!(owner = %owner, "Session created");
        Ok(session)
    }

    /// Look up a live session.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        self.get_at(session_id, now_ms()).await
    }

    pub(crate) async fn get_at(&self, session_id: &str, now: i64) -> Result<Option<Session>> {
        let Some(session) = self
            .store
            .get_json::<Session>(Table::Sessions, session_id)
            .await?
        else {
            return Ok(None);
        };
        if session.is_expired_at(now) {
            self.store.remove(Table::Sessions, session_id).await?;
            debug!(owner = %session.owner, "Expired session removed on read");
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Update `last_used` of a session that is still live.
    ///
    /// The record is re-read under the write lock; returns `None` if it was
    /// deleted or has expired since `session` was loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn touch(&self, session: &Session) -> Result<Option<Session>> {
        let _guard = self.write_lock.lock().await;
        let now = now_ms();
        let Some(mut touched) = self
            .store
            .get_json::<Session>(Table::Sessions, &session.session_id)
            .await?
        else {
            return Ok(None);
        };
        if touched.is_expired_at(now) {
            return Ok(None);
        }
        touched.last_used = now;
        self.store
            .put_json(Table::Sessions, &touched.session_id, &touched)
            .await?;
        Ok(Some(touched))
    }

    /// Delete a session. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        Ok(self.store.remove(Table::Sessions, session_id).await?)
    }

    /// Live sessions of one identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn list_for_owner(&self, owner: &str) -> Result<Vec<Session>> {
        Ok(self
            .list_live()
            .await?
            .into_iter()
            .filter(|s| s.owner == owner)
            .collect())
    }

    /// Every live session.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn list_live(&self) -> Result<Vec<Session>> {
        let now = now_ms();
        Ok(self
            .store
            .scan_json::<Session>(Table::Sessions, "")
            .await?
            .into_iter()
            .map(|(_, session)| session)
            .filter(|s| !s.is_expired_at(now))
            .collect())
    }

    /// Delete every expired session. Returns how many were removed.
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
            .scan_json::<Session>(Table::Sessions, "")
            .await?
            .into_iter()
            .filter(|(_, s)| s.is_expired_at(now))
            .map(|(key, _)| key)
            .collect();
        Ok(self.store.remove_many(Table::Sessions, expired).await?)
    }
}

/// 64 hex characters derived from a random UUID and the creation time.
fn generate_session_id(now: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    hasher.update(now.to_be_bytes());
    hex::encode(hasher.finalize())
}
