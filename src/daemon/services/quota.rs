//! Per-identity quota records.
//!
//! A quota record doubles as the identity allow-list: an identity may sign
//! in only while its record exists and is enabled. Usage changes are
//! serialized through one mutex so concurrent deltas never lose updates.
//! Bytes a write is about to store are reserved in memory until its usage
//! delta lands, so concurrent writes of one owner cannot jointly overrun
//! the limit.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::constants::MAX_STORAGE_LIMIT;
use crate::daemon::store::{RangeQuery, Store, Table};
use crate::error::{Error, Result};
use crate::utils::now_ms;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRecord {
    pub owner: String,
    pub enabled: bool,
    pub storage_limit: u64,
    pub storage_used: u64,
    pub created_at: i64,
    pub last_active: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Fields an administrator may set when provisioning or updating a record.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUpdate {
    pub enabled: Option<bool>,
    pub storage_limit: Option<u64>,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaPage {
    pub users: Vec<QuotaRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Clone)]
pub struct QuotaTracker {
    store: Store,
    default_limit: u64,
    write_lock: Arc<Mutex<()>>,
    pending: Arc<DashMap<String, u64>>,
}

impl QuotaTracker {
    pub fn new(store: Store, default_limit: u64) -> Self {
        Self {
            store,
            default_limit,
            write_lock: Arc::new(Mutex::new(())),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn get(&self, owner: &str) -> Result<Option<QuotaRecord>> {
        Ok(self.store.get_json(Table::Quotas, owner).await?)
    }

    /// Create a record, or update an existing one keeping its usage and
    /// creation time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a limit above 1 TiB.
    pub async fn provision(&self, owner: &str, update: QuotaUpdate) -> Result<QuotaRecord> {
        if let Some(limit) = update.storage_limit {
            validate_limit(limit)?;
        }

        let _guard = self.write_lock.lock().await;
        let now = now_ms();
        let record = match self.get(owner).await? {
            Some(existing) => QuotaRecord {
                enabled: update.enabled.unwrap_or(existing.enabled),
                storage_limit: update.storage_limit.unwrap_or(existing.storage_limit),
                display_name: update.display_name.or(existing.display_name),
                email: update.email.or(existing.email),
                notes: update.notes.or(existing.notes),
                ..existing
            },
            None => {
                info!(owner = %owner, "Provisioning quota record");
                QuotaRecord {
                    owner: owner.to_string(),
                    enabled: update.enabled.unwrap_or(true),
                    storage_limit: update.storage_limit.unwrap_or(self.default_limit),
                    storage_used: 0,
                    created_at: now,
                    last_active: now,
                    display_name: update.display_name,
                    email: update.email,
                    notes: update.notes,
                }
            },
        };
        self.store.put_json(Table::Quotas, owner, &record).await?;
        Ok(record)
    }

    /// Create a default record for `owner` if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn ensure(&self, owner: &str) -> Result<QuotaRecord> {
        match self.get(owner).await? {
            Some(record) => Ok(record),
            None => self.provision(owner, QuotaUpdate::default()).await,
        }
    }

    /// Whether `owner` has an enabled record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn is_allowed(&self, owner: &str) -> Result<bool> {
        Ok(self.get(owner).await?.is_some_and(|r| r.enabled))
    }

    /// Record activity for `owner`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn touch(&self, owner: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(mut record) = self.get(owner).await? {
            record.last_active = now_ms();
            self.store.put_json(Table::Quotas, owner, &record).await?;
        }
        Ok(())
    }

    /// `storageUsed + reserved + additional <= storageLimit`. Unknown owners
    /// have no allowance.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn check_storage_limit(&self, owner: &str, additional: u64) -> Result<bool> {
        let reserved = self.reserved(owner);
        Ok(self.get(owner).await?.is_some_and(|r| {
            r.storage_used
                .saturating_add(reserved)
                .saturating_add(additional)
                <= r.storage_limit
        }))
    }

    /// Check the limit and hold `additional` bytes against it until the
    /// returned reservation is dropped. `None` if the bytes do not fit.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn reserve_storage(&self, owner: &str, additional: u64) -> Result<Option<StorageReservation>> {
        let _guard = self.write_lock.lock().await;
        if !self.check_storage_limit(owner, additional).await? {
            return Ok(None);
        }
        *self.pending.entry(owner.to_string()).or_insert(0) += additional;
        Ok(Some(StorageReservation {
            pending: Arc::clone(&self.pending),
            owner: owner.to_string(),
            bytes: additional,
        }))
    }

    fn reserved(&self, owner: &str) -> u64 {
        self.pending.get(owner).map_or(0, |bytes| *bytes)
    }

    /// Apply a signed usage delta, clamped at zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn update_storage_usage(&self, owner: &str, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        if let Some(mut record) = self.get(owner).await? {
            record.storage_used = if delta >= 0 {
                record.storage_used.saturating_add(delta.unsigned_abs())
            } else {
                record.storage_used.saturating_sub(delta.unsigned_abs())
            };
            self.store.put_json(Table::Quotas, owner, &record).await?;
        }
        Ok(())
    }

    /// Enable or disable an identity. Returns false if it has no record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn set_enabled(&self, owner: &str, enabled: bool) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(mut record) = self.get(owner).await? else {
            return Ok(false);
        };
        record.enabled = enabled;
        self.store.put_json(Table::Quotas, owner, &record).await?;
        Ok(true)
    }

    /// Change the storage limit. Returns false if `owner` has no record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a limit above 1 TiB.
    pub async fn set_storage_limit(&self, owner: &str, limit: u64) -> Result<bool> {
        validate_limit(limit)?;
        let _guard = self.write_lock.lock().await;
        let Some(mut record) = self.get(owner).await? else {
            return Ok(false);
        };
        record.storage_limit = limit;
        self.store.put_json(Table::Quotas, owner, &record).await?;
        Ok(true)
    }

    /// Page through records in identity order. The cursor is exclusive.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn list(&self, limit: usize, cursor: Option<String>, enabled_only: bool) -> Result<QuotaPage> {
        let mut users = Vec::new();
        let mut after = cursor;
        loop {
            let range = RangeQuery::prefix("").after(after.clone()).limit(limit + 1);
            let batch: Vec<(String, QuotaRecord)> = self.store.range_json(Table::Quotas, range).await?;
            let exhausted = batch.len() <= limit;
            after = batch.last().map(|(key, _)| key.clone());
            users.extend(
                batch
                    .into_iter()
                    .map(|(_, record)| record)
                    .filter(|r| !enabled_only || r.enabled),
            );
            if users.len() > limit || exhausted {
                break;
            }
        }

        let has_more = users.len() > limit;
        users.truncate(limit);
        let next_cursor = if has_more {
            users.last().map(|u| u.owner.clone())
        } else {
            None
        };
        Ok(QuotaPage {
            users,
            next_cursor,
            has_more,
        })
    }

    /// Every record, for statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn all(&self) -> Result<Vec<QuotaRecord>> {
        Ok(self
            .store
            .scan_json(Table::Quotas, "")
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }
}

/// Bytes held against an owner's limit while a write is in flight.
#[derive(Debug)]
pub struct StorageReservation {
    pending: Arc<DashMap<String, u64>>,
    owner: String,
    bytes: u64,
}

impl Drop for StorageReservation {
    fn drop(&mut self) {
        let emptied = match self.pending.get_mut(&self.owner) {
            Some(mut reserved) => {
                *reserved = reserved.saturating_sub(self.bytes);
                *reserved == 0
            },
            None => false,
        };
        if emptied {
            self.pending.remove_if(&self.owner, |_, reserved| *reserved == 0);
        }
    }
}

fn validate_limit(limit: u64) -> Result<()> {
    if limit > MAX_STORAGE_LIMIT {
        return Err(Error::validation("Storage limit must be between 0 and 1TB"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_tracker() -> QuotaTracker {
        QuotaTracker::new(Store::memory(), 1000)
    }

    #[tokio::test]
    async fn test_unknown_owner_has_no_allowance() {
        let quota = create_tracker();
        assert!(!quota.check_storage_limit("nobody", 0).await.unwrap());
        assert!(!quota.is_allowed("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn test_limit_check_is_inclusive() {
        let quota = create_tracker();
        quota.ensure("alice").await.unwrap();
        quota.update_storage_usage("alice", 400).await.unwrap();

        assert!(quota.check_storage_limit("alice", 600).await.unwrap());
        assert!(!quota.check_storage_limit("alice", 601).await.unwrap());
    }

    #[tokio::test]
    async fn test_reservations_count_against_limit_until_dropped() {
        let quota = create_tracker();
        quota.ensure("alice").await.unwrap();

        let first = quota.reserve_storage("alice", 600).await.unwrap();
        assert!(first.is_some());
        assert!(quota.reserve_storage("alice", 600).await.unwrap().is_none());
        assert!(quota.reserve_storage("alice", 400).await.unwrap().is_some());

        drop(first);
        assert!(quota.reserve_storage("alice", 600).await.unwrap().is_some());
        assert!(quota.pending.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_exceed_limit() {
        let quota = create_tracker();
        quota.ensure("alice").await.unwrap();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let quota = quota.clone();
                tokio::spawn(async move { quota.reserve_storage("alice", 300).await.unwrap() })
            })
            .collect();
        let mut granted = Vec::new();
        for attempt in attempts {
            granted.extend(attempt.await.unwrap());
        }
        assert_eq!(granted.len(), 3);
    }

    #[tokio::test]
    async fn test_usage_clamps_at_zero() {
        let quota = create_tracker();
        quota.ensure("alice").await.unwrap();
        quota.update_storage_usage("alice", 10).await.unwrap();
        quota.update_storage_usage("alice", -50).await.unwrap();
        assert_eq!(quota.get("alice").await.unwrap().unwrap().storage_used, 0);
    }

    #[tokio::test]
    async fn test_provision_keeps_usage_on_update() {
        let quota = create_tracker();
        quota.ensure("alice").await.unwrap();
        quota.update_storage_usage("alice", 42).await.unwrap();

        let updated = quota
            .provision(
                "alice",
                QuotaUpdate {
                    storage_limit: Some(5000),
                    display_name: Some("Alice".into()),
                    ..QuotaUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.storage_used, 42);
        assert_eq!(updated.storage_limit, 5000);
        assert_eq!(updated.display_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_limit_above_one_tib_rejected() {
        let quota = create_tracker();
        quota.ensure("alice").await.unwrap();
        let err = quota
            .set_storage_limit("alice", MAX_STORAGE_LIMIT + 1)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(!quota.set_storage_limit("nobody", 10).await.unwrap());
    }

    #[tokio::test]
    async fn test_disable_revokes_allowance() {
        let quota = create_tracker();
        quota.ensure("alice").await.unwrap();
        assert!(quota.set_enabled("alice", false).await.unwrap());
        assert!(!quota.is_allowed("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_paginates_and_filters() {
        let quota = create_tracker();
        for owner in ["a", "b", "c", "d"] {
            quota.ensure(owner).await.unwrap();
        }
        quota.set_enabled("b", false).await.unwrap();

        let page = quota.list(2, None, false).await.unwrap();
        assert_eq!(page.users.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.next_cursor.as_deref(), Some("b"));

        let page = quota.list(2, page.next_cursor, false).await.unwrap();
        let owners: Vec<_> = page.users.iter().map(|u| u.owner.as_str()).collect();
        assert_eq!(owners, vec!["c", "d"]);
        assert!(!page.has_more);

        let enabled = quota.list(10, None, true).await.unwrap();
        assert_eq!(enabled.users.len(), 3);
    }
}
