//! Explicit directory records over the flat key space.
//!
//! Directory keys always end with `/`. A directory exists only if it has a
//! record, so empty directories are representable. The root `/` is a shared
//! namespace: creating a child directly under it needs no ownership of the
//! root record.

mod listing;

pub use listing::{EntryType, ListOptions, Listing, ListingEntry};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::daemon::services::events::{EntryKind, EventLog, Operation};
use crate::daemon::services::files::FileRecord;
use crate::daemon::services::path::{ancestors, directory_key, parent_directory};
use crate::daemon::store::{Store, Table};
use crate::error::{Error, Result};
use crate::utils::now_ms;

pub const ROOT: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryRecord {
    pub path: String,
    pub owner: String,
    pub created: i64,
    pub modified: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Optional attributes supplied on create or update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectoryAttributes {
    pub permissions: Option<Vec<String>>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryStats {
    pub file_count: usize,
    pub directory_count: usize,
    pub total_size: u64,
}

#[derive(Clone)]
pub struct DirectoryStore {
    store: Store,
    events: EventLog,
}

impl DirectoryStore {
    pub fn new(store: Store, events: EventLog) -> Self {
        Self { store, events }
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn get(&self, path: &str) -> Result<Option<DirectoryRecord>> {
        Ok(self
            .store
            .get_json(Table::Directories, &directory_key(path))
            .await?)
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.get(path).await?.is_some())
    }

    /// Create the root record if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn ensure_root(&self, owner: &str) -> Result<DirectoryRecord> {
        match self.get(ROOT).await? {
            Some(root) => Ok(root),
            None => {
                info!(owner = %owner, "Creating root directory");
                self.insert(ROOT, owner, DirectoryAttributes::default()).await
            },
        }
    }

    async fn insert(&self, key: &str, owner: &str, attrs: DirectoryAttributes) -> Result<DirectoryRecord> {
        let now = now_ms();
        let record = DirectoryRecord {
            path: key.to_string(),
            owner: owner.to_string(),
            created: now,
            modified: now,
            permissions: attrs.permissions,
            description: attrs.description,
        };
        self.store.put_json(Table::Directories, key, &record).await?;
        self.events
            .append(Operation::Mkdir, key, EntryKind::Directory, owner)
            .await?;
        Ok(record)
    }

    /// Create a directory whose parent already exists.
    ///
    /// # Errors
    ///
    /// - [`Error::Conflict`] if the directory exists
    /// - [`Error::Validation`] if the parent is missing
    /// - [`Error::Forbidden`] if the parent belongs to someone else
    pub async fn create(&self, path: &str, owner: &str, attrs: DirectoryAttributes) -> Result<DirectoryRecord> {
        let key = directory_key(path);
        if self.exists(&key).await? {
            return Err(Error::conflict(format!("Directory already exists: {key}")));
        }

        if let Some(parent) = parent_directory(&key) {
            let Some(parent_record) = self.get(&parent).await? else {
                return Err(Error::validation(format!(
                    "Parent directory does not exist: {parent}"
                )));
            };
            if parent != ROOT && parent_record.owner != owner {
                return Err(Error::forbidden(format!(
                    "Cannot create directory in {parent}"
                )));
            }
        }

        let record = self.insert(&key, owner, attrs).await?;
        debug!(path = %key, owner = %owner, "Directory created");
        Ok(record)
    }

    /// Delete an empty directory. Returns false if it does not exist.
    ///
    /// # Errors
    ///
    /// - [`Error::Forbidden`] for the root or a directory of another owner
    /// - [`Error::Conflict`] if the directory is not empty
    pub async fn delete(&self, path: &str, owner: &str) -> Result<bool> {
        let key = directory_key(path);
        if key == ROOT {
            return Err(Error::forbidden("Cannot delete the root directory"));
        }
        let Some(record) = self.get(&key).await? else {
            return Ok(false);
        };
        if record.owner != owner {
            return Err(Error::forbidden(format!("Not the owner of {key}")));
        }
        if !self.is_empty(&key).await? {
            return Err(Error::conflict(format!("Directory is not empty: {key}")));
        }

        self.store.remove(Table::Directories, &key).await?;
        self.events
            .append(Operation::Rmdir, &key, EntryKind::Directory, owner)
            .await?;
        info!(path = %key, "Directory deleted");
        Ok(true)
    }

    /// Change permissions or description of an owned directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::Forbidden`].
    pub async fn update(&self, path: &str, owner: &str, attrs: DirectoryAttributes) -> Result<DirectoryRecord> {
        let key = directory_key(path);
        let Some(mut record) = self.get(&key).await? else {
            return Err(Error::not_found(format!("Directory not found: {key}")));
        };
        if record.owner != owner {
            return Err(Error::forbidden(format!("Not the owner of {key}")));
        }
        if attrs.permissions.is_some() {
            record.permissions = attrs.permissions;
        }
        if attrs.description.is_some() {
            record.description = attrs.description;
        }
        record.modified = now_ms();
        self.store.put_json(Table::Directories, &key, &record).await?;
        Ok(record)
    }

    /// True when no file or directory lives beneath `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn is_empty(&self, path: &str) -> Result<bool> {
        let key = directory_key(path);
        Ok(!self.store.has_descendant(Table::Files, &key).await?
            && !self.store.has_descendant(Table::Directories, &key).await?)
    }

    /// Materialize every missing ancestor of `path` for `owner`.
    ///
    /// Existing ancestors other than the root must belong to `owner`
    /// wherever a new directory would be created beneath them, and the
    /// immediate parent must too.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] when a needed ancestor belongs to
    /// someone else.
    pub async fn ensure_parent_directories(&self, path: &str, owner: &str) -> Result<()> {
        // Owner of the nearest ancestor seen so far; `None` at the root.
        let mut enclosing: Option<String> = None;
        for dir in ancestors(path) {
            match self.get(&dir).await? {
                Some(record) => {
                    enclosing = (dir != ROOT).then_some(record.owner);
                },
                None => {
                    if let Some(other) = &enclosing
                        && other != owner
                    {
                        return Err(Error::forbidden(format!("Cannot create {dir}")));
                    }
                    self.insert(&dir, owner, DirectoryAttributes::default()).await?;
                    debug!(path = %dir, owner = %owner, "Parent directory created");
                    enclosing = (dir != ROOT).then(|| owner.to_string());
                },
            }
        }
        if let Some(other) = enclosing
            && other != owner
        {
            return Err(Error::forbidden(format!(
                "Parent directory of {path} belongs to another identity"
            )));
        }
        Ok(())
    }

    /// Every directory owned by `owner`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn list_user_directories(&self, owner: &str) -> Result<Vec<DirectoryRecord>> {
        Ok(self
            .store
            .scan_json::<DirectoryRecord>(Table::Directories, "")
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .filter(|r| r.owner == owner)
            .collect())
    }

    /// Totals for everything beneath `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn stats(&self, path: &str) -> Result<DirectoryStats> {
        let key = directory_key(path);
        let files: Vec<(String, FileRecord)> = self.store.scan_json(Table::Files, &key).await?;
        let directories = self
            .store
            .scan_keys(Table::Directories, &key)
            .await?
            .into_iter()
            .filter(|k| *k != key)
            .count();
        Ok(DirectoryStats {
            file_count: files.len(),
            directory_count: directories,
            total_size: files.iter().map(|(_, f)| f.content_length).sum(),
        })
    }

    /// Number of directory records, for system statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.store.scan_keys(Table::Directories, "").await?.len())
    }
}
