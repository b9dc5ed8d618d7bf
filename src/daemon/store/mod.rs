//! Ordered key-value store with pluggable backends.
//!
//! The engine keeps everything in a handful of lexicographically ordered
//! tables (see [`Table`]) and replaces tree traversal with prefix range
//! scans. Two backends ship:
//!
//! - **RedbBackend**: persistent, one redb file (default)
//! - **MemoryBackend**: non-persistent (tests, ephemeral runs)
//!
//! # Example
//!
//! ```ignore
//! use hengdang::daemon::store::{RangeQuery, Store, Table};
//!
//! let store = Store::memory();
//! store.put_json(Table::Files, "/a.txt", &record).await?;
//! let page = store.range_json::<FileRecord>(Table::Files, RangeQuery::prefix("/")).await?;
//! ```

mod backend;
mod memory;
mod redb;
mod types;


pub use backend::StoreBackend;
pub use memory::MemoryBackend;
pub use redb::RedbBackend;
pub use types::{RangeQuery, Table};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;

use crate::constants::SCAN_PAGE_SIZE;

/// Shared handle to the store.
///
/// `Clone` is cheap; every clone talks to the same backend.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StoreBackend>,
}

impl Store {
    /// Opens a redb-backed store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::custom(RedbBackend::open(path)?))
    }

    /// Creates a store backed by memory only.
    pub fn memory() -> Self {
        Self::custom(MemoryBackend::new())
    }

    /// Wraps a custom backend.
    pub fn custom<B: StoreBackend>(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Retrieves raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>> {
        self.backend.get(table, key).await
    }

    /// Retrieves and decodes a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the value is not valid JSON
    /// for `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, table: Table, key: &str) -> Result<Option<T>> {
        match self.backend.get(table, key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).with_context(|| {
                    format!("Failed to deserialize '{key}' from '{}'", table.name())
                })?;
                Ok(Some(value))
            },
            None => Ok(None),
        }
    }

    /// Stores raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn put(&self, table: Table, key: &str, value: Vec<u8>) -> Result<()> {
        self.backend.put(table, key, value).await
    }

    /// Encodes and stores a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the backend fails.
    pub async fn put_json<T: Serialize + ?Sized>(&self, table: Table, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).context("Failed to serialize value to JSON")?;
        self.backend.put(table, key, bytes).await
    }

    /// Stores several raw values in one batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn put_many(&self, table: Table, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.backend.put_many(table, entries).await
    }

    /// Removes a key. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn remove(&self, table: Table, key: &str) -> Result<bool> {
        self.backend.remove(table, key).await
    }

    /// Removes several keys in one batch. Returns how many existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn remove_many(&self, table: Table, keys: Vec<String>) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.backend.remove_many(table, keys).await
    }

    /// Raw range scan.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn range(&self, table: Table, query: RangeQuery) -> Result<Vec<(String, Vec<u8>)>> {
        self.backend.range(table, query).await
    }

    /// Range scan decoding each value as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or a value does not decode.
    pub async fn range_json<T: DeserializeOwned>(
        &self,
        table: Table,
        query: RangeQuery,
    ) -> Result<Vec<(String, T)>> {
        self.backend
            .range(table, query)
            .await?
            .into_iter()
            .map(|(key, bytes)| {
                let value = serde_json::from_slice(&bytes).with_context(|| {
                    format!("Failed to deserialize '{key}' from '{}'", table.name())
                })?;
                Ok((key, value))
            })
            .collect()
    }

    /// Walks every key under `prefix` in pages, decoding values as JSON.
    ///
    /// Used by full-table sweeps and statistics; request handling uses
    /// bounded [`Store::range_json`] calls instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or a value does not decode.
    pub async fn scan_json<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &str,
    ) -> Result<Vec<(String, T)>> {
        let mut out = Vec::new();
        let mut cursor = None;
        loop {
            let query = RangeQuery::prefix(prefix).after(cursor).limit(SCAN_PAGE_SIZE);
            let page: Vec<(String, T)> = self.range_json(table, query).await?;
            let done = page.len() < SCAN_PAGE_SIZE;
            cursor = page.last().map(|(key, _)| key.clone());
            out.extend(page);
            if done {
                return Ok(out);
            }
        }
    }

    /// Collects every key under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn scan_keys(&self, table: Table, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut cursor = None;
        loop {
            let query = RangeQuery::prefix(prefix).after(cursor).limit(SCAN_PAGE_SIZE);
            let page = self.backend.range(table, query).await?;
            let done = page.len() < SCAN_PAGE_SIZE;
            cursor = page.last().map(|(key, _)| key.clone());
            out.extend(page.into_iter().map(|(key, _)| key));
            if done {
                return Ok(out);
            }
        }
    }

    /// Whether any key starts with `prefix`, ignoring the key equal to
    /// `prefix` itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn has_descendant(&self, table: Table, prefix: &str) -> Result<bool> {
        let query = RangeQuery::prefix(prefix)
            .after(Some(prefix.to_string()))
            .limit(1);
        Ok(!self.backend.range(table, query).await?.is_empty())
    }

    /// Last key of a table in sort order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn last_key(&self, table: Table) -> Result<Option<String>> {
        let query = RangeQuery::prefix("").reversed(true).limit(1);
        Ok(self
            .backend
            .range(table, query)
            .await?
            .into_iter()
            .next()
            .map(|(key, _)| key))
    }
}
