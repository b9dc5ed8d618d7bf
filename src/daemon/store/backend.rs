//! Backend trait for the ordered store.
//!
//! Defines the interface that every storage backend implements, so the
//! engine runs unchanged on redb or in memory.

use anyhow::Result;
use async_trait::async_trait;

use super::types::{RangeQuery, Table};

/// An ordered key-value store split into named tables.
///
/// Single-key operations are atomic. Batch operations (`put_many`,
/// `remove_many`) are applied in one backend transaction where the backend
/// has one; callers must not rely on atomicity across separate calls.
///
/// # Example
///
/// ```ignore
/// use hengdang::daemon::store::{MemoryBackend, RangeQuery, StoreBackend, Table};
///
/// let backend = MemoryBackend::new();
/// backend.put(Table::Files, "/a.txt", b"{}".to_vec()).await?;
/// let entries = backend.range(Table::Files, RangeQuery::prefix("/")).await?;
/// ```
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// Retrieves a value by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage operation fails.
    async fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores a value, overwriting any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage operation fails.
    async fn put(&self, table: Table, key: &str, value: Vec<u8>) -> Result<()>;

    /// Stores several values in one batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage operation fails. Nothing
    /// from the batch is visible in that case when the backend is
    /// transactional.
    async fn put_many(&self, table: Table, entries: Vec<(String, Vec<u8>)>) -> Result<()>;

    /// Removes a key. Returns `Ok(true)` if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage operation fails.
    async fn remove(&self, table: Table, key: &str) -> Result<bool>;

    /// Removes several keys in one batch. Returns how many existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage operation fails.
    async fn remove_many(&self, table: Table, keys: Vec<String>) -> Result<usize>;

    /// Returns the entries matched by `query`, in scan order.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage operation fails.
    async fn range(&self, table: Table, query: RangeQuery) -> Result<Vec<(String, Vec<u8>)>>;
}
