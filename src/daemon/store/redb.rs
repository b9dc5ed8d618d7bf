//! Redb-backed store.
//!
//! One database file holds every [`Table`]; each is a
//! `&str → &[u8]` redb table.

use super::backend::StoreBackend;
use super::types::{RangeQuery, Table};
use anyhow::{Context, Result};
use async_trait::async_trait;
use redb::{Database, ReadableDatabase, TableDefinition};
use std::path::Path;
use std::sync::Arc;

fn definition(table: Table) -> TableDefinition<'static, &'static str, &'static [u8]> {
    TableDefinition::new(table.name())
}

/// Redb-backed storage backend.
///
/// `Clone` and shareable across threads; redb serializes writers and lets
/// readers proceed concurrently on a snapshot.
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Opens or creates the database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Parent directory cannot be created
    /// - Database file cannot be opened or created
    /// - Table initialization fails
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let db = Database::create(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // Create every table up front so read transactions never miss one.
        let write_txn = db
            .begin_write()
            .context("Failed to begin initialization transaction")?;
        for table in Table::ALL {
            write_txn
                .open_table(definition(table))
                .with_context(|| format!("Failed to initialize table '{}'", table.name()))?;
        }
        write_txn
            .commit()
            .context("Failed to commit initialization transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn get_sync(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self
            .db
            .begin_read()
            .context("Failed to begin read transaction")?;
        let t = read_txn
            .open_table(definition(table))
            .with_context(|| format!("Failed to open table '{}'", table.name()))?;

        let value = t
            .get(key)
            .with_context(|| format!("Failed to read key '{key}' from '{}'", table.name()))?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn put_many_sync(&self, table: Table, entries: &[(String, Vec<u8>)]) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .context("Failed to begin write transaction")?;
        {
            let mut t = write_txn
                .open_table(definition(table))
                .with_context(|| format!("Failed to open table '{}'", table.name()))?;
            for (key, value) in entries {
                t.insert(key.as_str(), value.as_slice())
                    .with_context(|| format!("Failed to insert key '{key}' into '{}'", table.name()))?;
            }
        }
        write_txn
            .commit()
            .context("Failed to commit write transaction")?;
        Ok(())
    }

    fn remove_many_sync(&self, table: Table, keys: &[String]) -> Result<usize> {
        let write_txn = self
            .db
            .begin_write()
            .context("Failed to begin write transaction")?;
        let mut removed = 0;
        {
            let mut t = write_txn
                .open_table(definition(table))
                .with_context(|| format!("Failed to open table '{}'", table.name()))?;
            for key in keys {
                if t.remove(key.as_str())
                    .with_context(|| format!("Failed to remove key '{key}' from '{}'", table.name()))?
                    .is_some()
                {
                    removed += 1;
                }
            }
        }
        write_txn
            .commit()
            .context("Failed to commit delete transaction")?;
        Ok(removed)
    }

    fn range_sync(&self, table: Table, query: &RangeQuery) -> Result<Vec<(String, Vec<u8>)>> {
        let Some((lower, upper)) = query.bounds() else {
            return Ok(Vec::new());
        };
        let limit = query.limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let read_txn = self
            .db
            .begin_read()
            .context("Failed to begin read transaction")?;
        let t = read_txn
            .open_table(definition(table))
            .with_context(|| format!("Failed to open table '{}'", table.name()))?;

        let range = t
            .range::<&str>((
                lower.as_ref().map(String::as_str),
                upper.as_ref().map(String::as_str),
            ))
            .with_context(|| format!("Failed to scan table '{}'", table.name()))?;
        let entries: Box<dyn Iterator<Item = _>> = if query.reverse {
            Box::new(range.rev())
        } else {
            Box::new(range)
        };

        let mut out = Vec::new();
        for entry in entries {
            let (key, value) =
                entry.with_context(|| format!("Failed to read entry from '{}'", table.name()))?;
            let key = key.value();
            if !key.starts_with(&query.prefix) {
                continue;
            }
            out.push((key.to_string(), value.value().to_vec()));
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl StoreBackend for RedbBackend {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>> {
        let backend = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || backend.get_sync(table, &key))
            .await
            .context("Task join error")?
    }

    async fn put(&self, table: Table, key: &str, value: Vec<u8>) -> Result<()> {
        self.put_many(table, vec![(key.to_string(), value)]).await
    }

    async fn put_many(&self, table: Table, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        let backend = self.clone();
        tokio::task::spawn_blocking(move || backend.put_many_sync(table, &entries))
            .await
            .context("Task join error")?
    }

    async fn remove(&self, table: Table, key: &str) -> Result<bool> {
        Ok(self.remove_many(table, vec![key.to_string()]).await? > 0)
    }

    async fn remove_many(&self, table: Table, keys: Vec<String>) -> Result<usize> {
        let backend = self.clone();
        tokio::task::spawn_blocking(move || backend.remove_many_sync(table, &keys))
            .await
            .context("Task join error")?
    }

    async fn range(&self, table: Table, query: RangeQuery) -> Result<Vec<(String, Vec<u8>)>> {
        let backend = self.clone();
        tokio::task::spawn_blocking(move || backend.range_sync(table, &query))
            .await
            .context("Task join error")?
    }
}
