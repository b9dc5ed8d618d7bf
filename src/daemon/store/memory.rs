//! In-memory store backend.
//!
//! Non-persistent; used by tests and `storage.backend = "memory"`.

use super::backend::StoreBackend;
use super::types::{RangeQuery, Table};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;

/// In-memory backend: one ordered map per table.
///
/// `DashMap` shards by table, so writers to different tables never contend.
/// All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryBackend {
    tables: DashMap<Table, BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates a new empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a table.
    #[cfg(test)]
    pub fn len(&self, table: Table) -> usize {
        self.tables.get(&table).map_or(0, |t| t.len())
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tables
            .get(&table)
            .and_then(|t| t.get(key).cloned()))
    }

    async fn put(&self, table: Table, key: &str, value: Vec<u8>) -> Result<()> {
        self.tables
            .entry(table)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn put_many(&self, table: Table, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        self.tables.entry(table).or_default().extend(entries);
        Ok(())
    }

    async fn remove(&self, table: Table, key: &str) -> Result<bool> {
        Ok(self
            .tables
            .get_mut(&table)
            .is_some_and(|mut t| t.remove(key).is_some()))
    }

    async fn remove_many(&self, table: Table, keys: Vec<String>) -> Result<usize> {
        let Some(mut t) = self.tables.get_mut(&table) else {
            return Ok(0);
        };
        Ok(keys.iter().filter(|key| t.remove(key.as_str()).is_some()).count())
    }

    async fn range(&self, table: Table, query: RangeQuery) -> Result<Vec<(String, Vec<u8>)>> {
        let Some(bounds) = query.bounds() else {
            return Ok(Vec::new());
        };
        let Some(t) = self.tables.get(&table) else {
            return Ok(Vec::new());
        };

        let limit = query.limit.unwrap_or(usize::MAX);
        let range = t.range::<String, _>(bounds);
        let entries: Box<dyn Iterator<Item = (&String, &Vec<u8>)>> = if query.reverse {
            Box::new(range.rev())
        } else {
            Box::new(range)
        };

        Ok(entries
            .filter(|(key, _)| key.starts_with(&query.prefix))
            .take(limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
