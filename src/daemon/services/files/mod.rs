//! Chunked file storage.
//!
//! Content is split into fixed-size chunks in the blobs table under
//! `{file_id}:{index}` and described by one [`FileRecord`] in the files
//! table. The record is the sole authority on existence: it is written
//! only after every chunk is stored, so a reader sees either the previous
//! complete version or the new one. Orphaned chunks left behind by a crash
//! are never referenced.

pub mod content_type;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::daemon::services::clock::MonotonicClock;
use crate::daemon::services::events::{EntryKind, EventLog, Operation};
use crate::daemon::services::quota::QuotaTracker;
use crate::daemon::store::{RangeQuery, Store, Table};
use crate::error::{Error, Result};
use crate::utils::format_bytes;

/// Metadata of one stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub path: String,
    /// Lowercase hex sha256 of the content.
    pub content_hash: String,
    pub content_type: String,
    pub content_length: u64,
    /// Modification time in ms; doubles as the chunk namespace id.
    pub timestamp: i64,
    pub chunk_count: u32,
    pub owner: String,
}

impl FileRecord {
    /// Quoted entity tag: `"{hash}-{timestamp}"`.
    pub fn etag(&self) -> String {
        format!("\"{}-{}\"", self.content_hash, self.timestamp)
    }
}

#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub record: FileRecord,
    /// True if no file existed at the path before.
    pub created: bool,
}

fn chunk_prefix(file_id: i64) -> String {
    format!("{file_id:015}:")
}

fn chunk_key(file_id: i64, index: usize) -> String {
    format!("{file_id:015}:{index:08}")
}

#[derive(Clone)]
pub struct FileStore {
    store: Store,
    quota: QuotaTracker,
    events: EventLog,
    clock: Arc<MonotonicClock>,
    chunk_size: usize,
}

impl FileStore {
    pub fn new(
        store: Store,
        quota: QuotaTracker,
        events: EventLog,
        clock: Arc<MonotonicClock>,
        chunk_size: usize,
    ) -> Self {
        Self {
            store,
            quota,
            events,
            clock,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Metadata lookup without touching content.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn metadata(&self, path: &str) -> Result<Option<FileRecord>> {
        Ok(self.store.get_json(Table::Files, path).await?)
    }

    /// Store `content` at `path`, replacing any previous version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageLimitExceeded`] before any chunk is written
    /// if the owner's quota cannot hold the content, or an internal error
    /// if the store fails.
    pub async fn write_file(&self, path: &str, content: Bytes, owner: &str) -> Result<WriteOutcome> {
        let existing = self.metadata(path).await?;
        let length = content.len() as u64;

        let Some(reservation) = self.quota.reserve_storage(owner, length).await? else {
            return Err(Error::StorageLimitExceeded(format!(
                "Writing {} would exceed the storage limit",
                format_bytes(length)
            )));
        };

        let content_hash = hex::encode(Sha256::digest(&content));
        let content_type = content_type::detect(&content, path);
        let file_id = self.clock.next();

        let chunks: Vec<(String, Vec<u8>)> = content
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(index, chunk)| (chunk_key(file_id, index), chunk.to_vec()))
            .collect();
        let chunk_keys: Vec<String> = chunks.iter().map(|(key, _)| key.clone()).collect();
        let chunk_count = u32::try_from(chunks.len())
            .map_err(|_| Error::validation("File has too many chunks"))?;

        if let Err(e) = self.store.put_many(Table::Blobs, chunks).await {
            self.discard_chunks(chunk_keys).await;
            return Err(e.into());
        }

        let record = FileRecord {
            path: path.to_string(),
            content_hash,
            content_type,
            content_length: length,
            timestamp: file_id,
            chunk_count,
            owner: owner.to_string(),
        };
        if let Err(e) = self.store.put_json(Table::Files, path, &record).await {
            self.discard_chunks(chunk_keys).await;
            return Err(e.into());
        }

        let previous_length = match &existing {
            Some(old) => {
                self.discard_chunks(self.chunk_keys_of(old)).await;
                old.content_length
            },
            None => 0,
        };
        self.quota
            .update_storage_usage(owner, signed_delta(length, previous_length))
            .await?;
        drop(reservation);
        self.events
            .append(Operation::Put, path, EntryKind::File, owner)
            .await?;

        debug!(
            path = %path,
            size = length,
            chunks = chunk_count,
            created = existing.is_none(),
            "File written"
        );
        Ok(WriteOutcome {
            record,
            created: existing.is_none(),
        })
    }

    /// Read a file and reassemble its content.
    ///
    /// # Errors
    ///
    /// Returns an internal error if chunks are missing or the store fails.
    pub async fn read_file(&self, path: &str) -> Result<Option<(Bytes, FileRecord)>> {
        let Some(record) = self.metadata(path).await? else {
            return Ok(None);
        };

        let chunks = self
            .store
            .range(Table::Blobs, RangeQuery::prefix(chunk_prefix(record.timestamp)))
            .await?;
        if chunks.len() != record.chunk_count as usize {
            return Err(Error::Internal(anyhow::anyhow!(
                "File '{path}' has {} of {} chunks",
                chunks.len(),
                record.chunk_count
            )));
        }

        let mut content = BytesMut::with_capacity(usize::try_from(record.content_length).unwrap_or(0));
        for (_, chunk) in chunks {
            content.extend_from_slice(&chunk);
        }
        Ok(Some((content.freeze(), record)))
    }

    /// Delete a file. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn delete_file(&self, path: &str) -> Result<bool> {
        let Some(record) = self.metadata(path).await? else {
            return Ok(false);
        };

        self.store
            .remove_many(Table::Blobs, self.chunk_keys_of(&record))
            .await?;
        self.store.remove(Table::Files, path).await?;
        self.quota
            .update_storage_usage(&record.owner, signed_delta(0, record.content_length))
            .await?;
        self.events
            .append(Operation::Delete, path, EntryKind::File, &record.owner)
            .await?;

        info!(path = %path, size = record.content_length, "File deleted");
        Ok(true)
    }

    /// Every file record under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn scan(&self, prefix: &str) -> Result<Vec<FileRecord>> {
        Ok(self
            .store
            .scan_json(Table::Files, prefix)
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    fn chunk_keys_of(&self, record: &FileRecord) -> Vec<String> {
        (0..record.chunk_count as usize)
            .map(|index| chunk_key(record.timestamp, index))
            .collect()
    }

    async fn discard_chunks(&self, keys: Vec<String>) {
        if let Err(e) = self.store.remove_many(Table::Blobs, keys).await {
            warn!(error = %e, "Failed to remove unreferenced chunks");
        }
    }
}

fn signed_delta(new_len: u64, old_len: u64) -> i64 {
    let new_len = i64::try_from(new_len).unwrap_or(i64::MAX);
    let old_len = i64::try_from(old_len).unwrap_or(i64::MAX);
    new_len - old_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::services::events::{ChangeNotifier, EventQuery};

    struct Fixture {
        files: FileStore,
        quota: QuotaTracker,
        events: EventLog,
        store: Store,
    }

    async fn create_fixture(limit: u64, chunk_size: usize) -> Fixture {
        let store = Store::memory();
        let clock = Arc::new(MonotonicClock::default());
        let quota = QuotaTracker::new(store.clone(), limit);
        let events = EventLog::new(store.clone(), clock.clone(), ChangeNotifier::new());
        quota.ensure("alice").await.unwrap();
        let files = FileStore::new(store.clone(), quota.clone(), events.clone(), clock, chunk_size);
        Fixture {
            files,
            quota,
            events,
            store,
        }
    }

    async fn used(fixture: &Fixture) -> u64 {
        fixture.quota.get("alice").await.unwrap().unwrap().storage_used
    }

    #[tokio::test]
    async fn test_write_then_read_across_chunks() {
        let fx = create_fixture(1_000_000, 4).await;
        let content = Bytes::from_static(b"hello chunked world");

        let outcome = fx.files.write_file("/a.txt", content.clone(), "alice").await.unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.record.chunk_count, 5);
        assert_eq!(outcome.record.content_type, "text/plain");
        assert_eq!(outcome.record.content_hash.len(), 64);

        let (read, record) = fx.files.read_file("/a.txt").await.unwrap().unwrap();
        assert_eq!(read, content);
        assert_eq!(record, outcome.record);
    }

    #[tokio::test]
    async fn test_empty_file_has_no_chunks() {
        let fx = create_fixture(1_000, 4).await;
        let outcome = fx.files.write_file("/empty", Bytes::new(), "alice").await.unwrap();
        assert_eq!(outcome.record.chunk_count, 0);
        let (read, _) = fx.files.read_file("/empty").await.unwrap().unwrap();
        assert!(read.is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_same_content_changes_etag_and_quota_delta() {
        let fx = create_fixture(1_000, 4).await;
        let first = fx.files.write_file("/a", Bytes::from_static(b"abcdef"), "alice").await.unwrap();
        let second = fx.files.write_file("/a", Bytes::from_static(b"abcdef"), "alice").await.unwrap();

        assert!(!second.created);
        assert_eq!(first.record.content_hash, second.record.content_hash);
        assert_ne!(first.record.etag(), second.record.etag());
        assert_eq!(used(&fx).await, 6);

        fx.files.write_file("/a", Bytes::from_static(b"ab"), "alice").await.unwrap();
        assert_eq!(used(&fx).await, 2);
    }

    #[tokio::test]
    async fn test_overwrite_removes_previous_chunks() {
        let fx = create_fixture(1_000, 2).await;
        fx.files.write_file("/a", Bytes::from_static(b"abcdef"), "alice").await.unwrap();
        fx.files.write_file("/a", Bytes::from_static(b"xy"), "alice").await.unwrap();

        let blobs = fx.store.scan_keys(Table::Blobs, "").await.unwrap();
        assert_eq!(blobs.len(), 1);
    }

    #[tokio::test]
    async fn test_quota_rejects_before_any_chunk() {
        let fx = create_fixture(5, 2).await;
        let err = fx
            .files
            .write_file("/big", Bytes::from_static(b"too large"), "alice")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 413);
        assert!(fx.store.scan_keys(Table::Blobs, "").await.unwrap().is_empty());
        assert!(fx.files.metadata("/big").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_owner_cannot_write() {
        let fx = create_fixture(1_000, 2).await;
        let err = fx
            .files
            .write_file("/x", Bytes::from_static(b"a"), "mallory")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 413);
    }

    #[tokio::test]
    async fn test_delete_missing_returns_false() {
        let fx = create_fixture(1_000, 2).await;
        assert!(!fx.files.delete_file("/nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_releases_quota_and_logs_events() {
        let fx = create_fixture(1_000, 2).await;
        fx.files.write_file("/a", Bytes::from_static(b"abcd"), "alice").await.unwrap();
        assert!(fx.files.delete_file("/a").await.unwrap());

        assert_eq!(used(&fx).await, 0);
        assert!(fx.files.read_file("/a").await.unwrap().is_none());
        assert!(fx.store.scan_keys(Table::Blobs, "").await.unwrap().is_empty());

        let page = fx
            .events
            .list(&EventQuery {
                limit: 10,
                ..EventQuery::default()
            })
            .await
            .unwrap();
        let ops: Vec<_> = page.events.iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec![Operation::Put, Operation::Delete]);
    }

    #[tokio::test]
    async fn test_missing_chunk_is_internal_error() {
        let fx = create_fixture(1_000, 2).await;
        let outcome = fx.files.write_file("/a", Bytes::from_static(b"abcd"), "alice").await.unwrap();
        fx.store
            .remove(Table::Blobs, &chunk_key(outcome.record.timestamp, 1))
            .await
            .unwrap();
        let err = fx.files.read_file("/a").await.unwrap_err();
        assert_eq!(err.status_code(), 500);
    }
}
