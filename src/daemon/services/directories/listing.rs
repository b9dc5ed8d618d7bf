//! Directory listing by prefix range scans.
//!
//! Directories are listed before files. A cursor ending in `/` resumes
//! inside the directory group, any other cursor inside the file group.
//!
//! Shallow listings collapse every key beneath the listed directory to its
//! first path segment. Descendants of a child directory sort contiguously,
//! so once a child is emitted the scan jumps past its subtree instead of
//! reading it.

use serde::Serialize;

use super::{DirectoryRecord, DirectoryStore};
use crate::constants::SCAN_PAGE_SIZE;
use crate::daemon::services::files::FileRecord;
use crate::daemon::services::path::directory_key;
use crate::daemon::store::{RangeQuery, Store, Table};
use crate::error::{Error, Result};

/// Sorts after every character a path may contain.
const SUBTREE_END: char = char::MAX;

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub limit: usize,
    pub cursor: Option<String>,
    pub reverse: bool,
    pub shallow: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            limit: crate::constants::DEFAULT_LIST_LIMIT,
            cursor: None,
            reverse: false,
            shallow: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
}

impl ListingEntry {
    fn directory(path: String, record: Option<&DirectoryRecord>) -> Self {
        Self {
            path,
            kind: EntryType::Directory,
            size: None,
            content_type: None,
            last_modified: record.map(|r| r.modified),
        }
    }

    fn file(record: FileRecord) -> Self {
        Self {
            path: record.path,
            kind: EntryType::File,
            size: Some(record.content_length),
            content_type: Some(record.content_type),
            last_modified: Some(record.timestamp),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub entries: Vec<ListingEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// One key beneath the listed directory after collapsing.
enum Child {
    /// A child directory key (trailing slash).
    Directory(String),
    /// An immediate entry with its stored value.
    Leaf(String, Vec<u8>),
}

fn collapse(prefix: &str, key: String, value: Vec<u8>) -> Option<Child> {
    let rest = key.get(prefix.len()..)?;
    if rest.is_empty() {
        return None;
    }
    match rest.find('/') {
        Some(idx) => Some(Child::Directory(format!("{prefix}{}", &rest[..=idx]))),
        None => Some(Child::Leaf(key, value)),
    }
}

/// Cursor that resumes a scan just past the subtree of directory `dir`.
fn skip_subtree(dir: &str, reverse: bool) -> String {
    if reverse {
        dir.to_string()
    } else {
        format!("{dir}{SUBTREE_END}")
    }
}

/// Which collapsed children a scan keeps.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Want {
    Directories,
    Leaves,
}

/// Scan `table` beneath `prefix` and return up to `want_count` collapsed
/// children of one kind, in scan order.
async fn scan_children(
    store: &Store,
    table: Table,
    prefix: &str,
    mut cursor: Option<String>,
    reverse: bool,
    want: Want,
    want_count: usize,
) -> Result<Vec<Child>> {
    let mut out = Vec::new();
    loop {
        let query = RangeQuery::prefix(prefix)
            .after(cursor.clone())
            .reversed(reverse)
            .limit(SCAN_PAGE_SIZE);
        let batch = store.range(table, query).await?;
        let exhausted = batch.len() < SCAN_PAGE_SIZE;
        let last_key = batch.last().map(|(key, _)| key.clone());

        // Child directory whose subtree is still being passed over.
        let mut open_dir: Option<String> = None;
        for (key, value) in batch {
            if open_dir.as_ref().is_some_and(|dir| key.starts_with(dir.as_str())) {
                continue;
            }
            open_dir = None;
            match collapse(prefix, key, value) {
                Some(Child::Directory(dir)) => {
                    open_dir = Some(dir.clone());
                    if want == Want::Directories {
                        out.push(Child::Directory(dir));
                    }
                },
                Some(leaf @ Child::Leaf(..)) if want == Want::Leaves => out.push(leaf),
                _ => {},
            }
            if out.len() >= want_count {
                return Ok(out);
            }
        }

        if exhausted {
            return Ok(out);
        }
        cursor = match (open_dir, last_key) {
            (Some(dir), _) => Some(skip_subtree(&dir, reverse)),
            (None, last) => last,
        };
    }
}

/// Directory keys in scan order, merged from both tables and deduplicated.
fn merge_directories(a: Vec<Child>, b: Vec<Child>, reverse: bool, limit: usize) -> Vec<String> {
    let mut keys: Vec<String> = a
        .into_iter()
        .chain(b)
        .filter_map(|child| match child {
            Child::Directory(dir) => Some(dir),
            Child::Leaf(..) => None,
        })
        .collect();
    keys.sort();
    keys.dedup();
    if reverse {
        keys.reverse();
    }
    keys.truncate(limit);
    keys
}

impl DirectoryStore {
    /// List the directory at `path` on behalf of `caller`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the directory does not exist
    /// - [`Error::Forbidden`] if `caller` does not own it
    pub async fn list(&self, path: &str, options: &ListOptions, caller: &str) -> Result<Listing> {
        let key = directory_key(path);
        let Some(record) = self.get(&key).await? else {
            return Err(Error::not_found(format!("Directory not found: {key}")));
        };
        if record.owner != caller {
            return Err(Error::forbidden(format!("Not the owner of {key}")));
        }

        let want = options.limit.saturating_add(1);
        let (dir_cursor, file_cursor, in_files) = match &options.cursor {
            Some(c) if c.ends_with('/') => (Some(c.clone()), None, false),
            Some(c) => (None, Some(c.clone()), true),
            None => (None, None, false),
        };

        let mut entries = Vec::new();
        if !in_files {
            let directories = if options.shallow {
                self.shallow_directories(&key, dir_cursor, options.reverse, want).await?
            } else {
                self.deep_directories(&key, dir_cursor, options.reverse, want).await?
            };
            entries.extend(directories);
        }
        if entries.len() < want {
            let remaining = want - entries.len();
            let files = if options.shallow {
                self.shallow_files(&key, file_cursor, options.reverse, remaining).await?
            } else {
                self.deep_files(&key, file_cursor, options.reverse, remaining).await?
            };
            entries.extend(files);
        }

        let has_more = entries.len() > options.limit;
        entries.truncate(options.limit);
        let next_cursor = if has_more {
            entries.last().map(|e| e.path.clone())
        } else {
            None
        };
        Ok(Listing {
            entries,
            next_cursor,
            has_more,
        })
    }

    async fn shallow_directories(
        &self,
        prefix: &str,
        cursor: Option<String>,
        reverse: bool,
        want: usize,
    ) -> Result<Vec<ListingEntry>> {
        let start = cursor.map(|c| skip_subtree(&c, reverse));
        let from_dirs = scan_children(
            &self.store,
            Table::Directories,
            prefix,
            start.clone(),
            reverse,
            Want::Directories,
            want,
        )
        .await?;
        let from_files = scan_children(
            &self.store,
            Table::Files,
            prefix,
            start,
            reverse,
            Want::Directories,
            want,
        )
        .await?;

        let mut entries = Vec::new();
        for dir in merge_directories(from_dirs, from_files, reverse, want) {
            let record = self.get(&dir).await?;
            entries.push(ListingEntry::directory(dir, record.as_ref()));
        }
        Ok(entries)
    }

    async fn shallow_files(
        &self,
        prefix: &str,
        cursor: Option<String>,
        reverse: bool,
        want: usize,
    ) -> Result<Vec<ListingEntry>> {
        scan_children(&self.store, Table::Files, prefix, cursor, reverse, Want::Leaves, want)
            .await?
            .into_iter()
            .filter_map(|child| match child {
                Child::Leaf(key, value) => Some((key, value)),
                Child::Directory(_) => None,
            })
            .map(|(key, value)| {
                let record: FileRecord = serde_json::from_slice(&value)
                    .map_err(|e| Error::Internal(anyhow::anyhow!("Corrupt file record '{key}': {e}")))?;
                Ok(ListingEntry::file(record))
            })
            .collect()
    }

    async fn deep_directories(
        &self,
        prefix: &str,
        cursor: Option<String>,
        reverse: bool,
        want: usize,
    ) -> Result<Vec<ListingEntry>> {
        // In forward order the listed directory's own record comes first.
        let query = RangeQuery::prefix(prefix)
            .after(cursor.or_else(|| (!reverse).then(|| prefix.to_string())))
            .reversed(reverse)
            .limit(want.saturating_add(1));
        Ok(self
            .store
            .range_json::<DirectoryRecord>(Table::Directories, query)
            .await?
            .into_iter()
            .filter(|(key, _)| key != prefix)
            .take(want)
            .map(|(key, record)| ListingEntry::directory(key, Some(&record)))
            .collect())
    }

    async fn deep_files(
        &self,
        prefix: &str,
        cursor: Option<String>,
        reverse: bool,
        want: usize,
    ) -> Result<Vec<ListingEntry>> {
        let query = RangeQuery::prefix(prefix)
            .after(cursor)
            .reversed(reverse)
            .limit(want);
        Ok(self
            .store
            .range_json::<FileRecord>(Table::Files, query)
            .await?
            .into_iter()
            .map(|(_, record)| ListingEntry::file(record))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::services::clock::MonotonicClock;
    use crate::daemon::services::directories::DirectoryAttributes;
    use crate::daemon::services::events::{ChangeNotifier, EventLog};
    use proptest::prelude::*;
    use std::sync::Arc;

    async fn create_dirs() -> (DirectoryStore, Store) {
        let store = Store::memory();
        let events = EventLog::new(
            store.clone(),
            Arc::new(MonotonicClock::default()),
            ChangeNotifier::new(),
        );
        let dirs = DirectoryStore::new(store.clone(), events);
        dirs.ensure_root("alice").await.unwrap();
        (dirs, store)
    }

    async fn put_file(store: &Store, path: &str) {
        let record = FileRecord {
            path: path.to_string(),
            content_hash: "00".into(),
            content_type: "text/plain".into(),
            content_length: 1,
            timestamp: 1,
            chunk_count: 1,
            owner: "alice".into(),
        };
        store.put_json(Table::Files, path, &record).await.unwrap();
    }

    fn paths(listing: &Listing) -> Vec<&str> {
        listing.entries.iter().map(|e| e.path.as_str()).collect()
    }

    fn options(limit: usize, shallow: bool) -> ListOptions {
        ListOptions {
            limit,
            shallow,
            ..ListOptions::default()
        }
    }

    #[tokio::test]
    async fn test_shallow_collapses_and_deep_does_not() {
        let (dirs, store) = create_dirs().await;
        dirs.create("/a/", "alice", DirectoryAttributes::default()).await.unwrap();
        put_file(&store, "/a/b.txt").await;
        put_file(&store, "/a/c/d.txt").await;

        let shallow = dirs.list("/a/", &options(100, true), "alice").await.unwrap();
        assert_eq!(paths(&shallow), vec!["/a/c/", "/a/b.txt"]);
        assert_eq!(shallow.entries[0].kind, EntryType::Directory);
        assert_eq!(shallow.entries[0].last_modified, None);
        assert!(!shallow.has_more);

        let deep = dirs.list("/a/", &options(100, false), "alice").await.unwrap();
        assert_eq!(paths(&deep), vec!["/a/b.txt", "/a/c/d.txt"]);
    }

    #[tokio::test]
    async fn test_deep_includes_explicit_directories() {
        let (dirs, store) = create_dirs().await;
        dirs.create("/a/", "alice", DirectoryAttributes::default()).await.unwrap();
        dirs.create("/a/c/", "alice", DirectoryAttributes::default()).await.unwrap();
        put_file(&store, "/a/c/d.txt").await;

        let deep = dirs.list("/a", &options(100, false), "alice").await.unwrap();
        assert_eq!(paths(&deep), vec!["/a/c/", "/a/c/d.txt"]);
    }

    #[tokio::test]
    async fn test_shallow_pagination_crosses_groups() {
        let (dirs, store) = create_dirs().await;
        for dir in ["/x/", "/y/"] {
            dirs.create(dir, "alice", DirectoryAttributes::default()).await.unwrap();
        }
        put_file(&store, "/x/deep.txt").await;
        for file in ["/1.txt", "/2.txt", "/3.txt"] {
            put_file(&store, file).await;
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = dirs
                .list(
                    "/",
                    &ListOptions {
                        limit: 2,
                        cursor: cursor.clone(),
                        ..ListOptions::default()
                    },
                    "alice",
                )
                .await
                .unwrap();
            seen.extend(paths(&page).into_iter().map(String::from));
            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }
        assert_eq!(seen, vec!["/x/", "/y/", "/1.txt", "/2.txt", "/3.txt"]);
    }

    #[tokio::test]
    async fn test_reverse_flips_within_groups() {
        let (dirs, store) = create_dirs().await;
        dirs.create("/x/", "alice", DirectoryAttributes::default()).await.unwrap();
        dirs.create("/y/", "alice", DirectoryAttributes::default()).await.unwrap();
        put_file(&store, "/y/z/w.txt").await;
        put_file(&store, "/1.txt").await;
        put_file(&store, "/2.txt").await;

        let listing = dirs
            .list(
                "/",
                &ListOptions {
                    reverse: true,
                    ..ListOptions::default()
                },
                "alice",
            )
            .await
            .unwrap();
        assert_eq!(paths(&listing), vec!["/y/", "/x/", "/2.txt", "/1.txt"]);
    }

    #[tokio::test]
    async fn test_listing_access() {
        let (dirs, _) = create_dirs().await;
        assert_eq!(
            dirs.list("/missing/", &ListOptions::default(), "alice")
                .await
                .unwrap_err()
                .status_code(),
            404
        );
        assert_eq!(
            dirs.list("/", &ListOptions::default(), "bob")
                .await
                .unwrap_err()
                .status_code(),
            403
        );
    }

    #[tokio::test]
    async fn test_skip_subtree_spans_scan_pages() {
        let (dirs, store) = create_dirs().await;
        for i in 0..(SCAN_PAGE_SIZE + 10) {
            put_file(&store, &format!("/big/{i:05}.txt")).await;
        }
        put_file(&store, "/zeta.txt").await;

        let listing = dirs.list("/", &options(10, true), "alice").await.unwrap();
        assert_eq!(paths(&listing), vec!["/big/", "/zeta.txt"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_paging_is_duplicate_free(
            names in proptest::collection::btree_set("[a-c]{1,2}(/[a-c]{1,2}){0,2}", 1..20),
            limit in 1usize..5,
            reverse in any::<bool>(),
            shallow in any::<bool>(),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (dirs, store) = create_dirs().await;
                for name in &names {
                    put_file(&store, &format!("/{name}")).await;
                }
                let full_options = ListOptions { limit: 1000, cursor: None, reverse, shallow };
                let full = dirs.list("/", &full_options, "alice").await.unwrap();
                assert!(!full.has_more);

                let mut paged = Vec::new();
                let mut cursor = None;
                loop {
                    let page = dirs
                        .list("/", &ListOptions { limit, cursor: cursor.clone(), reverse, shallow }, "alice")
                        .await
                        .unwrap();
                    paged.extend(page.entries.iter().map(|e| e.path.clone()));
                    if !page.has_more {
                        break;
                    }
                    cursor = page.next_cursor;
                }
                let expected: Vec<String> = full.entries.iter().map(|e| e.path.clone()).collect();
                assert_eq!(paged, expected);
            });
        }
    }
}
