//! Table names and range queries shared by every store backend.

use std::ops::Bound;

/// Logical tables of the store.
///
/// Every table maps UTF-8 keys to opaque byte values and keeps its keys in
/// lexicographic order, which is what prefix scans rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// File path → `FileRecord` (JSON).
    Files,
    /// Directory path → `DirectoryRecord` (JSON).
    Directories,
    /// `{file_id}:{index}` → raw chunk bytes.
    Blobs,
    /// Zero-padded timestamp → `Event` (JSON).
    Events,
    /// Session id → `Session` (JSON).
    Sessions,
    /// Path → `FileLock` (JSON).
    Locks,
    /// Owner identity → `QuotaRecord` (JSON).
    Quotas,
}

impl Table {
    /// All tables, in initialization order.
    pub const ALL: [Table; 7] = [
        Table::Files,
        Table::Directories,
        Table::Blobs,
        Table::Events,
        Table::Sessions,
        Table::Locks,
        Table::Quotas,
    ];

    /// Stable on-disk name of the table.
    pub fn name(self) -> &'static str {
        match self {
            Table::Files => "files",
            Table::Directories => "directories",
            Table::Blobs => "blobs",
            Table::Events => "events",
            Table::Sessions => "sessions",
            Table::Locks => "locks",
            Table::Quotas => "quotas",
        }
    }
}

/// An ordered scan over the keys sharing `prefix`.
///
/// Forward scans return keys strictly greater than `start_after` in
/// ascending order; reverse scans return keys strictly smaller than
/// `start_after` in descending order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeQuery {
    pub prefix: String,
    pub start_after: Option<String>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl RangeQuery {
    /// Scan every key starting with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Resume after (or, in reverse, before) `cursor`.
    #[must_use]
    pub fn after(mut self, cursor: Option<String>) -> Self {
        self.start_after = cursor;
        self
    }

    #[must_use]
    pub fn reversed(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Key bounds covering this query, or `None` when the range is empty.
    ///
    /// The lower bound is never `Unbounded`, and `Excluded` bounds never
    /// coincide, so the result is safe for `BTreeMap::range`.
    pub(crate) fn bounds(&self) -> Option<(Bound<String>, Bound<String>)> {
        let prefix_end = prefix_successor(&self.prefix);
        let prefix_upper = || prefix_end.clone().map_or(Bound::Unbounded, Bound::Excluded);

        let (lower, upper) = match (&self.start_after, self.reverse) {
            (Some(cursor), false) if cursor.as_str() >= self.prefix.as_str() => {
                (Bound::Excluded(cursor.clone()), prefix_upper())
            },
            (Some(cursor), true) => {
                let upper = match &prefix_end {
                    Some(end) if end < cursor => Bound::Excluded(end.clone()),
                    _ => Bound::Excluded(cursor.clone()),
                };
                (Bound::Included(self.prefix.clone()), upper)
            },
            _ => (Bound::Included(self.prefix.clone()), prefix_upper()),
        };

        if let (Bound::Included(low) | Bound::Excluded(low), Bound::Excluded(high)) = (&lower, &upper)
            && low >= high
        {
            return None;
        }
        Some((lower, upper))
    }
}

/// Smallest string greater than every string starting with `prefix`.
///
/// Returns `None` when no such string exists (empty prefix, or a prefix made
/// only of `char::MAX`).
fn prefix_successor(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let mut next = last as u32 + 1;
        // Skip the surrogate block, which `char` cannot represent.
        if (0xD800..=0xDFFF).contains(&next) {
            next = 0xE000;
        }
        if let Some(c) = char::from_u32(next) {
            chars.push(c);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor("/a/"), Some("/a0".to_string()));
        assert_eq!(prefix_successor("/"), Some("0".to_string()));
        assert_eq!(prefix_successor(""), None);
        assert_eq!(prefix_successor("a\u{10FFFF}"), Some("b".to_string()));
    }

    #[test]
    fn test_forward_bounds() {
        let query = RangeQuery::prefix("/a/");
        assert_eq!(
            query.bounds(),
            Some((
                Bound::Included("/a/".to_string()),
                Bound::Excluded("/a0".to_string())
            ))
        );

        let query = RangeQuery::prefix("/a/").after(Some("/a/m".to_string()));
        assert_eq!(query.bounds().unwrap().0, Bound::Excluded("/a/m".to_string()));

        // A cursor before the prefix does not widen the scan.
        let query = RangeQuery::prefix("/a/").after(Some("/".to_string()));
        assert_eq!(query.bounds().unwrap().0, Bound::Included("/a/".to_string()));
    }

    #[test]
    fn test_reverse_bounds() {
        let query = RangeQuery::prefix("/a/")
            .after(Some("/a/m".to_string()))
            .reversed(true);
        assert_eq!(
            query.bounds(),
            Some((
                Bound::Included("/a/".to_string()),
                Bound::Excluded("/a/m".to_string())
            ))
        );

        let query = RangeQuery::prefix("/a/")
            .after(Some("/z".to_string()))
            .reversed(true);
        assert_eq!(query.bounds().unwrap().1, Bound::Excluded("/a0".to_string()));
    }

    #[test]
    fn test_empty_ranges() {
        assert!(
            RangeQuery::prefix("/a/")
                .after(Some("/b".to_string()))
                .bounds()
                .is_none()
        );
        assert!(
            RangeQuery::prefix("/a/")
                .after(Some("/a/".to_string()))
                .reversed(true)
                .bounds()
                .is_none()
        );
    }
}
