//! Path rules and helpers for the flat key space.
//!
//! File paths never end with `/`; directory keys always do. Both live in
//! separate tables but share one lexicographic ordering, which is what
//! lets prefix scans stand in for tree traversal.

use crate::constants::MAX_PATH_LENGTH;
use crate::error::{Error, Result};

/// Validate a request path.
///
/// # Errors
///
/// Returns [`Error::Validation`] if the path does not start with `/`,
/// contains `..`, contains control characters, has empty segments, or is
/// longer than 4096 bytes.
pub fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::validation("Path must start with /"));
    }
    if path.contains("..") {
        return Err(Error::validation("Path traversal not allowed"));
    }
    if path.chars().any(|c| c.is_ascii_control()) {
        return Err(Error::validation("Control characters not allowed in path"));
    }
    if path.len() > MAX_PATH_LENGTH {
        return Err(Error::validation(format!(
            "Path too long (max {MAX_PATH_LENGTH} characters)"
        )));
    }
    if path.contains("//") {
        return Err(Error::validation("Empty path segments not allowed"));
    }
    Ok(())
}

/// Directory key for `path`: the path with a trailing slash.
pub fn directory_key(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Parent directory key of a file path or directory key.
///
/// Returns `None` for the root.
///
/// ```
/// use hengdang::daemon::services::path::parent_directory;
///
/// assert_eq!(parent_directory("/a/b.txt").as_deref(), Some("/a/"));
/// assert_eq!(parent_directory("/a/b/").as_deref(), Some("/a/"));
/// assert_eq!(parent_directory("/a").as_deref(), Some("/"));
/// assert_eq!(parent_directory("/"), None);
/// ```
pub fn parent_directory(path: &str) -> Option<String> {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return None;
    }
    trimmed
        .rfind('/')
        .map(|idx| trimmed[..=idx].to_string())
}

/// Every ancestor directory key of `path`, root first.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = parent_directory(path);
    while let Some(dir) = current {
        current = parent_directory(&dir);
        out.push(dir);
    }
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_validate_accepts_normal_paths() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/docs/").is_ok());
        assert!(validate_path("/docs/readme.md").is_ok());
        assert!(validate_path("/a b/ü.txt").is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_paths() {
        for bad in ["docs", "/a/../b", "/a//b", "/a\u{7f}", "/a\nb", "/.."] {
            let err = validate_path(bad).unwrap_err();
            assert_eq!(err.status_code(), 400, "{bad:?} should be rejected");
        }
        let long = format!("/{}", "x".repeat(MAX_PATH_LENGTH));
        assert!(validate_path(&long).is_err());
    }

    #[test]
    fn test_directory_key() {
        assert_eq!(directory_key("/docs"), "/docs/");
        assert_eq!(directory_key("/docs/"), "/docs/");
        assert_eq!(directory_key("/"), "/");
    }

    #[test]
    fn test_ancestors_root_first() {
        assert_eq!(ancestors("/a/b/c.txt"), vec!["/", "/a/", "/a/b/"]);
        assert_eq!(ancestors("/a/b/"), vec!["/", "/a/"]);
        assert_eq!(ancestors("/x"), vec!["/"]);
        assert!(ancestors("/").is_empty());
    }

    proptest! {
        #[test]
        fn prop_valid_segments_are_accepted(segments in prop::collection::vec("[a-zA-Z0-9_-][a-zA-Z0-9_.-]{0,11}", 1..6)) {
            let path = format!("/{}", segments.join("/"));
            prop_assume!(!path.contains(".."));
            prop_assert!(validate_path(&path).is_ok());
        }

        #[test]
        fn prop_parent_is_a_prefix(segments in prop::collection::vec("[a-z]{1,8}", 1..6)) {
            let path = format!("/{}", segments.join("/"));
            let parent = parent_directory(&path).unwrap();
            prop_assert!(path.starts_with(&parent));
            prop_assert!(parent.ends_with('/'));
        }
    }
}
