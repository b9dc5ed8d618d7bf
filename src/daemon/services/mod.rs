//! Storage engine components.
//!
//! Leaves first: `path` rules and the shared `clock`, then the stores that
//! build on the ordered key-value [`Store`](crate::daemon::store::Store):
//! file content and metadata, the directory namespace, path locks, the
//! event log with its live notifier, sessions and quota accounting.

pub mod clock;
pub mod conditional;
pub mod directories;
pub mod events;
pub mod files;
pub mod locks;
pub mod path;
pub mod quota;
pub mod sessions;
