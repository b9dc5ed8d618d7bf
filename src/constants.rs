//! Fixed limits and defaults shared across the server.

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default bind address.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Size of one content chunk (512 KiB).
pub const CHUNK_SIZE: usize = 512 * 1024;

/// Default maximum accepted upload body (100 MiB).
pub const DEFAULT_MAX_FILE_SIZE: usize = 100 * 1024 * 1024;

/// Directory listing page size when the client does not ask for one.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Hard upper bound on any listing page.
pub const MAX_LIST_LIMIT: usize = 1000;

/// Event log page size when the client does not ask for one.
pub const DEFAULT_EVENT_LIMIT: usize = 50;

/// Maximum accepted path length in bytes.
pub const MAX_PATH_LENGTH: usize = 4096;

/// Lifetime of a path lock (30 minutes).
pub const LOCK_TTL_SECS: u64 = 30 * 60;

/// Lifetime of a session (7 days).
pub const SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Storage limit granted to a freshly provisioned identity (1 GiB).
pub const DEFAULT_STORAGE_LIMIT: u64 = 1024 * 1024 * 1024;

/// Largest storage limit an administrator may assign (1 TiB).
pub const MAX_STORAGE_LIMIT: u64 = 1024 * 1024 * 1024 * 1024;

/// Cookie carrying the session id.
pub const SESSION_COOKIE: &str = "hengdang_session";

/// Header carrying the administrator key.
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Event kind required on identity assertions (HTTP auth event).
pub const AUTH_ASSERTION_KIND: u32 = 27235;

/// Maximum age of an identity assertion.
pub const AUTH_ASSERTION_MAX_AGE_SECS: u64 = 3600;

/// Buffered change events per live subscriber before events are dropped.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// Keys fetched per range request when walking a prefix.
pub const SCAN_PAGE_SIZE: usize = 256;

/// Window used for "active user" statistics (30 days).
pub const ACTIVE_USER_WINDOW_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Window used for "recent events" statistics (24 hours).
pub const RECENT_EVENT_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;
