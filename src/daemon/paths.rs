//! Path utilities for hengdang data.
//!
//! - [`get_hengdang_dir`] - `~/.hengdang/` (base directory)
//! - [`get_config_path`] - `~/.hengdang/config.toml` (server settings)
//! - [`get_data_dir`] - `~/.hengdang/data/` (default storage directory)
//! - [`get_database_path`] - `<data_dir>/hengdang.redb` (the store)

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Get the hengdang base directory.
///
/// Resolution order:
/// 1. `HENGDANG_HOME` environment variable (if set)
/// 2. `~/.hengdang/` (default)
pub fn get_hengdang_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("HENGDANG_HOME")
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }

    let home = dirs::home_dir().context("Failed to get home directory")?;
    Ok(home.join(".hengdang"))
}

/// Get the server config path: `~/.hengdang/config.toml`
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_hengdang_dir()?.join("config.toml"))
}

/// Get the default data directory: `~/.hengdang/data/`
pub fn get_data_dir() -> Result<PathBuf> {
    Ok(get_hengdang_dir()?.join("data"))
}

/// Get the database file inside a data directory.
pub fn get_database_path(data_dir: &Path) -> PathBuf {
    data_dir.join("hengdang.redb")
}
