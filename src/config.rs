//! Server configuration.
//!
//! Configuration is read from `~/.hengdang/config.toml` (or `--config`),
//! then overridden from the environment:
//!
//! | variable | field |
//! |---|---|
//! | `PORT` | `server.port` |
//! | `HOST` | `server.host` |
//! | `PUBLIC_URL` | `server.public_url` |
//! | `DATA_DIR` | `storage.data_dir` |
//! | `MAX_FILE_SIZE` | `storage.max_file_size` |
//! | `OWNER_PUBKEY_HEX` | `auth.owner` |
//! | `ADMIN_KEY` | `admin.key` |
//!
//! A missing config file is not an error; every field has a default.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants;
use crate::daemon::paths;

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Non-fatal warnings that should be logged but don't prevent operation.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are any warnings.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub listing: ListingConfig,
    pub locks: LockConfig,
    pub sessions: SessionConfig,
    pub quota: QuotaConfig,
    pub auth: AuthConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base URL identity assertions must name. Derived from `Host` when unset.
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: constants::DEFAULT_HOST.to_string(),
            port: constants::DEFAULT_PORT,
            public_url: None,
        }
    }
}

/// Which store backend to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Redb,
    Memory,
}

/// Content storage settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
    pub backend: StoreKind,
    pub chunk_size: usize,
    pub max_file_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            backend: StoreKind::Redb,
            chunk_size: constants::CHUNK_SIZE,
            max_file_size: constants::DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Directory listing page sizes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            default_limit: constants::DEFAULT_LIST_LIMIT,
            max_limit: constants::MAX_LIST_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: constants::LOCK_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: constants::SESSION_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub default_storage_limit: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_storage_limit: constants::DEFAULT_STORAGE_LIMIT,
        }
    }
}

/// Identity assertion settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Hex public key of the identity that owns this server.
    pub owner: Option<String>,
    /// Accept assertions without a verified signature. Development only.
    pub allow_unsigned: bool,
    pub max_assertion_age_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            owner: None,
            allow_unsigned: false,
            max_assertion_age_secs: constants::AUTH_ASSERTION_MAX_AGE_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl Config {
    /// Load configuration from `path`, or from the default location.
    ///
    /// The default location may be absent, in which case defaults apply.
    /// An explicitly named file must exist. Environment overrides are
    /// applied in both cases.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an
    /// environment override has an invalid value.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => {
                let default_path = paths::get_config_path()?;
                if default_path.exists() {
                    Self::load_from(&default_path)?
                } else {
                    Self::default()
                }
            },
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Load configuration from the specified TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read (IO error)
    /// - The file contains invalid TOML syntax
    /// - Fields have invalid types
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply environment overrides read through `var`.
    ///
    /// Empty values are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if `PORT` or `MAX_FILE_SIZE` is not a number.
    pub fn apply_env_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| var(name).filter(|v| !v.is_empty());

        if let Some(port) = var("PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid PORT value: {port}"))?;
        }
        if let Some(host) = var("HOST") {
            self.server.host = host;
        }
        if let Some(url) = var("PUBLIC_URL") {
            self.server.public_url = Some(url);
        }
        if let Some(dir) = var("DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(size) = var("MAX_FILE_SIZE") {
            self.storage.max_file_size = size
                .parse()
                .with_context(|| format!("Invalid MAX_FILE_SIZE value: {size}"))?;
        }
        if let Some(owner) = var("OWNER_PUBKEY_HEX") {
            self.auth.owner = Some(owner);
        }
        if let Some(key) = var("ADMIN_KEY") {
            self.admin.key = Some(key);
        }
        Ok(())
    }

    /// Resolve the data directory, falling back to `~/.hengdang/data/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => paths::get_data_dir(),
        }
    }

    /// Validate configuration.
    ///
    /// Returns a `ValidationResult` containing any non-fatal warnings.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails with one or more errors:
    /// - Port 0
    /// - Zero chunk size or zero max file size
    /// - Listing limits out of range
    pub fn validate(&self) -> Result<ValidationResult> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            errors.push(
                "Server port cannot be 0. Use a valid port number (1-65535)\n  \
                 Common ports: 3000 (default), 8080, 8000"
                    .to_string(),
            );
        } else if self.server.port < 1024 {
            warnings.push(format!(
                "Server port {} is a system/privileged port (< 1024)\n  \
                 Recommendation: Use ports >= 1024 (e.g., 3000, 8080) to avoid permission issues",
                self.server.port
            ));
        }

        if self.storage.chunk_size == 0 {
            errors.push("storage.chunk_size cannot be 0".to_string());
        }
        if self.storage.max_file_size == 0 {
            errors.push("storage.max_file_size cannot be 0".to_string());
        }

        if self.listing.default_limit == 0 {
            errors.push("listing.default_limit cannot be 0".to_string());
        }
        if self.listing.max_limit > constants::MAX_LIST_LIMIT {
            errors.push(format!(
                "listing.max_limit {} exceeds the hard cap of {}",
                self.listing.max_limit,
                constants::MAX_LIST_LIMIT
            ));
        }
        if self.listing.max_limit < self.listing.default_limit {
            errors.push(format!(
                "listing.max_limit ({}) must be >= listing.default_limit ({})",
                self.listing.max_limit, self.listing.default_limit
            ));
        }

        if self.locks.ttl_secs == 0 {
            errors.push("locks.ttl_secs cannot be 0".to_string());
        }
        if self.sessions.ttl_secs == 0 {
            errors.push("sessions.ttl_secs cannot be 0".to_string());
        }
        if self.quota.default_storage_limit > constants::MAX_STORAGE_LIMIT {
            errors.push("quota.default_storage_limit cannot exceed 1 TiB".to_string());
        }

        if self.auth.owner.as_deref().is_none_or(str::is_empty) {
            warnings.push(
                "No owner identity configured (auth.owner / OWNER_PUBKEY_HEX)\n  \
                 Only identities provisioned by an administrator can sign in"
                    .to_string(),
            );
        }
        if self.admin.key.as_deref().is_none_or(str::is_empty) {
            warnings.push("No admin key configured; /admin endpoints are disabled".to_string());
        }
        if self.auth.allow_unsigned {
            warnings.push(
                "auth.allow_unsigned is enabled: identity assertions are NOT signature-checked\n  \
                 Never enable this on a reachable server"
                    .to_string(),
            );
        }

        if !errors.is_empty() {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }

        Ok(ValidationResult { warnings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, constants::DEFAULT_PORT);
        assert_eq!(config.storage.backend, StoreKind::Redb);
        assert_eq!(config.storage.chunk_size, constants::CHUNK_SIZE);
        assert_eq!(config.listing.max_limit, 1000);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[server]
port = 8080

[storage]
backend = "memory"

[auth]
owner = "abcd"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.storage.backend, StoreKind::Memory);
        assert_eq!(config.auth.owner.as_deref(), Some("abcd"));
        assert_eq!(config.locks.ttl_secs, constants::LOCK_TTL_SECS);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PORT", "4000"),
            ("DATA_DIR", "/srv/hengdang"),
            ("ADMIN_KEY", "secret"),
            ("HOST", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env_overrides(|name| env.get(name).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.data_dir().unwrap(), PathBuf::from("/srv/hengdang"));
        assert_eq!(config.admin.key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_env_override_rejects_bad_port() {
        let mut config = Config::default();
        let result = config.apply_env_overrides(|name| (name == "PORT").then(|| "http".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_port_zero() {
        let mut config = Config::default();
        config.server.port = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("port cannot be 0"));
    }

    #[test]
    fn test_validate_listing_limits() {
        let mut config = Config::default();
        config.listing.default_limit = 500;
        config.listing.max_limit = 100;
        assert!(config.validate().is_err());

        config.listing.max_limit = 5000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = Config::default();
        config.auth.allow_unsigned = true;
        let result = config.validate().unwrap();
        assert!(result.has_warnings());
        assert!(result.warnings.iter().any(|w| w.contains("allow_unsigned")));
        assert!(result.warnings.iter().any(|w| w.contains("admin key")));
    }

    #[test]
    fn test_load_from_missing_file_fails() {
        let result = Config::load_from("/nonexistent/hengdang.toml");
        assert!(result.is_err());
    }
}
