//! CLI command implementations for hengdang.
//!
//! - [`serve`] - Run the HTTP file server
//! - [`cleanup`] - Sweep expired sessions and locks offline

pub mod cleanup;
pub mod serve;

use std::path::Path;

use anyhow::{Context, Result};

use crate::config::{Config, LogFormat};

/// Load and validate configuration, printing any warnings.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = Config::load(path).context("Failed to load configuration")?;
    let validation = config.validate().context("Invalid configuration")?;
    for warning in &validation.warnings {
        eprintln!("Warning: {warning}");
    }
    Ok(config)
}

/// Initialize stdout logging.
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_logging(format: LogFormat) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}
