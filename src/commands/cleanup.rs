//! Offline sweep of expired sessions and locks.

use anyhow::Result;
use std::path::Path;

use super::{init_logging, load_config};
use crate::daemon::engine::Engine;

/// Open the configured store, sweep it, and print the counts.
pub async fn execute(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    init_logging(config.logging.format);

    let engine = Engine::open(&config).await?;
    let report = engine.cleanup().await?;

    println!("Expired sessions removed: {}", report.expired_sessions);
    println!("Expired locks removed:    {}", report.expired_locks);
    Ok(())
}
