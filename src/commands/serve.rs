//! Run the HTTP file server.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::{init_logging, load_config};
use crate::daemon::engine::Engine;
use crate::daemon::http::{self, AppState};
use crate::utils::format_bytes;

/// Start the server and run until Ctrl+C or SIGTERM.
///
/// `port` and `data_dir` override the loaded configuration.
pub async fn execute(config_path: Option<&Path>, port: Option<u16>, data_dir: Option<PathBuf>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(dir) = data_dir {
        config.storage.data_dir = Some(dir);
    }
    init_logging(config.logging.format);

    let engine = Engine::open(&config).await?;
    let state = Arc::new(AppState::new(engine, &config));
    let app = http::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(
        %addr,
        owner = config.auth.owner.as_deref().unwrap_or("-"),
        max_file_size = %format_bytes(config.storage.max_file_size as u64),
        "Server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

/// Resolve when the process receives Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}
