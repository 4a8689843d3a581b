pub mod api;
pub mod capture;
pub mod history;
pub mod settings;
pub mod store;
pub mod telemetry;

use std::{future::Future, sync::Arc};

use anyhow::{Context, Result};
use log::{error, info, warn};

use api::{ApiHandle, AppState};
use capture::{CaptureConfig, CaptureController, CaptureError};
use history::SessionArchive;
use settings::{ServerConfig, SettingsStore, StoreBackend};
use store::{MemoryStore, SharedStore, SqliteStore};

pub async fn run() -> Result<()> {
    let config = ServerConfig::from_env()?;

    // RUST_LOG, when set, takes precedence over the default level.
    let level = if config.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    info!("wattlog starting up...");

    serve(config, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {err}");
        }
    })
    .await
}

/// Runs the service until `shutdown` resolves, then stops any active
/// capture so its session is finalized.
pub async fn serve<F>(config: ServerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("Failed to create data directory {}", config.data_dir.display())
    })?;

    let store = open_store(&config)?;
    let settings = Arc::new(SettingsStore::new(config.settings_path())?);
    let interval = settings.capture().interval_seconds;

    let capture = CaptureController::new(Arc::clone(&store), interval, CaptureConfig::default());
    let archive = SessionArchive::new(Arc::clone(&store), capture.clone());

    // Finalize sessions that were running when the process last died.
    let recovered = archive
        .recover_unfinished()
        .await
        .context("Failed to recover unfinished sessions")?;
    if !recovered.is_empty() {
        warn!("Finalized {} unfinished session(s) from a previous run", recovered.len());
    }

    let state = AppState {
        capture: capture.clone(),
        archive,
        settings,
    };
    let api = ApiHandle::spawn(config.bind, state).await?;

    shutdown.await;
    info!("Shutting down...");

    match capture.stop().await {
        Ok(stopped) => info!(
            "Finalized session {} with {} records on shutdown",
            stopped.session_id, stopped.record_count
        ),
        Err(CaptureError::NotActive) => {}
        Err(err) => error!("Failed to stop capture on shutdown: {err}"),
    }

    api.shutdown().await
}

fn open_store(config: &ServerConfig) -> Result<SharedStore> {
    let store: SharedStore = match config.store {
        StoreBackend::Sqlite => Arc::new(SqliteStore::new(config.store_path())?),
        StoreBackend::Memory => {
            warn!("Using the in-memory store; captured sessions will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}
