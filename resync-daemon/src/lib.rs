//! resync daemon - watches cached files and re-uploads the ones the user edits.
//!
//! Events flow leaves first:
//!
//! ```text
//! notify ─→ WatchTree ─→ ChangeFilter ─→ UpdateTracker ─→ UploadPipeline
//!                                              ↑                │
//!                                              └── UploadEvent ─┘
//! ```

pub mod config;
pub mod filter;
pub mod monitor;
pub mod tracker;
pub mod watcher;

use std::future::Future;
use std::sync::Arc;

use resync_core::{CatalogFile, JsonTaskStore, LocalUploader, upload_events};

pub use config::{AccountConfig, DaemonConfig};
pub use filter::{ChangeFilter, DownloadMarkers, FilterSettings};
pub use monitor::{Monitor, spawn_upload_event_pump};
pub use tracker::UpdateTracker;
pub use watcher::{DirSubscriber, NotifySubscriber, RawEvent, RawKind, WatchTree};

/// Daemon error types.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// File watcher error.
    #[error("watcher error: {0}")]
    WatcherError(#[from] notify::Error),

    /// Configuration error.
    #[error("config error: {0}")]
    ConfigError(String),

    /// Core operation failed (catalog, task store, uploader).
    #[error("core error: {0:#}")]
    CoreError(#[from] anyhow::Error),

    /// IO error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Run the daemon until `shutdown` resolves.
///
/// Uploads go to the directory tree at `config.remote_root`; the durable task
/// queue lives in `config.state_dir`.
pub async fn run_daemon(
    config: DaemonConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<(), DaemonError> {
    config.validate()?;

    let catalog = Arc::new(CatalogFile::load(&config.catalog_path)?);
    let store = Arc::new(JsonTaskStore::new(config.task_store_path()));
    let tracker = Arc::new(UpdateTracker::new(catalog, store));
    log::info!("Restored {} pending uploads", tracker.restore());

    let (events_tx, events_rx) = upload_events();
    let pump = spawn_upload_event_pump(Arc::clone(&tracker), events_rx);

    let mut monitor = Monitor::new(config.filter_settings(), Arc::clone(&tracker));
    monitor.start(
        config
            .accounts
            .iter()
            .map(|a| (a.account(), a.cache_dir.clone()))
            .collect::<Vec<_>>(),
    )
    .await?;

    let uploader = LocalUploader::new(&config.remote_root, events_tx);
    tracker.on_pipeline_connected(Arc::new(uploader));

    shutdown.await;
    log::info!("Shutting down");

    monitor.shutdown().await;
    tracker.on_pipeline_disconnected();
    pump.abort();
    Ok(())
}
