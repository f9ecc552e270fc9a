//! Account-level supervision of change filters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs_err as fs;
use resync_core::{Account, UploadEventReceiver};
use tokio::task::JoinHandle;

use crate::DaemonError;
use crate::filter::{ChangeFilter, DownloadMarkers, FilterSettings};
use crate::tracker::UpdateTracker;

/// Runs one [`ChangeFilter`] per account and owns the download markers they share.
pub struct Monitor {
    settings: FilterSettings,
    markers: Arc<DownloadMarkers>,
    tracker: Arc<UpdateTracker>,
    filters: HashMap<Account, ChangeFilter>,
}

impl Monitor {
    pub fn new(settings: FilterSettings, tracker: Arc<UpdateTracker>) -> Self {
        Self {
            settings,
            markers: Arc::new(DownloadMarkers::new(settings.grace_window)),
            tracker,
            filters: HashMap::new(),
        }
    }

    /// Starts monitoring every `(account, cache root)` pair.
    pub async fn start(
        &mut self,
        accounts: impl IntoIterator<Item = (Account, PathBuf)>,
    ) -> Result<(), DaemonError> {
        for (account, root) in accounts {
            self.add_account(account, root).await?;
        }
        Ok(())
    }

    /// Starts monitoring `root` for `account`, creating the directory if needed.
    ///
    /// An account that is already monitored is restarted on the new root; the
    /// old filter has released its watches before the new one starts.
    pub async fn add_account(
        &mut self,
        account: Account,
        root: impl AsRef<Path>,
    ) -> Result<(), DaemonError> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;

        if let Some(previous) = self.filters.remove(&account) {
            log::info!("Restarting monitoring for {}", account);
            previous.shutdown().await;
        }
        let filter = ChangeFilter::start(
            account.clone(),
            root,
            self.settings,
            Arc::clone(&self.markers),
            Arc::clone(&self.tracker),
        )?;
        self.filters.insert(account, filter);
        Ok(())
    }

    /// Stops monitoring `account`. Returns whether it was monitored.
    pub fn remove_account(&mut self, account: &Account) -> bool {
        match self.filters.remove(account) {
            Some(mut filter) => {
                filter.stop();
                log::info!("Removed {} from monitoring", account);
                true
            }
            None => false,
        }
    }

    /// Stops every account filter without waiting for them.
    pub fn stop(&mut self) {
        for (_, mut filter) in self.filters.drain() {
            filter.stop();
        }
    }

    /// Stops every account filter and waits until their watches are released.
    pub async fn shutdown(&mut self) {
        let filters: Vec<_> = self.filters.drain().map(|(_, f)| f).collect();
        futures::future::join_all(filters.into_iter().map(ChangeFilter::shutdown)).await;
    }

    /// The client finished downloading `path`; its next changes are not user edits.
    pub fn on_file_downloaded(&self, path: impl Into<PathBuf>) {
        self.markers.record(path);
    }

    pub fn markers(&self) -> &Arc<DownloadMarkers> {
        &self.markers
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.filters.keys().cloned().collect()
    }

    pub fn root_of(&self, account: &Account) -> Option<&Path> {
        self.filters.get(account).map(ChangeFilter::root)
    }
}

/// Forwards upload completions from the pipeline to the tracker.
pub fn spawn_upload_event_pump(
    tracker: Arc<UpdateTracker>,
    mut events: UploadEventReceiver,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracker.handle_upload_event(event);
        }
        log::debug!("Upload event channel closed");
    })
}
