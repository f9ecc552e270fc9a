//! Per-account change filtering.
//!
//! A [`ChangeFilter`] owns the watch tree of one account's cache directory and
//! decides which leaf events are user edits worth uploading. Two checks apply:
//!
//! 1. **Self-download suppression**: files the client itself just wrote are
//!    ignored for the grace window (see [`DownloadMarkers`]).
//! 2. **Write stability**: a file whose mtime is younger than the stability
//!    window is re-checked once it has been quiet long enough.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use fs_err as fs;
use futures::StreamExt;
use parking_lot::Mutex;
use resync_core::Account;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::time::{DelayQueue, delay_queue};

use crate::DaemonError;
use crate::tracker::UpdateTracker;
use crate::watcher::{DirSubscriber, NotifySubscriber, RawEvent, WatchTree};

/// Timing of the two change filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSettings {
    /// Quiet period after the last write before a file is considered done.
    pub stability_window: Duration,
    /// How long a recorded download suppresses changes to the same file.
    pub grace_window: Duration,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            stability_window: Duration::from_secs(5),
            grace_window: Duration::from_secs(10),
        }
    }
}

/// Files the client downloaded itself, with the time of the download.
///
/// Shared by every account filter. Entries older than the grace window are
/// dropped lazily.
#[derive(Debug)]
pub struct DownloadMarkers {
    grace: Duration,
    marks: Mutex<HashMap<PathBuf, Instant>>,
}

impl DownloadMarkers {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            marks: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, path: impl Into<PathBuf>) {
        let now = Instant::now();
        let mut marks = self.marks.lock();
        marks.retain(|_, at| now.duration_since(*at) < self.grace);
        marks.insert(path.into(), now);
    }

    /// Whether `path` was downloaded within the grace window.
    pub fn is_recent(&self, path: &Path) -> bool {
        let mut marks = self.marks.lock();
        match marks.get(path) {
            Some(at) if at.elapsed() < self.grace => true,
            Some(_) => {
                marks.remove(path);
                false
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.marks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.lock().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Suppressed,
    Missing,
    Unstable(Duration),
    Stable,
}

/// Write-stability debounce with at most one pending re-check per path.
struct Debouncer {
    settings: FilterSettings,
    markers: Arc<DownloadMarkers>,
    queue: DelayQueue<PathBuf>,
    keys: HashMap<PathBuf, delay_queue::Key>,
}

impl Debouncer {
    fn new(settings: FilterSettings, markers: Arc<DownloadMarkers>) -> Self {
        Self {
            settings,
            markers,
            queue: DelayQueue::new(),
            keys: HashMap::new(),
        }
    }

    fn evaluate(&self, path: &Path) -> Verdict {
        if self.markers.is_recent(path) {
            return Verdict::Suppressed;
        }
        let meta = match fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta,
            _ => return Verdict::Missing,
        };
        let Ok(mtime) = meta.modified() else {
            return Verdict::Stable;
        };
        // Clock skew can put mtime in the future; that counts as fresh too.
        let age = SystemTime::now()
            .duration_since(mtime)
            .unwrap_or_else(|e| e.duration());
        if age < self.settings.stability_window {
            Verdict::Unstable(self.settings.stability_window - age)
        } else {
            Verdict::Stable
        }
    }

    /// Checks `path` now. Returns it if it should be uploaded; otherwise
    /// the path is dropped or a re-check is scheduled.
    fn on_change(&mut self, path: &Path) -> Option<PathBuf> {
        match self.evaluate(path) {
            Verdict::Suppressed => {
                log::debug!("Ignoring change to freshly downloaded {}", path.display());
                self.cancel(path);
                None
            }
            Verdict::Missing => {
                log::debug!("{} is gone, ignoring", path.display());
                self.cancel(path);
                None
            }
            Verdict::Unstable(wait) => {
                log::trace!("{} still being written, re-check in {:?}", path.display(), wait);
                self.schedule(path, wait);
                None
            }
            Verdict::Stable => {
                self.cancel(path);
                Some(path.to_path_buf())
            }
        }
    }

    fn schedule(&mut self, path: &Path, wait: Duration) {
        match self.keys.get(path) {
            Some(key) => self.queue.reset(key, wait),
            None => {
                let key = self.queue.insert(path.to_path_buf(), wait);
                self.keys.insert(path.to_path_buf(), key);
            }
        }
    }

    fn cancel(&mut self, path: &Path) {
        if let Some(key) = self.keys.remove(path) {
            self.queue.remove(&key);
        }
    }

    fn has_pending(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Waits for the next scheduled re-check.
    async fn next_due(&mut self) -> Option<PathBuf> {
        let expired = self.queue.next().await?;
        let path = expired.into_inner();
        self.keys.remove(&path);
        Some(path)
    }
}

/// Watches one account's cache directory and feeds stable user edits to the
/// tracker.
pub struct ChangeFilter {
    account: Account,
    root: PathBuf,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ChangeFilter {
    /// Starts watching `root` with native notifications.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        account: Account,
        root: impl Into<PathBuf>,
        settings: FilterSettings,
        markers: Arc<DownloadMarkers>,
        tracker: Arc<UpdateTracker>,
    ) -> Result<Self, DaemonError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let subscriber = NotifySubscriber::new(raw_tx)?;
        Ok(Self::with_subscriber(
            account, root, settings, markers, tracker, subscriber, raw_rx,
        ))
    }

    pub(crate) fn with_subscriber<S: DirSubscriber + 'static>(
        account: Account,
        root: impl Into<PathBuf>,
        settings: FilterSettings,
        markers: Arc<DownloadMarkers>,
        tracker: Arc<UpdateTracker>,
        subscriber: S,
        raw_rx: mpsc::UnboundedReceiver<RawEvent>,
    ) -> Self {
        let root = root.into();
        let tree = WatchTree::new(&root, subscriber);
        log::info!(
            "Monitoring {} for {} ({} directories)",
            root.display(),
            account,
            tree.watched_dirs().len()
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_filter(
            account.clone(),
            tree,
            raw_rx,
            Debouncer::new(settings, markers),
            tracker,
            stop_rx,
        ));

        Self {
            account,
            root,
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Signals the filter task to stop. Pending re-checks are discarded.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Stops the filter and waits until its watches are released.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Change filter for {} ended abnormally: {}", self.account, e);
            }
        }
    }
}

impl Drop for ChangeFilter {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_filter<S: DirSubscriber>(
    account: Account,
    mut tree: WatchTree<S>,
    mut raw_rx: mpsc::UnboundedReceiver<RawEvent>,
    mut debouncer: Debouncer,
    tracker: Arc<UpdateTracker>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        let candidate = tokio::select! {
            biased;

            _ = &mut stop_rx => break,
            // Due re-checks go before new events so a busy directory cannot starve them.
            Some(path) = debouncer.next_due(), if debouncer.has_pending() => Some(path),
            event = raw_rx.recv() => match event {
                Some(event) => tree.handle(event),
                None => break,
            },
        };

        if let Some(path) = candidate.and_then(|p| debouncer.on_change(&p)) {
            log::debug!("Stable change to {}", path.display());
            tracker.on_cached_file_changed(&account, &path);
        }
    }

    tree.stop();
    log::info!("Stopped monitoring {} for {}", tree.root().display(), account);
}
