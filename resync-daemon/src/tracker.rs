//! Pending upload bookkeeping.
//!
//! [`UpdateTracker`] turns stable file changes into upload tasks, keeps them
//! deduplicated and durable, and retires them once the pipeline reports back.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use resync_core::{
    Account, CacheCatalog, FailureClass, TaskStore, TrackedTask, UploadEvent, UploadOptions,
    UploadPipeline,
};

pub struct UpdateTracker {
    catalog: Arc<dyn CacheCatalog>,
    store: Arc<dyn TaskStore>,
    pipeline: RwLock<Option<Arc<dyn UploadPipeline>>>,
    pending: Mutex<HashSet<TrackedTask>>,
}

impl UpdateTracker {
    pub fn new(catalog: Arc<dyn CacheCatalog>, store: Arc<dyn TaskStore>) -> Self {
        Self {
            catalog,
            store,
            pipeline: RwLock::new(None),
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Merges the durable task set into memory. Returns the number of pending tasks.
    pub fn restore(&self) -> usize {
        let mut pending = self.pending.lock();
        match self.store.load_all() {
            Ok(stored) => pending.extend(stored),
            Err(e) => log::warn!("Could not load pending uploads: {:#}", e),
        }
        pending.len()
    }

    /// A cached file changed on disk and is stable.
    ///
    /// Returns whether a new task was queued. Files the catalog does not know
    /// about are ignored.
    pub fn on_cached_file_changed(&self, account: &Account, local_path: &Path) -> bool {
        let Some(cached) = self.catalog.lookup(account, local_path) else {
            log::debug!("{} is not a cached file of {}", local_path.display(), account);
            return false;
        };
        self.add_task(TrackedTask::from_cached(account, &cached, local_path))
    }

    /// Queues `task` unless an equal one is already pending.
    ///
    /// The task is persisted before it is held in memory, and submitted right
    /// away when a pipeline is connected and online.
    pub fn add_task(&self, task: TrackedTask) -> bool {
        {
            let mut pending = self.pending.lock();
            if pending.contains(&task) {
                log::debug!("Upload of {} already pending", task.local_path.display());
                return false;
            }
            // The in-memory copy still retries this run if the write fails.
            if let Err(e) = self.store.save(&task) {
                log::warn!("Could not persist upload of {}: {:#}", task.local_path.display(), e);
            }
            pending.insert(task.clone());
        }
        log::info!("Queued upload of {}", task.local_path.display());
        self.submit(&task);
        true
    }

    /// Attaches `pipeline` and resubmits everything pending, including tasks
    /// left over from a previous run.
    pub fn on_pipeline_connected(&self, pipeline: Arc<dyn UploadPipeline>) {
        *self.pipeline.write() = Some(pipeline);
        let count = self.restore();
        log::info!("Upload pipeline connected, {} uploads pending", count);

        for task in self.pending() {
            self.submit(&task);
        }
    }

    /// Detaches the pipeline. New tasks are only queued until the next connection.
    pub fn on_pipeline_disconnected(&self) {
        if self.pipeline.write().take().is_some() {
            log::info!("Upload pipeline disconnected");
        }
    }

    pub fn handle_upload_event(&self, event: UploadEvent) {
        match event {
            UploadEvent::Succeeded(task) => self.on_upload_success(&task),
            UploadEvent::Failed { task, status } => self.on_upload_failure(&task, status),
        }
    }

    pub fn on_upload_success(&self, task: &TrackedTask) {
        if self.retire(task) {
            log::info!("auto updated {}", task.local_path.display());
        }
    }

    pub fn on_upload_failure(&self, task: &TrackedTask, status: u16) {
        let class = FailureClass::from_status(status);
        if class.keeps_task() {
            log::warn!(
                "Upload of {} failed ({:?}, status {}), keeping it queued",
                task.local_path.display(),
                class,
                status
            );
            return;
        }
        if self.retire(task) {
            log::warn!(
                "Upload of {} failed with status {}, giving up",
                task.local_path.display(),
                status
            );
        }
    }

    /// Snapshot of the pending tasks.
    pub fn pending(&self) -> Vec<TrackedTask> {
        self.pending.lock().iter().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, task: &TrackedTask) -> bool {
        self.pending.lock().contains(task)
    }

    fn submit(&self, task: &TrackedTask) {
        let Some(pipeline) = self.pipeline.read().clone() else {
            log::debug!("No upload pipeline, {} stays queued", task.local_path.display());
            return;
        };
        if !pipeline.is_online() {
            log::debug!("Offline, {} stays queued", task.local_path.display());
            return;
        }
        match pipeline.submit(task, UploadOptions::auto_update()) {
            Ok(handle) => log::debug!("Submitted {} as {:?}", task.local_path.display(), handle),
            Err(e) => log::warn!("Could not submit {}: {:#}", task.local_path.display(), e),
        }
    }

    /// Drops `task` from memory and then from the store. Returns whether it
    /// was pending.
    ///
    /// The lock is held across the store write so a concurrent `add_task`
    /// cannot persist the same task in between and have it deleted here.
    fn retire(&self, task: &TrackedTask) -> bool {
        let mut pending = self.pending.lock();
        let removed = pending.remove(task);
        if let Err(e) = self.store.remove(task) {
            log::warn!("Could not drop {} from the store: {:#}", task.local_path.display(), e);
        }
        removed
    }
}
