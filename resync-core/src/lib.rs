//! resync core library
//!
//! Types and collaborator seams shared by the change monitor.
//!
//! # Architecture
//!
//! - `account`, `task`: who a pending upload belongs to and what it targets
//! - `catalog`: which local files are cached copies of server files
//! - `store`: durable pending-task set
//! - `pipeline`, `backends`: upload submission and completion events

pub mod account;
pub mod backends;
pub mod catalog;
pub mod pipeline;
pub mod store;
pub mod task;

pub use account::Account;
pub use backends::LocalUploader;
pub use catalog::{CacheCatalog, CachedFile, CatalogFile};
pub use pipeline::{
    UploadEvent, UploadEventReceiver, UploadEventSender, UploadHandle, UploadOptions,
    UploadPipeline, upload_events,
};
pub use store::{JsonTaskStore, TaskStore};
pub use task::{FailureClass, TrackedTask};

#[cfg(any(test, feature = "testutil"))]
pub mod testutil {
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use anyhow::Result;
    use parking_lot::Mutex;

    use crate::{Account, TrackedTask, UploadHandle, UploadOptions, UploadPipeline};

    pub fn alice() -> Account {
        Account::new("https://cloud.example.com", "alice@example.com")
    }

    pub fn bob() -> Account {
        Account::new("https://cloud.example.com", "bob@example.com")
    }

    /// A task in repo `r1` ("Docs") at the remote root.
    pub fn task_for(account: &Account, local_path: impl AsRef<Path>) -> TrackedTask {
        TrackedTask::new(account.clone(), "r1", "Docs", "/", local_path)
    }

    /// Pipeline that only records what was submitted.
    ///
    /// Completions are delivered by the test itself, which makes the order of
    /// events fully deterministic.
    #[derive(Debug)]
    pub struct RecordingPipeline {
        submitted: Mutex<Vec<(TrackedTask, UploadOptions)>>,
        online: AtomicBool,
        next_handle: AtomicU64,
    }

    impl Default for RecordingPipeline {
        fn default() -> Self {
            Self {
                submitted: Mutex::new(Vec::new()),
                online: AtomicBool::new(true),
                next_handle: AtomicU64::new(1),
            }
        }
    }

    impl RecordingPipeline {
        pub fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }

        pub fn submitted(&self) -> Vec<TrackedTask> {
            self.submitted.lock().iter().map(|(t, _)| t.clone()).collect()
        }

        pub fn submitted_options(&self) -> Vec<UploadOptions> {
            self.submitted.lock().iter().map(|(_, o)| *o).collect()
        }
    }

    impl UploadPipeline for RecordingPipeline {
        fn submit(&self, task: &TrackedTask, options: UploadOptions) -> Result<UploadHandle> {
            self.submitted.lock().push((task.clone(), options));
            Ok(UploadHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
        }

        fn is_online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }
    }
}
