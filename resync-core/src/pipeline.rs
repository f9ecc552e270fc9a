//! Upload submission and completion reporting.

use anyhow::Result;
use tokio::sync::mpsc;

use crate::TrackedTask;

/// Flags passed along with an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    /// Overwrite the remote file instead of creating a renamed copy.
    pub replace: bool,
    /// The upload updates a file that already exists remotely.
    pub update: bool,
}

impl UploadOptions {
    /// Options used when re-uploading an edited cached file.
    pub fn auto_update() -> Self {
        Self {
            replace: true,
            update: true,
        }
    }
}

/// Identifier of a submitted upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadHandle(pub u64);

/// Result of an upload, delivered asynchronously after [`UploadPipeline::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Succeeded(TrackedTask),
    Failed { task: TrackedTask, status: u16 },
}

pub type UploadEventSender = mpsc::UnboundedSender<UploadEvent>;
pub type UploadEventReceiver = mpsc::UnboundedReceiver<UploadEvent>;

/// Channel the pipeline reports completions on.
pub fn upload_events() -> (UploadEventSender, UploadEventReceiver) {
    mpsc::unbounded_channel()
}

/// The transfer machinery that actually talks to the server.
pub trait UploadPipeline: Send + Sync {
    /// Queue `task` for upload. Completion is reported later as an [`UploadEvent`].
    fn submit(&self, task: &TrackedTask, options: UploadOptions) -> Result<UploadHandle>;

    /// Whether uploads can currently reach the server.
    fn is_online(&self) -> bool {
        true
    }
}
