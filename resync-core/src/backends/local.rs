use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use anyhow::{Context, Result, bail};
use fs_err as fs;

use crate::pipeline::{UploadEvent, UploadEventSender, UploadHandle, UploadOptions, UploadPipeline};
use crate::TrackedTask;

const STATUS_NOT_FOUND: u16 = 404;
const STATUS_CONFLICT: u16 = 409;
const STATUS_SERVER_ERROR: u16 = 500;

/// Uploads into a directory tree laid out as `<root>/<repo_id>/<parent_dir>/<file>`.
///
/// Useful when the "server" is a mounted share. The pipeline is offline while
/// the root directory is missing, and a repo whose directory is gone answers
/// with a 404 so the task is retired.
#[derive(Debug)]
pub struct LocalUploader {
    root: PathBuf,
    events: UploadEventSender,
    next_handle: AtomicU64,
}

impl LocalUploader {
    pub fn new(root: impl AsRef<Path>, events: UploadEventSender) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            events,
            next_handle: AtomicU64::new(1),
        }
    }

    /// Remote location the task's file is written to.
    pub fn destination(&self, task: &TrackedTask) -> Result<PathBuf> {
        let Some(file_name) = task.local_path.file_name() else {
            bail!("Path {} has no file name", task.local_path.display());
        };
        Ok(self
            .root
            .join(&task.repo_id)
            .join(task.parent_dir.trim_start_matches('/'))
            .join(file_name))
    }

    fn upload(root: &Path, task: &TrackedTask, dest: &Path, options: UploadOptions) -> Result<(), u16> {
        if !root.join(&task.repo_id).is_dir() {
            log::warn!("Repo {} ({}) no longer exists", task.repo_name, task.repo_id);
            return Err(STATUS_NOT_FOUND);
        }
        if !task.local_path.is_file() {
            log::warn!("Local file {} disappeared before upload", task.local_path.display());
            return Err(STATUS_NOT_FOUND);
        }
        if dest.exists() && !options.replace {
            return Err(STATUS_CONFLICT);
        }

        copy_atomically(&task.local_path, dest).map_err(|e| {
            log::warn!("Upload of {} failed: {:#}", task.local_path.display(), e);
            STATUS_SERVER_ERROR
        })
    }
}

fn copy_atomically(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = dest.with_extension("resync-part");
    fs::copy(source, &tmp)?;
    fs::rename(&tmp, dest)?;
    Ok(())
}

impl UploadPipeline for LocalUploader {
    fn submit(&self, task: &TrackedTask, options: UploadOptions) -> Result<UploadHandle> {
        let handle = UploadHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let dest = self.destination(task)?;
        let root = self.root.clone();
        let task = task.clone();
        let events = self.events.clone();

        log::debug!("Submitting {:?} for {}", handle, task.local_path.display());
        thread::Builder::new()
            .name(format!("resync-upload-{}", handle.0))
            .spawn(move || {
                let event = match Self::upload(&root, &task, &dest, options) {
                    Ok(()) => UploadEvent::Succeeded(task),
                    Err(status) => UploadEvent::Failed { task, status },
                };
                if events.send(event).is_err() {
                    log::debug!("Upload finished after the receiver went away");
                }
            })
            .context("Failed to spawn upload thread")?;

        Ok(handle)
    }

    fn is_online(&self) -> bool {
        self.root.is_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::upload_events;
    use crate::Account;

    fn task(local: &Path, parent_dir: &str) -> TrackedTask {
        TrackedTask::new(
            Account::new("https://cloud.example.com", "alice@example.com"),
            "r1",
            "Docs",
            parent_dir,
            local,
        )
    }

    #[tokio::test]
    async fn uploads_into_repo_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = tmp.path().join("remote");
        fs::create_dir_all(remote.join("r1")).unwrap();
        let local = tmp.path().join("f.txt");
        fs::write(&local, b"edited").unwrap();

        let (tx, mut rx) = upload_events();
        let uploader = LocalUploader::new(&remote, tx);
        assert!(uploader.is_online());

        let t = task(&local, "/notes");
        uploader.submit(&t, UploadOptions::auto_update()).unwrap();

        assert_eq!(rx.recv().await.unwrap(), UploadEvent::Succeeded(t));
        assert_eq!(fs::read(remote.join("r1/notes/f.txt")).unwrap(), b"edited");
    }

    #[tokio::test]
    async fn missing_repo_is_a_client_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = tmp.path().join("remote");
        fs::create_dir_all(&remote).unwrap();
        let local = tmp.path().join("f.txt");
        fs::write(&local, b"edited").unwrap();

        let (tx, mut rx) = upload_events();
        let uploader = LocalUploader::new(&remote, tx);
        let t = task(&local, "/");
        uploader.submit(&t, UploadOptions::auto_update()).unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            UploadEvent::Failed { task: t, status: 404 }
        );
    }

    #[tokio::test]
    async fn refuses_to_overwrite_without_replace() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = tmp.path().join("remote");
        fs::create_dir_all(remote.join("r1")).unwrap();
        fs::write(remote.join("r1/f.txt"), b"server copy").unwrap();
        let local = tmp.path().join("f.txt");
        fs::write(&local, b"edited").unwrap();

        let (tx, mut rx) = upload_events();
        let uploader = LocalUploader::new(&remote, tx);
        let t = task(&local, "/");
        let options = UploadOptions {
            replace: false,
            update: true,
        };
        uploader.submit(&t, options).unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            UploadEvent::Failed { task: t, status: 409 }
        );
        assert_eq!(fs::read(remote.join("r1/f.txt")).unwrap(), b"server copy");
    }

    #[test]
    fn offline_without_root() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, _rx) = upload_events();
        let uploader = LocalUploader::new(tmp.path().join("not-mounted"), tx);
        assert!(!uploader.is_online());
    }
}
