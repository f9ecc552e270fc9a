//! Durable storage for pending upload tasks.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs_err as fs;
use parking_lot::Mutex;

use crate::TrackedTask;

pub const PENDING_FILE_NAME: &str = "pending.json";

/// Persistence for the pending-task set.
///
/// This is the source of truth across restarts: anything present here has not
/// been uploaded yet.
pub trait TaskStore: Send + Sync {
    fn save(&self, task: &TrackedTask) -> Result<()>;

    fn remove(&self, task: &TrackedTask) -> Result<()>;

    fn load_all(&self) -> Result<HashSet<TrackedTask>>;
}

/// Stores the pending set as one JSON array.
///
/// Every change rewrites the whole file through a temporary sibling and a
/// rename, so a crash leaves either the old or the new set on disk.
#[derive(Debug)]
pub struct JsonTaskStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonTaskStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store at `<state_dir>/pending.json`.
    pub fn in_dir(state_dir: impl AsRef<Path>) -> Self {
        Self::new(state_dir.as_ref().join(PENDING_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<HashSet<TrackedTask>> {
        if !self.path.exists() {
            return Ok(HashSet::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(HashSet::new());
        }
        let tasks: Vec<TrackedTask> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse task store {}", self.path.display()))?;
        Ok(tasks.into_iter().collect())
    }

    fn write(&self, tasks: &HashSet<TrackedTask>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut sorted: Vec<&TrackedTask> = tasks.iter().collect();
        sorted.sort_by(|a, b| a.local_path.cmp(&b.local_path));
        let content = serde_json::to_string_pretty(&sorted)?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn update(&self, apply: impl FnOnce(&mut HashSet<TrackedTask>) -> bool) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut tasks = self.read()?;
        if apply(&mut tasks) {
            self.write(&tasks)?;
        }
        Ok(())
    }
}

impl TaskStore for JsonTaskStore {
    fn save(&self, task: &TrackedTask) -> Result<()> {
        log::debug!("Persisting task for {}", task.local_path.display());
        self.update(|tasks| {
            tasks.replace(task.clone());
            true
        })
    }

    fn remove(&self, task: &TrackedTask) -> Result<()> {
        log::debug!("Dropping persisted task for {}", task.local_path.display());
        self.update(|tasks| tasks.remove(task))
    }

    fn load_all(&self) -> Result<HashSet<TrackedTask>> {
        let _guard = self.write_lock.lock();
        self.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Account;

    fn task(local: &str) -> TrackedTask {
        TrackedTask::new(
            Account::new("https://cloud.example.com", "alice@example.com"),
            "r1",
            "Docs",
            "/",
            local,
        )
    }

    #[test]
    fn empty_when_file_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonTaskStore::in_dir(tmp.path());
        assert!(store.load_all().unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn survives_a_new_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonTaskStore::in_dir(tmp.path().join("state"));
        store.save(&task("/cache/a.txt")).unwrap();
        store.save(&task("/cache/b.txt")).unwrap();
        store.save(&task("/cache/a.txt")).unwrap();

        let reopened = JsonTaskStore::in_dir(tmp.path().join("state"));
        let tasks = reopened.load_all().unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.contains(&task("/cache/a.txt")));
        assert!(tasks.contains(&task("/cache/b.txt")));
    }

    #[test]
    fn remove_deletes_only_that_task() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonTaskStore::in_dir(tmp.path());
        store.save(&task("/cache/a.txt")).unwrap();
        store.save(&task("/cache/b.txt")).unwrap();

        store.remove(&task("/cache/a.txt")).unwrap();
        store.remove(&task("/cache/never-saved.txt")).unwrap();

        let tasks = store.load_all().unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks.contains(&task("/cache/b.txt")));
        assert!(!tmp.path().join("pending.json.tmp").exists());
    }

    #[test]
    fn save_keeps_latest_repo_name() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonTaskStore::in_dir(tmp.path());
        store.save(&task("/cache/a.txt")).unwrap();

        let mut renamed = task("/cache/a.txt");
        renamed.repo_name = "Documents".to_string();
        store.save(&renamed).unwrap();

        let tasks = store.load_all().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks.iter().next().unwrap().repo_name, "Documents");
    }

    #[test]
    fn corrupt_store_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonTaskStore::in_dir(tmp.path());
        fs::write(store.path(), "{").unwrap();
        assert!(store.load_all().is_err());
    }
}
