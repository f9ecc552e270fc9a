use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::CachedFile;
use crate::Account;

/// A pending intention to re-upload one locally edited file.
///
/// Identity is `(account, repo_id, parent_dir, local_path)`. The repo name is
/// only carried along for display and submission, so a repo renamed on the
/// server does not produce a second task for the same file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedTask {
    pub account: Account,
    pub repo_id: String,
    pub repo_name: String,
    /// Remote directory the file lives in, always starting with `/`.
    pub parent_dir: String,
    pub local_path: PathBuf,
}

impl TrackedTask {
    pub fn new(
        account: Account,
        repo_id: impl Into<String>,
        repo_name: impl Into<String>,
        parent_dir: impl Into<String>,
        local_path: impl AsRef<Path>,
    ) -> Self {
        Self {
            account,
            repo_id: repo_id.into(),
            repo_name: repo_name.into(),
            parent_dir: parent_dir.into(),
            local_path: local_path.as_ref().to_path_buf(),
        }
    }

    /// Builds the task for a local file the catalog knows about.
    pub fn from_cached(account: &Account, cached: &CachedFile, local_path: &Path) -> Self {
        Self::new(
            account.clone(),
            cached.repo_id.clone(),
            cached.repo_name.clone(),
            cached.parent_dir(),
            local_path,
        )
    }
}

impl PartialEq for TrackedTask {
    fn eq(&self, other: &Self) -> bool {
        self.account == other.account
            && self.repo_id == other.repo_id
            && self.parent_dir == other.parent_dir
            && self.local_path == other.local_path
    }
}

impl Eq for TrackedTask {}

impl Hash for TrackedTask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.account.hash(state);
        self.repo_id.hash(state);
        self.parent_dir.hash(state);
        self.local_path.hash(state);
    }
}

/// How an upload failure is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// No connectivity or the pipeline could not be reached. Keep the task.
    Transient,
    /// The server failed (5xx). Keep the task.
    Server,
    /// The remote file or permission is gone (4xx). Retire the task.
    Client,
}

impl FailureClass {
    pub fn from_status(status: u16) -> Self {
        match status / 100 {
            4 => FailureClass::Client,
            5 => FailureClass::Server,
            _ => FailureClass::Transient,
        }
    }

    /// Whether a task that failed this way should stay pending.
    pub fn keeps_task(self) -> bool {
        !matches!(self, FailureClass::Client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn alice() -> Account {
        Account::new("https://cloud.example.com", "alice@example.com")
    }

    #[test]
    fn repo_name_is_not_part_of_identity() {
        let a = TrackedTask::new(alice(), "r1", "Docs", "/", "/cache/Docs/f.txt");
        let b = TrackedTask::new(alice(), "r1", "Renamed", "/", "/cache/Docs/f.txt");
        assert_eq!(a, b);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn parent_dir_is_part_of_identity() {
        let a = TrackedTask::new(alice(), "r1", "Docs", "/", "/cache/Docs/f.txt");
        let b = TrackedTask::new(alice(), "r1", "Docs", "/sub", "/cache/Docs/f.txt");
        assert_ne!(a, b);
    }

    #[test]
    fn from_cached_uses_remote_parent() {
        let cached = CachedFile::new("r1", "Docs", "/notes/todo.md");
        let task = TrackedTask::from_cached(&alice(), &cached, Path::new("/cache/Docs/notes/todo.md"));
        assert_eq!(task.parent_dir, "/notes");
        assert_eq!(task.repo_name, "Docs");
    }

    #[test]
    fn classifies_status_codes() {
        assert_eq!(FailureClass::from_status(404), FailureClass::Client);
        assert_eq!(FailureClass::from_status(403), FailureClass::Client);
        assert_eq!(FailureClass::from_status(500), FailureClass::Server);
        assert_eq!(FailureClass::from_status(503), FailureClass::Server);
        assert_eq!(FailureClass::from_status(0), FailureClass::Transient);
        assert_eq!(FailureClass::from_status(302), FailureClass::Transient);

        assert!(!FailureClass::Client.keeps_task());
        assert!(FailureClass::Server.keeps_task());
        assert!(FailureClass::Transient.keeps_task());
    }
}
