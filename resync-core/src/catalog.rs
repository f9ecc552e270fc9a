//! Lookup of locally cached files.
//!
//! The catalog answers one question for the change pipeline: is this local
//! file a cached copy of a server file, and if so, where does it live remotely?

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs_err as fs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::Account;

/// Remote location of a cached file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFile {
    pub repo_id: String,
    pub repo_name: String,
    /// Full remote path inside the repo, e.g. `/docs/report.odt`.
    pub path: String,
}

impl CachedFile {
    pub fn new(
        repo_id: impl Into<String>,
        repo_name: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            repo_id: repo_id.into(),
            repo_name: repo_name.into(),
            path: path.into(),
        }
    }

    /// Remote directory containing this file. Top-level files live in `/`.
    pub fn parent_dir(&self) -> String {
        let trimmed = self.path.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(idx) => trimmed[..idx].to_string(),
        }
    }
}

/// Source of cached-file metadata.
pub trait CacheCatalog: Send + Sync {
    /// Returns the remote location of `local_path`, or `None` if the file is not
    /// a cached server file for this account.
    fn lookup(&self, account: &Account, local_path: &Path) -> Option<CachedFile>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogEntry {
    account: Account,
    local_path: PathBuf,
    #[serde(flatten)]
    file: CachedFile,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    entries: Vec<CatalogEntry>,
}

/// JSON-backed catalog.
///
/// The document is read once on [`CatalogFile::load`]; the download path keeps
/// it current through [`CatalogFile::insert`] and [`CatalogFile::save`].
#[derive(Debug, Default)]
pub struct CatalogFile {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<(Account, PathBuf), CachedFile>>,
}

impl CatalogFile {
    /// An empty catalog that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Reads the catalog at `path`. A missing file is an empty catalog.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let document: CatalogDocument = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse catalog {}", path.display()))?
        } else {
            log::debug!("No catalog at {}, starting empty", path.display());
            CatalogDocument::default()
        };

        let entries = document
            .entries
            .into_iter()
            .map(|e| ((e.account, e.local_path), e.file))
            .collect();

        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    pub fn insert(&self, account: &Account, local_path: impl AsRef<Path>, file: CachedFile) {
        self.entries
            .write()
            .insert((account.clone(), local_path.as_ref().to_path_buf()), file);
    }

    pub fn remove(&self, account: &Account, local_path: impl AsRef<Path>) -> Option<CachedFile> {
        self.entries
            .write()
            .remove(&(account.clone(), local_path.as_ref().to_path_buf()))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Writes the catalog back to the file it was loaded from.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut entries: Vec<CatalogEntry> = self
            .entries
            .read()
            .iter()
            .map(|((account, local_path), file)| CatalogEntry {
                account: account.clone(),
                local_path: local_path.clone(),
                file: file.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.local_path.cmp(&b.local_path));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&CatalogDocument { entries })?;
        fs::write(path, content)?;
        Ok(())
    }
}

impl CacheCatalog for CatalogFile {
    fn lookup(&self, account: &Account, local_path: &Path) -> Option<CachedFile> {
        self.entries
            .read()
            .get(&(account.clone(), local_path.to_path_buf()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Account {
        Account::new("https://cloud.example.com", "alice@example.com")
    }

    #[test]
    fn parent_dir_of_remote_paths() {
        assert_eq!(CachedFile::new("r", "R", "/a.txt").parent_dir(), "/");
        assert_eq!(CachedFile::new("r", "R", "/docs/a.txt").parent_dir(), "/docs");
        assert_eq!(CachedFile::new("r", "R", "/docs/sub/a.txt").parent_dir(), "/docs/sub");
        assert_eq!(CachedFile::new("r", "R", "a.txt").parent_dir(), "/");
    }

    #[test]
    fn lookup_is_per_account() {
        let catalog = CatalogFile::in_memory();
        catalog.insert(&alice(), "/cache/Docs/a.txt", CachedFile::new("r1", "Docs", "/a.txt"));

        let bob = Account::new("https://cloud.example.com", "bob@example.com");
        assert!(catalog.lookup(&alice(), Path::new("/cache/Docs/a.txt")).is_some());
        assert!(catalog.lookup(&bob, Path::new("/cache/Docs/a.txt")).is_none());
        assert!(catalog.lookup(&alice(), Path::new("/cache/Docs/b.txt")).is_none());
    }

    #[test]
    fn save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("catalog.json");

        let catalog = CatalogFile::load(&path).unwrap();
        assert!(catalog.is_empty());
        catalog.insert(&alice(), "/cache/Docs/a.txt", CachedFile::new("r1", "Docs", "/a.txt"));
        catalog.save().unwrap();

        let loaded = CatalogFile::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(
            loaded.lookup(&alice(), Path::new("/cache/Docs/a.txt")),
            Some(CachedFile::new("r1", "Docs", "/a.txt"))
        );
    }

    #[test]
    fn remove_forgets_the_entry() {
        let catalog = CatalogFile::in_memory();
        catalog.insert(&alice(), "/cache/Docs/a.txt", CachedFile::new("r1", "Docs", "/a.txt"));

        assert_eq!(
            catalog.remove(&alice(), "/cache/Docs/a.txt"),
            Some(CachedFile::new("r1", "Docs", "/a.txt"))
        );
        assert_eq!(catalog.remove(&alice(), "/cache/Docs/a.txt"), None);
        assert!(catalog.lookup(&alice(), Path::new("/cache/Docs/a.txt")).is_none());
    }

    #[test]
    fn load_rejects_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("catalog.json");
        fs::write(&path, "not json").unwrap();

        let err = CatalogFile::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse catalog"));
    }
}
