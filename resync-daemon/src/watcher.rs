//! Recursive directory watching built from per-directory subscriptions.
//!
//! The OS is asked to watch each directory on its own. [`WatchTree`] keeps the
//! set of subscribed directories in step with the directory hierarchy: new
//! subdirectories are subscribed as they appear, removed ones are unsubscribed
//! together with everything below them.
//!
//! This is best-effort. A directory filled between being listed and being
//! subscribed can lose its first events.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use fs_err as fs;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::DaemonError;

/// Kinds of raw notifications a directory subscription delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawKind {
    Create,
    Delete,
    Modify,
    MovedFrom,
    MovedTo,
}

/// One raw notification for a path inside a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawKind,
    pub path: PathBuf,
}

impl RawEvent {
    pub fn new(kind: RawKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Subscribes single directories (not their subtrees) for change notification.
pub trait DirSubscriber: Send {
    fn subscribe(&mut self, dir: &Path) -> Result<(), DaemonError>;

    fn unsubscribe(&mut self, dir: &Path) -> Result<(), DaemonError>;
}

/// [`DirSubscriber`] backed by the platform watcher from `notify`.
///
/// Every subscription shares one native watcher; events are converted to
/// [`RawEvent`]s and pushed into the channel given at construction.
pub struct NotifySubscriber {
    watcher: RecommendedWatcher,
}

impl NotifySubscriber {
    pub fn new(events: mpsc::UnboundedSender<RawEvent>) -> Result<Self, DaemonError> {
        let watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    for raw in raw_events(event) {
                        if events.send(raw).is_err() {
                            log::debug!("Dropping file event, receiver is gone");
                            return;
                        }
                    }
                }
                Err(e) => log::warn!("File watcher error: {}", e),
            },
            Config::default(),
        )?;
        Ok(Self { watcher })
    }
}

impl DirSubscriber for NotifySubscriber {
    fn subscribe(&mut self, dir: &Path) -> Result<(), DaemonError> {
        self.watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(())
    }

    fn unsubscribe(&mut self, dir: &Path) -> Result<(), DaemonError> {
        self.watcher.unwatch(dir)?;
        Ok(())
    }
}

/// Converts a `notify` event into the raw notifications we act on.
///
/// Access and metadata-only events carry no content change and are dropped.
/// A rename reported with both paths becomes a move-out plus a move-in, unless
/// it carries a rename tracker: then its two halves were already delivered as
/// separate events.
pub fn raw_events(event: Event) -> Vec<RawEvent> {
    let tracked = event.tracker().is_some();
    let Event { kind, mut paths, .. } = event;

    let single = |kind: RawKind, paths: Vec<PathBuf>| -> Vec<RawEvent> {
        paths
            .into_iter()
            .next()
            .map(|p| RawEvent::new(kind, p))
            .into_iter()
            .collect()
    };

    match kind {
        EventKind::Create(_) => single(RawKind::Create, paths),
        EventKind::Remove(_) => single(RawKind::Delete, paths),
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            single(RawKind::Modify, paths)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => single(RawKind::MovedFrom, paths),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => single(RawKind::MovedTo, paths),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if tracked => vec![],
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            let to = paths.swap_remove(1);
            let from = paths.swap_remove(0);
            vec![
                RawEvent::new(RawKind::MovedFrom, from),
                RawEvent::new(RawKind::MovedTo, to),
            ]
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Backends that cannot tell the direction: decide by what is on disk now.
            let Some(path) = paths.into_iter().next() else {
                return vec![];
            };
            let kind = if path.exists() {
                RawKind::MovedTo
            } else {
                RawKind::MovedFrom
            };
            vec![RawEvent::new(kind, path)]
        }
        _ => vec![],
    }
}

#[derive(Debug)]
struct WatchNode {
    /// Directory that owns this node; `None` for the root.
    parent: Option<PathBuf>,
    children: BTreeSet<PathBuf>,
    /// Whether the directory is currently subscribed.
    active: bool,
}

/// Per-directory subscriptions mirroring the directory tree below `root`.
///
/// Nodes are kept in a path-keyed index; a node refers to its parent and
/// children by path only. Leaf events are returned from [`WatchTree::handle`]
/// exactly once, however deep the directory they happened in.
pub struct WatchTree<S: DirSubscriber> {
    root: PathBuf,
    nodes: HashMap<PathBuf, WatchNode>,
    subscriber: S,
}

impl<S: DirSubscriber> WatchTree<S> {
    /// Lists `root` recursively and subscribes every directory found.
    ///
    /// A missing root leaves the tree empty.
    pub fn new(root: impl Into<PathBuf>, subscriber: S) -> Self {
        let mut tree = Self {
            root: root.into(),
            nodes: HashMap::new(),
            subscriber,
        };
        let root = tree.root.clone();
        tree.install(&root, None);
        tree
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directories with an active subscription.
    pub fn watched_dirs(&self) -> BTreeSet<PathBuf> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.active)
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn is_watching(&self, dir: &Path) -> bool {
        self.nodes.get(dir).is_some_and(|node| node.active)
    }

    /// Applies one raw event and returns the file it reports on, if it is a
    /// leaf event (a file was modified or moved in).
    pub fn handle(&mut self, event: RawEvent) -> Option<PathBuf> {
        let RawEvent { kind, path } = event;
        log::trace!("Raw event {:?} on {}", kind, path.display());

        match kind {
            RawKind::Modify | RawKind::MovedTo => {
                if self.nodes.contains_key(&path) {
                    return None;
                }
                let parent = path.parent()?;
                if !self.nodes.contains_key(parent) {
                    log::debug!("Ignoring event from unwatched {}", parent.display());
                    return None;
                }
                if path.is_dir() {
                    let parent = parent.to_path_buf();
                    self.install(&path, Some(parent));
                    return None;
                }
                Some(path)
            }
            RawKind::Create => {
                if !self.nodes.contains_key(&path) && path.is_dir() {
                    match path.parent().filter(|p| self.nodes.contains_key(*p)) {
                        Some(parent) => {
                            let parent = parent.to_path_buf();
                            self.install(&path, Some(parent));
                        }
                        None => log::debug!("No watched parent for {}", path.display()),
                    }
                }
                None
            }
            RawKind::Delete | RawKind::MovedFrom => {
                self.remove(&path);
                None
            }
        }
    }

    /// Unsubscribes every directory. Idempotent.
    pub fn stop(&mut self) {
        let root = self.root.clone();
        self.remove(&root);
    }

    fn install(&mut self, dir: &Path, parent: Option<PathBuf>) {
        if self.nodes.contains_key(dir) {
            return;
        }
        if !dir.is_dir() {
            log::debug!("Not watching {}: not a directory", dir.display());
            return;
        }

        if let Some(parent) = &parent {
            if let Some(node) = self.nodes.get_mut(parent) {
                node.children.insert(dir.to_path_buf());
            }
        }
        self.nodes.insert(
            dir.to_path_buf(),
            WatchNode {
                parent,
                children: BTreeSet::new(),
                active: false,
            },
        );

        match fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    // Symlinked directories are not followed.
                    if entry.file_type().is_ok_and(|t| t.is_dir()) {
                        self.install(&entry.path(), Some(dir.to_path_buf()));
                    }
                }
            }
            Err(e) => log::debug!("Could not list {}: {}", dir.display(), e),
        }

        match self.subscriber.subscribe(dir) {
            Ok(()) => {
                if let Some(node) = self.nodes.get_mut(dir) {
                    node.active = true;
                }
                log::debug!("Started watching {}", dir.display());
            }
            Err(e) => {
                log::warn!("Skipping {}: {}", dir.display(), e);
                self.remove(dir);
            }
        }
    }

    /// Drops `dir` and its whole subtree. Returns whether it was watched.
    fn remove(&mut self, dir: &Path) -> bool {
        let Some(node) = self.nodes.remove(dir) else {
            return false;
        };
        if let Some(parent) = node.parent.as_ref().and_then(|p| self.nodes.get_mut(p)) {
            parent.children.remove(dir);
        }
        self.deactivate(dir, node);
        true
    }

    fn deactivate(&mut self, dir: &Path, node: WatchNode) {
        for child in node.children {
            if let Some(child_node) = self.nodes.remove(&child) {
                self.deactivate(&child, child_node);
            }
        }
        if node.active {
            // The directory may already be gone, in which case the OS dropped the watch itself.
            if let Err(e) = self.subscriber.unsubscribe(dir) {
                log::debug!("Unsubscribing {}: {}", dir.display(), e);
            }
            log::debug!("Stop watching {}", dir.display());
        }
    }
}

impl<S: DirSubscriber> Drop for WatchTree<S> {
    fn drop(&mut self) {
        self.stop();
    }
}
