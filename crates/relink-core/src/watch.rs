//! Filesystem watcher.
//!
//! Adapts `notify` events into [`FsEvent`]s on an unbounded channel. The
//! notify callback runs on the watcher's own thread; it filters, classifies,
//! settles and sends, so events reach the session already canonical.

use crate::invalidate::{canonical_identity, ChangeKind};
use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher,
};
use relink_util::fs::is_temp_artifact;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// One observed change to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Decides which paths are worth a rebuild.
#[derive(Debug, Clone)]
pub struct WatchFilter {
    root: PathBuf,
    out_dir: PathBuf,
    extensions: Vec<String>,
}

impl WatchFilter {
    /// `root` and `out_dir` should be canonical, as the paths notify reports are.
    #[must_use]
    pub fn new(root: PathBuf, out_dir: PathBuf, extensions: Vec<String>) -> Self {
        Self {
            root,
            out_dir,
            extensions,
        }
    }

    /// Build the filter for a bundler's project.
    #[must_use]
    pub fn for_bundler(bundler: &crate::bundler::Bundler) -> Self {
        let root = bundler.root().to_path_buf();
        let out_dir = bundler.config().out_dir_path();
        let out_dir = dunce::canonicalize(&out_dir).unwrap_or_else(|_| {
            if out_dir.is_absolute() {
                out_dir
            } else {
                root.join(&bundler.config().out_dir)
            }
        });
        Self::new(root, out_dir, bundler.extensions().to_vec())
    }

    #[must_use]
    pub fn accepts(&self, path: &Path) -> bool {
        if path.starts_with(&self.out_dir) || is_temp_artifact(path) {
            return false;
        }
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let ignored = relative.components().any(|c| match c {
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                name == "node_modules" || name.starts_with('.')
            }
            _ => false,
        });
        if ignored {
            return false;
        }
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| self.extensions.iter().any(|ext| name.ends_with(ext.as_str())))
    }
}

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("invalid watch root: {}", .0.display())]
    InvalidRoot(PathBuf),

    #[error("watcher failed: {0}")]
    Notify(#[from] notify::Error),
}

impl WatchError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRoot(_) => "WATCH_INVALID_ROOT",
            Self::Notify(_) => "WATCH_FAILED",
        }
    }
}

/// Running recursive watch on one root. Dropping it stops the watch.
pub struct FsWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for FsWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsWatcher").field("root", &self.root).finish()
    }
}

impl FsWatcher {
    /// Watch `root` recursively, sending accepted events to `sender`.
    pub fn start(
        root: &Path,
        filter: WatchFilter,
        sender: mpsc::UnboundedSender<FsEvent>,
    ) -> Result<Self, WatchError> {
        if !root.is_dir() {
            return Err(WatchError::InvalidRoot(root.to_path_buf()));
        }

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let Some(kind) = classify(&event.kind) else {
                        return;
                    };
                    for path in event.paths {
                        if !filter.accepts(&path) {
                            continue;
                        }
                        let event = settle(FsEvent { path, kind });
                        debug!(path = %event.path.display(), kind = ?event.kind, "file changed");
                        if sender.send(event).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => error!(error = %e, "watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        info!(root = %root.display(), "watching directory");

        Ok(Self {
            root: root.to_path_buf(),
            _watcher: watcher,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Map a notify event kind onto a change kind. Renames are split into a
/// deletion of the old name and a creation of the new one; when the platform
/// cannot tell which side a path is, existence decides later.
fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(CreateKind::File | CreateKind::Any) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => Some(ChangeKind::Modified),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Modified),
        EventKind::Remove(RemoveKind::File | RemoveKind::Any) => Some(ChangeKind::Deleted),
        _ => None,
    }
}

/// Correct an event's kind by whether the file still exists and canonicalize
/// its path. Blocking.
#[must_use]
pub fn settle(event: FsEvent) -> FsEvent {
    let kind = match event.kind {
        ChangeKind::Modified if !event.path.exists() => ChangeKind::Deleted,
        ChangeKind::Deleted if event.path.exists() => ChangeKind::Modified,
        kind => kind,
    };
    FsEvent {
        path: canonical_identity(&event.path),
        kind,
    }
}
