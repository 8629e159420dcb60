//! Point-in-time filesystem inventories with a short-lived cache.
//!
//! Snapshots are best-effort telemetry for detecting files a child process
//! created: scan failures degrade to an empty snapshot with a warning
//! instead of failing the request. The cache avoids rescanning the same
//! root on back-to-back requests, at the cost of a small, accepted
//! staleness window.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use walkdir::WalkDir;

/// Infrastructure directories excluded from scans: version-control
/// metadata, dependency caches, build output, hidden tool directories.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".claude",
    "node_modules",
    "__pycache__",
    ".venv",
    ".next",
    "dist",
    "build",
    "target",
];

/// Immutable inventory of the leaf files under a root.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub root: PathBuf,
    pub taken_at: Instant,
    pub files: BTreeSet<PathBuf>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Snapshot taker with a single-slot TTL cache, owned per instance and
/// shared by reference across requests.
pub struct Snapshotter {
    ttl: Duration,
    cache: Mutex<Option<Snapshot>>,
}

impl Snapshotter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Capture a snapshot of `root`, serving a cached one when the last
    /// full scan of the same root is younger than the TTL.
    pub fn capture(&self, root: &Path) -> Snapshot {
        if let Ok(cache) = self.cache.lock()
            && let Some(snapshot) = cache.as_ref()
            && snapshot.root == root
            && snapshot.taken_at.elapsed() < self.ttl
        {
            debug!(
                root = %root.display(),
                files = snapshot.files.len(),
                "serving cached snapshot"
            );
            return snapshot.clone();
        }
        self.capture_fresh(root)
    }

    /// Always rescan, refreshing the cache. Used for the "after" side of a
    /// diff, where a stale inventory would hide the child's side effects.
    pub fn capture_fresh(&self, root: &Path) -> Snapshot {
        let snapshot = scan(root);
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(snapshot.clone());
        }
        snapshot
    }
}

/// Paths present in `after` but not in `before`, sorted.
pub fn diff(before: &Snapshot, after: &Snapshot) -> Vec<PathBuf> {
    after.files.difference(&before.files).cloned().collect()
}

fn scan(root: &Path) -> Snapshot {
    let taken_at = Instant::now();
    let mut files = BTreeSet::new();

    if !root.is_dir() {
        warn!(root = %root.display(), "snapshot root missing, returning empty snapshot");
        return Snapshot {
            root: root.to_path_buf(),
            taken_at,
            files,
        };
    }

    let mut skipped = 0usize;
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| !is_excluded(entry));
    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_file() => {
                files.insert(entry.into_path());
            }
            Ok(_) => {}
            Err(err) => {
                debug!(root = %root.display(), err = %err, "snapshot entry skipped");
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        warn!(root = %root.display(), skipped, "snapshot scan skipped unreadable entries");
    }
    debug!(root = %root.display(), files = files.len(), "snapshot captured");

    Snapshot {
        root: root.to_path_buf(),
        taken_at,
        files,
    }
}

fn is_excluded(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && EXCLUDED_DIRS
            .iter()
            .any(|name| entry.file_name() == *name)
}
