//! Bulk reconciliation of a whole local tree against the remote host.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::{IgnoreRules, SyncConfig};
use crate::index::{write_synced_index, IndexError, SyncedIndex};
use crate::matcher::{last_segment, PathMatcher, Resolution};
use crate::persist::{self, PersistError};
use crate::remote::{RemoteError, RemoteExecutor};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("Remote lookup for {file} failed: {source}")]
    Remote {
        file: String,
        #[source]
        source: RemoteError,
    },
    #[error("Failed to start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Observer for a long bulk run. `advanced` receives a monotonically
/// increasing count of finished lookups.
pub trait ReconcileProgress: Sync {
    fn started(&self, _total: usize) {}
    fn advanced(&self, _done: usize) {}
}

pub struct NoProgress;

impl ReconcileProgress for NoProgress {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub index: SyncedIndex,
    pub unresolved: Vec<String>,
    pub ambiguous: Vec<String>,
    pub scanned: usize,
    /// Lookups where `find` exited non-zero without reporting anything.
    pub failed_searches: usize,
}

impl ReconcileOutcome {
    pub fn resolved(&self) -> usize {
        self.index.len()
    }

    /// Every lookup failed, which usually means a wrong search root.
    pub fn all_searches_failed(&self) -> bool {
        self.scanned > 0 && self.failed_searches == self.scanned
    }
}

enum Classified {
    Resolved(String, String),
    Ambiguous(String),
    Unresolved(String),
}

/// Every regular file under `root` that survives the ignore rules, sorted.
/// Ignored folders are pruned without being descended into.
pub fn collect_local_files(root: &Path, ignore: &IgnoreRules) -> Result<Vec<PathBuf>, ReconcileError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !entry.file_type().is_dir()
            || !ignore.ignores_folder(&entry.file_name().to_string_lossy())
    });
    for entry in walker {
        let entry = entry.map_err(|source| ReconcileError::Walk {
            path: root.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if ignore.ignores_file(&entry.file_name().to_string_lossy()) {
            continue;
        }
        files.push(entry.into_path());
    }
    files.sort();
    Ok(files)
}

/// `path` relative to `root`, with forward slashes.
pub fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

pub struct BulkReconciler<E> {
    matcher: PathMatcher<E>,
    workers: usize,
}

impl<E: RemoteExecutor> BulkReconciler<E> {
    pub fn new(matcher: PathMatcher<E>, workers: usize) -> Self {
        Self {
            matcher,
            workers: workers.max(1),
        }
    }

    /// Looks up every retained file under `local_root` and classifies it as
    /// resolved, ambiguous or unresolved. Lookups run on a small bounded pool
    /// and results are merged per file, so the outcome does not depend on
    /// scheduling. The first remote failure aborts the run.
    pub fn reconcile_tree(
        &self,
        local_root: &Path,
        search_root: &str,
        ignore: &IgnoreRules,
        progress: &dyn ReconcileProgress,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let files = collect_local_files(local_root, ignore)?;
        progress.started(files.len());
        let done = AtomicUsize::new(0);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|idx| format!("pathsync-lookup-{idx}"))
            .build()?;
        let classified: Vec<(Classified, bool)> = pool.install(|| {
            files
                .par_iter()
                .map(|file| {
                    let result = self.classify(local_root, file, search_root);
                    let count = done.fetch_add(1, Ordering::SeqCst) + 1;
                    progress.advanced(count);
                    result
                })
                .collect::<Result<Vec<_>, _>>()
        })?;

        let mut outcome = ReconcileOutcome {
            scanned: files.len(),
            ..ReconcileOutcome::default()
        };
        for (item, failed) in classified {
            if failed {
                outcome.failed_searches += 1;
            }
            match item {
                Classified::Resolved(local, remote) => outcome.index.insert(local, remote),
                Classified::Ambiguous(local) => outcome.ambiguous.push(local),
                Classified::Unresolved(local) => outcome.unresolved.push(local),
            }
        }
        Ok(outcome)
    }

    fn classify(
        &self,
        local_root: &Path,
        file: &Path,
        search_root: &str,
    ) -> Result<(Classified, bool), ReconcileError> {
        let relative = relative_key(local_root, file);
        let local_path = file.to_string_lossy();
        let search = self
            .matcher
            .search(last_segment(&local_path), search_root)
            .map_err(|source| ReconcileError::Remote {
                file: relative.clone(),
                source,
            })?;
        let failed = search.failed();
        let classified = match self.matcher.resolve(search.candidates, &local_path) {
            Resolution::Unique(remote) => Classified::Resolved(relative, remote),
            Resolution::Ambiguous(_) => Classified::Ambiguous(relative),
            Resolution::NotFound => Classified::Unresolved(relative),
        };
        Ok((classified, failed))
    }
}

/// Runs a full reconciliation for `config` and replaces the persisted synced
/// index. A temporary file left over from an interrupted run is discarded
/// first; nothing is written unless every lookup completed.
pub fn rebuild_synced_index<E: RemoteExecutor>(
    config: &SyncConfig,
    executor: E,
    progress: &dyn ReconcileProgress,
) -> Result<ReconcileOutcome, ReconcileError> {
    if persist::discard_stale_temp(&config.synced_index)? {
        warn!(
            path = %persist::temp_path(&config.synced_index).display(),
            "removed temporary index left by an interrupted run"
        );
    }
    if let Some(branch) = git_branch(&config.local_root) {
        info!(branch = %branch, root = %config.local_root.display(), "reconciling local tree");
    }

    let matcher = PathMatcher::with_levels(executor, config.narrowing_levels);
    let reconciler = BulkReconciler::new(matcher, config.workers);
    let outcome = reconciler.reconcile_tree(
        &config.local_root,
        &config.search_root,
        &config.ignore,
        progress,
    )?;

    report(&outcome);
    write_synced_index(&config.synced_index, &outcome.index)?;
    info!(path = %config.synced_index.display(), entries = outcome.resolved(), "synced index saved");
    Ok(outcome)
}

fn report(outcome: &ReconcileOutcome) {
    info!(
        scanned = outcome.scanned,
        resolved = outcome.resolved(),
        unresolved = outcome.unresolved.len(),
        ambiguous = outcome.ambiguous.len(),
        "bulk reconciliation finished"
    );
    if !outcome.unresolved.is_empty() {
        warn!(files = ?outcome.unresolved, "files not found on remote host");
    }
    if !outcome.ambiguous.is_empty() {
        warn!(files = ?outcome.ambiguous, "multiple remote matches for files");
    }
    if outcome.all_searches_failed() {
        warn!(
            searches = outcome.failed_searches,
            "every remote search failed; check search_root"
        );
    }
}

/// Current branch of the checkout at `root`, if it is a git work tree.
pub fn git_branch(root: &Path) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let branch = String::from_utf8(output.stdout).ok()?;
    let branch = branch.trim();
    (!branch.is_empty()).then(|| branch.to_string())
}
