//! Interactive "add a file to the file map" flow.
//!
//! Resolution order: the synced index first, then a live remote search.
//! When the search stays ambiguous the caller-supplied [`CandidateSelector`]
//! decides; the matching itself never waits on input.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::index::lookup_synced;
use crate::matcher::{hint_candidates, Candidate, PathMatcher, Resolution};
use crate::reconcile::relative_key;
use crate::remote::{RemoteError, RemoteExecutor};
use crate::store::{FileEntry, MappingStore, StoreError};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Invalid local path {path}: {reason}")]
    InvalidLocalPath { path: PathBuf, reason: String },
    #[error("File '{0}' not found on remote host")]
    RemoteFileNotFound(String),
    #[error("Multiple remote matches for '{local}' and no selection was made")]
    AmbiguousMatch {
        local: String,
        candidates: Vec<String>,
    },
    #[error("No tasks in the file map; provide a task name")]
    NoTask,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Outcome of asking a selector to choose among ambiguous candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// 1-based position in the candidate list.
    Chosen(usize),
    /// The operator declined every candidate (the "0" answer).
    Declined,
    /// No way to ask in this context.
    Unavailable,
}

pub trait CandidateSelector {
    fn select(&self, local: &str, candidates: &[Candidate]) -> Selection;
}

/// Selector for batch contexts: ambiguity is always reported as an error.
pub struct NonInteractive;

impl CandidateSelector for NonInteractive {
    fn select(&self, _local: &str, _candidates: &[Candidate]) -> Selection {
        Selection::Unavailable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    SyncedIndex,
    RemoteSearch,
    Selected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedPairing {
    pub key: u32,
    pub task: String,
    pub entry: FileEntry,
    pub source: ResolutionSource,
}

pub struct RemoteResolver<'a, E> {
    config: &'a SyncConfig,
    matcher: PathMatcher<E>,
}

impl<'a, E: RemoteExecutor> RemoteResolver<'a, E> {
    pub fn new(config: &'a SyncConfig, executor: E) -> Self {
        Self {
            config,
            matcher: PathMatcher::with_levels(executor, config.narrowing_levels),
        }
    }

    /// Checks that `local` names a regular file inside the local root and
    /// returns its root-relative key.
    pub fn validate_local(&self, local: &Path) -> Result<String, ResolveError> {
        let invalid = |reason: &str| ResolveError::InvalidLocalPath {
            path: local.to_path_buf(),
            reason: reason.to_string(),
        };
        let root = &self.config.local_root;
        let candidate = if local.is_absolute() {
            local.to_path_buf()
        } else {
            root.join(local)
        };
        if !candidate.is_file() {
            return Err(invalid("not a regular file under the local root"));
        }
        let canonical_root = root
            .canonicalize()
            .map_err(|err| invalid(&format!("cannot resolve local root: {err}")))?;
        let canonical = candidate
            .canonicalize()
            .map_err(|err| invalid(&err.to_string()))?;
        if !canonical.starts_with(&canonical_root) {
            return Err(invalid("outside the local root"));
        }
        let relative = relative_key(&canonical_root, &canonical);
        if Path::new(&relative)
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(invalid("outside the local root"));
        }
        Ok(relative)
    }

    /// Remote path for `relative`: the synced index when it knows the file,
    /// otherwise a live search narrowed by trailing path segments.
    pub fn resolve_remote(
        &self,
        relative: &str,
        selector: &dyn CandidateSelector,
    ) -> Result<(String, ResolutionSource), ResolveError> {
        if let Some(remote) = lookup_synced(&self.config.synced_index, relative) {
            debug!(local = relative, remote = %remote, "synced index hit");
            return Ok((remote, ResolutionSource::SyncedIndex));
        }

        let local_path = self.config.local_root.join(relative);
        let resolution = self
            .matcher
            .locate(&local_path.to_string_lossy(), &self.config.search_root)?;
        match resolution {
            Resolution::Unique(remote) => Ok((remote, ResolutionSource::RemoteSearch)),
            Resolution::NotFound => Err(ResolveError::RemoteFileNotFound(relative.to_string())),
            Resolution::Ambiguous(candidates) => {
                let hinted = hint_candidates(&candidates, relative);
                let ambiguous = || ResolveError::AmbiguousMatch {
                    local: relative.to_string(),
                    candidates: candidates.clone(),
                };
                match selector.select(relative, &hinted) {
                    Selection::Chosen(choice) if (1..=candidates.len()).contains(&choice) => {
                        Ok((candidates[choice - 1].clone(), ResolutionSource::Selected))
                    }
                    _ => Err(ambiguous()),
                }
            }
        }
    }

    /// Validates `local`, resolves its remote counterpart and records the
    /// pairing under `task` (or the most recently defined task).
    pub fn add_file(
        &self,
        store: &mut MappingStore,
        local: &Path,
        task: Option<&str>,
        selector: &dyn CandidateSelector,
    ) -> Result<AddedPairing, ResolveError> {
        let relative = self.validate_local(local)?;
        let task = match task.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => name.to_string(),
            None => store.last_task().ok_or(ResolveError::NoTask)?.to_string(),
        };
        let (remote, source) = self.resolve_remote(&relative, selector)?;
        let entry = FileEntry::new(relative, remote);
        let key = store.add(&task, entry.clone())?;
        info!(key, task = %task, local = %entry.local, remote = %entry.remote, "file added to map");
        Ok(AddedPairing {
            key,
            task,
            entry,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Always(Selection);

    impl CandidateSelector for Always {
        fn select(&self, _local: &str, _candidates: &[Candidate]) -> Selection {
            self.0
        }
    }

    #[test]
    fn non_interactive_never_selects() {
        assert_eq!(NonInteractive.select("a", &[]), Selection::Unavailable);
        assert_eq!(Always(Selection::Declined).select("a", &[]), Selection::Declined);
    }
}
