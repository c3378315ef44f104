//! Locating a local file's counterpart on the remote host.

use tracing::debug;

use crate::config::DEFAULT_NARROWING_LEVELS;
use crate::remote::{RemoteError, RemoteExecutor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Unique(String),
    Ambiguous(Vec<String>),
    NotFound,
}

/// A remote path offered for manual selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: String,
    /// Parent directory name equals the local file's parent directory name.
    pub hinted: bool,
}

/// Raw result of one remote `find`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    pub candidates: Vec<String>,
    pub exit_code: i32,
}

impl Search {
    /// `find` failed outright: non-zero status and nothing reported.
    pub fn failed(&self) -> bool {
        self.exit_code != 0 && self.candidates.is_empty()
    }
}

pub struct PathMatcher<E> {
    executor: E,
    max_levels: usize,
}

impl<E: RemoteExecutor> PathMatcher<E> {
    pub fn new(executor: E) -> Self {
        Self::with_levels(executor, DEFAULT_NARROWING_LEVELS)
    }

    pub fn with_levels(executor: E, max_levels: usize) -> Self {
        Self {
            executor,
            max_levels: max_levels.max(1),
        }
    }

    pub fn max_levels(&self) -> usize {
        self.max_levels
    }

    /// Every path under `search_root` whose last segment is `filename`.
    ///
    /// `find` exits non-zero when parts of the tree are unreadable but still
    /// reports what it could see, so only stdout is considered. `-name`
    /// treats `*?[` as a pattern, so lines whose last segment is not exactly
    /// `filename` are dropped.
    pub fn find_candidates(
        &self,
        filename: &str,
        search_root: &str,
    ) -> Result<Vec<String>, RemoteError> {
        Ok(self.search(filename, search_root)?.candidates)
    }

    /// Like [`find_candidates`](Self::find_candidates), keeping the exit status.
    pub fn search(&self, filename: &str, search_root: &str) -> Result<Search, RemoteError> {
        let argv = vec![
            "find".to_string(),
            search_root.to_string(),
            "-name".to_string(),
            filename.to_string(),
        ];
        let output = self.executor.execute(&argv)?;
        let candidates: Vec<String> = output
            .lines()
            .into_iter()
            .filter(|line| last_segment(line) == filename)
            .collect();
        debug!(
            filename,
            search_root,
            exit_code = output.exit_code,
            found = candidates.len(),
            "remote search"
        );
        Ok(Search {
            candidates,
            exit_code: output.exit_code,
        })
    }

    pub fn resolve(&self, candidates: Vec<String>, local_path: &str) -> Resolution {
        narrow(candidates, local_path, self.max_levels)
    }

    /// Searches for the basename of `local_path` and narrows the result.
    pub fn locate(&self, local_path: &str, search_root: &str) -> Result<Resolution, RemoteError> {
        let filename = last_segment(local_path);
        let candidates = self.find_candidates(filename, search_root)?;
        Ok(self.resolve(candidates, local_path))
    }
}

/// Narrows same-basename candidates by comparing `levels + 1` trailing path
/// segments with the local path, for `levels` in `1..=max_levels`.
///
/// A level that would eliminate every candidate ends narrowing with the
/// previous survivors.
pub fn narrow(candidates: Vec<String>, local_path: &str, max_levels: usize) -> Resolution {
    let mut survivors = candidates;
    match survivors.len() {
        0 => return Resolution::NotFound,
        1 => return Resolution::Unique(survivors.remove(0)),
        _ => {}
    }
    for levels in 1..=max_levels {
        let local_tail = trailing_segments(local_path, levels + 1);
        let filtered: Vec<String> = survivors
            .iter()
            .filter(|candidate| trailing_segments(candidate, levels + 1) == local_tail)
            .cloned()
            .collect();
        match filtered.len() {
            0 => break,
            1 => return Resolution::Unique(filtered.into_iter().next().unwrap_or_default()),
            _ => survivors = filtered,
        }
    }
    Resolution::Ambiguous(survivors)
}

/// Flags candidates that share the local file's parent directory name.
pub fn hint_candidates(candidates: &[String], local_path: &str) -> Vec<Candidate> {
    let local_parent = trailing_segments(local_path, 2);
    let local_parent = (local_parent.len() == 2).then(|| local_parent[0]);
    candidates
        .iter()
        .map(|path| {
            let tail = trailing_segments(path, 2);
            let hinted = tail.len() == 2 && Some(tail[0]) == local_parent;
            Candidate {
                path: path.clone(),
                hinted,
            }
        })
        .collect()
}

fn segments(path: &str) -> Vec<&str> {
    path.split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect()
}

/// The last `count` segments of `path` (fewer if the path is shorter).
pub fn trailing_segments(path: &str, count: usize) -> Vec<&str> {
    let all = segments(path);
    let start = all.len().saturating_sub(count);
    all[start..].to_vec()
}

pub fn last_segment(path: &str) -> &str {
    segments(path).last().copied().unwrap_or(path)
}
