//! The synced index: a rebuildable `local relative path -> remote path` cache
//! produced by a bulk reconciliation run.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::persist::{self, PersistError};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Persist(#[from] PersistError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncedIndex {
    entries: BTreeMap<String, String>,
}

impl SyncedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, local: impl Into<String>, remote: impl Into<String>) {
        self.entries.insert(local.into(), remote.into());
    }

    pub fn get(&self, local: &str) -> Option<&str> {
        self.entries.get(local).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(local, remote)| (local.as_str(), remote.as_str()))
    }
}

impl FromIterator<(String, String)> for SyncedIndex {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Loads the index if it exists. An empty file counts as an empty index.
pub fn load_synced_index(path: &Path) -> Result<Option<SyncedIndex>, IndexError> {
    let loaded: Option<Option<SyncedIndex>> = persist::read_yaml(path)?;
    Ok(loaded.map(Option::unwrap_or_default))
}

/// Best-effort lookup used by the interactive add flow: a missing or
/// unreadable index is treated as absent.
pub fn lookup_synced(path: &Path, local: &str) -> Option<String> {
    match load_synced_index(path) {
        Ok(Some(index)) => index.get(local).map(str::to_string),
        Ok(None) => None,
        Err(err) => {
            warn!(path = %path.display(), %err, "ignoring unreadable synced index");
            None
        }
    }
}

/// Writes the index through a temporary sibling and renames it into place.
pub fn write_synced_index(path: &Path, index: &SyncedIndex) -> Result<(), IndexError> {
    persist::write_yaml_atomic(path, index)?;
    Ok(())
}
