//! YAML persistence with whole-file atomic replacement.
//!
//! Every writer in the crate goes through [`write_yaml_atomic`]: the document
//! is serialized in memory first, written to a sibling temporary file, flushed
//! and then renamed over the destination. A failure at any step leaves the
//! previous file untouched.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Failed to serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

impl PersistError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        PersistError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Sibling path used while a new version of `path` is being written.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Reads and deserializes a YAML document. Returns `Ok(None)` when the file
/// does not exist.
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(PersistError::io(path, err)),
    };
    serde_yaml::from_str(&raw)
        .map(Some)
        .map_err(|source| PersistError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

pub fn write_yaml_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let body = serde_yaml::to_string(value).map_err(|source| PersistError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, body.as_bytes())
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| PersistError::io(parent, err))?;
        }
    }
    let tmp = temp_path(path);
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp);
        return Err(PersistError::io(path, err));
    }
    Ok(())
}

/// Removes a temporary file left behind by an interrupted write of `path`.
/// Returns true when one was found.
pub fn discard_stale_temp(path: &Path) -> Result<bool, PersistError> {
    let tmp = temp_path(path);
    match fs::remove_file(&tmp) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(PersistError::io(&tmp, err)),
    }
}
