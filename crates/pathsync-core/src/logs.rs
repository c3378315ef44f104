//! Retention for the dated log files written by the CLI.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_RETENTION_DAYS: u64 = 30;
pub const LOG_FILE_PREFIX: &str = "pathsync.log";

#[derive(Debug, Error)]
pub enum LogsError {
    #[error("Log directory does not exist: {0}")]
    MissingDir(PathBuf),
    #[error("Failed to prune logs: {0}")]
    Io(#[from] std::io::Error),
}

/// Deletes log files in `dir` last modified more than `keep_days` days
/// before `now`. Only regular files named with [`LOG_FILE_PREFIX`] are
/// considered. Returns the removed paths, sorted.
pub fn prune_logs(dir: &Path, keep_days: u64, now: SystemTime) -> Result<Vec<PathBuf>, LogsError> {
    if !dir.is_dir() {
        return Err(LogsError::MissingDir(dir.to_path_buf()));
    }
    let window = Duration::from_secs(keep_days.saturating_mul(86_400));
    let cutoff = now.checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let is_log = entry
            .file_name()
            .to_string_lossy()
            .starts_with(LOG_FILE_PREFIX);
        if !metadata.is_file() || !is_log {
            continue;
        }
        let modified = metadata.modified().unwrap_or(now);
        if modified < cutoff {
            fs::remove_file(entry.path())?;
            removed.push(entry.path());
        }
    }
    removed.sort();
    if removed.is_empty() {
        info!(dir = %dir.display(), "no logs were deleted");
    } else {
        warn!(count = removed.len(), files = ?removed, "deleted old log files");
    }
    Ok(removed)
}

/// Name of today's file under daily rotation, which is keyed by UTC date.
pub fn todays_log_name() -> String {
    format!("{}.{}", LOG_FILE_PREFIX, chrono::Utc::now().format("%Y-%m-%d"))
}
