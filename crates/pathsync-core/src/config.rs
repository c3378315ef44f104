//! Layered configuration.
//!
//! Built-in defaults, the global `$PATHSYNC_HOME/config.toml`, the nearest
//! project `pathsync.toml` and command-line overrides are merged once into a
//! [`ConfigLayer`], then validated into an immutable [`SyncConfig`].

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SEARCH_ROOT: &str = "/";
pub const DEFAULT_FILE_MAP: &str = "file_map.yaml";
pub const DEFAULT_SYNCED_INDEX: &str = "synced_file_map.yaml";
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/pathsync_socket";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_WORKERS: usize = 4;
pub const MAX_WORKERS: usize = 8;
pub const DEFAULT_NARROWING_LEVELS: usize = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// One layer of configuration as written in a TOML file. Every field is
/// optional so layers can be stacked; unknown keys are rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    pub local_root: Option<PathBuf>,
    pub search_root: Option<String>,
    pub file_map: Option<PathBuf>,
    pub synced_index: Option<PathBuf>,
    pub workers: Option<usize>,
    pub narrowing_levels: Option<usize>,
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub remote: RemoteLayer,
    #[serde(default)]
    pub ignore: IgnoreLayer,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RemoteLayer {
    pub host: Option<String>,
    pub username: Option<String>,
    pub port: Option<u16>,
    pub persistent: Option<bool>,
    pub control_socket: Option<PathBuf>,
    /// Extra ssh arguments, split with shell quoting rules.
    pub ssh_options: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IgnoreLayer {
    pub folders: Option<Vec<String>>,
    pub extensions: Option<Vec<String>>,
    pub files: Option<Vec<String>>,
}

impl ConfigLayer {
    /// Reads a layer and rebases its relative paths onto the file's directory.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let mut layer: ConfigLayer = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(base) = path.parent() {
            layer.rebase(base);
        }
        Ok(layer)
    }

    fn rebase(&mut self, base: &Path) {
        for path in [
            &mut self.local_root,
            &mut self.file_map,
            &mut self.synced_index,
            &mut self.log_dir,
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Overlays `other` on top of `self`: any value set in `other` wins.
    pub fn merge(mut self, other: ConfigLayer) -> Self {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }
        take(&mut self.local_root, other.local_root);
        take(&mut self.search_root, other.search_root);
        take(&mut self.file_map, other.file_map);
        take(&mut self.synced_index, other.synced_index);
        take(&mut self.workers, other.workers);
        take(&mut self.narrowing_levels, other.narrowing_levels);
        take(&mut self.log_dir, other.log_dir);
        take(&mut self.remote.host, other.remote.host);
        take(&mut self.remote.username, other.remote.username);
        take(&mut self.remote.port, other.remote.port);
        take(&mut self.remote.persistent, other.remote.persistent);
        take(&mut self.remote.control_socket, other.remote.control_socket);
        take(&mut self.remote.ssh_options, other.remote.ssh_options);
        take(&mut self.ignore.folders, other.ignore.folders);
        take(&mut self.ignore.extensions, other.ignore.extensions);
        take(&mut self.ignore.files, other.ignore.files);
        self
    }

    pub fn file_map_path(&self) -> PathBuf {
        self.file_map
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FILE_MAP))
    }

    pub fn synced_index_path(&self) -> PathBuf {
        self.synced_index
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SYNCED_INDEX))
    }

    /// Validates the merged layers into the immutable runtime configuration.
    pub fn build(self) -> Result<SyncConfig, ConfigError> {
        let local_root = self.local_root.clone().ok_or(ConfigError::Missing("local_root"))?;
        if !local_root.is_dir() {
            return Err(ConfigError::Invalid {
                field: "local_root",
                reason: format!("{} is not a directory", local_root.display()),
            });
        }
        let narrowing_levels = self.narrowing_levels.unwrap_or(DEFAULT_NARROWING_LEVELS);
        if narrowing_levels == 0 {
            return Err(ConfigError::Invalid {
                field: "narrowing_levels",
                reason: "must be at least 1".to_string(),
            });
        }
        let ssh_options = match self.remote.ssh_options.as_deref() {
            Some(raw) => shell_words::split(raw).map_err(|err| ConfigError::Invalid {
                field: "remote.ssh_options",
                reason: err.to_string(),
            })?,
            None => Vec::new(),
        };
        let host = self
            .remote
            .host
            .clone()
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigError::Missing("remote.host"))?;
        let username = self
            .remote
            .username
            .clone()
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigError::Missing("remote.username"))?;

        Ok(SyncConfig {
            file_map: self.file_map_path(),
            synced_index: self.synced_index_path(),
            local_root,
            search_root: self
                .search_root
                .unwrap_or_else(|| DEFAULT_SEARCH_ROOT.to_string()),
            workers: self.workers.unwrap_or(DEFAULT_WORKERS).clamp(1, MAX_WORKERS),
            narrowing_levels,
            log_dir: self.log_dir,
            remote: RemoteConfig {
                host,
                username,
                port: self.remote.port.unwrap_or(DEFAULT_SSH_PORT),
                persistent: self.remote.persistent.unwrap_or(true),
                control_socket: self
                    .remote
                    .control_socket
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTROL_SOCKET)),
                ssh_options,
            },
            ignore: IgnoreRules::new(
                self.ignore.folders.unwrap_or_else(default_ignored_folders),
                self.ignore.extensions.unwrap_or_else(default_ignored_extensions),
                self.ignore.files.unwrap_or_else(default_ignored_files),
            ),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub local_root: PathBuf,
    pub search_root: String,
    pub file_map: PathBuf,
    pub synced_index: PathBuf,
    pub workers: usize,
    pub narrowing_levels: usize,
    pub log_dir: Option<PathBuf>,
    pub remote: RemoteConfig,
    pub ignore: IgnoreRules,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteConfig {
    pub host: String,
    pub username: String,
    pub port: u16,
    pub persistent: bool,
    pub control_socket: PathBuf,
    pub ssh_options: Vec<String>,
}

impl RemoteConfig {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Folder, extension and file-name exclusions applied to the local tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IgnoreRules {
    pub folders: Vec<String>,
    pub extensions: Vec<String>,
    pub files: Vec<String>,
}

impl IgnoreRules {
    /// Extensions are stored with a leading dot whether or not one was given.
    pub fn new(folders: Vec<String>, extensions: Vec<String>, files: Vec<String>) -> Self {
        let extensions = extensions
            .into_iter()
            .map(|ext| {
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{ext}")
                }
            })
            .collect();
        Self {
            folders,
            extensions,
            files,
        }
    }

    pub fn ignores_folder(&self, name: &str) -> bool {
        self.folders.iter().any(|folder| folder == name)
    }

    pub fn ignores_file(&self, name: &str) -> bool {
        if self.files.iter().any(|file| file == name) {
            return true;
        }
        match Path::new(name).extension() {
            Some(ext) => {
                let suffix = format!(".{}", ext.to_string_lossy());
                self.extensions.iter().any(|candidate| *candidate == suffix)
            }
            None => false,
        }
    }
}

pub fn default_ignored_folders() -> Vec<String> {
    [".idea", ".git", "__pycache__", ".ruff_cache"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn default_ignored_extensions() -> Vec<String> {
    vec![".log".to_string()]
}

pub fn default_ignored_files() -> Vec<String> {
    [".gitignore", "README.md", "LICENSE", ".pre-commit-config.yaml"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn config_filename_candidates() -> [&'static str; 2] {
    ["pathsync.toml", ".pathsync.toml"]
}

/// Non-blank value of the environment variable `name`, as a path.
fn env_dir(name: &str) -> Option<PathBuf> {
    let value = std::env::var_os(name)?;
    let text = value.to_string_lossy();
    let text = text.trim();
    (!text.is_empty()).then(|| PathBuf::from(text))
}

pub fn resolve_user_home_dir() -> Option<PathBuf> {
    env_dir("HOME").or_else(|| env_dir("USERPROFILE"))
}

/// `$PATHSYNC_HOME`, else `~/.pathsync`.
pub fn resolve_pathsync_home_dir() -> Option<PathBuf> {
    env_dir("PATHSYNC_HOME").or_else(|| resolve_user_home_dir().map(|home| home.join(".pathsync")))
}

pub fn global_config_path() -> Option<PathBuf> {
    resolve_pathsync_home_dir().map(|home| home.join("config.toml"))
}

/// Nearest project config file at or above `start`.
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    for candidate in start.ancestors() {
        for name in config_filename_candidates() {
            let path = candidate.join(name);
            if path.is_file() {
                return Some(path);
            }
        }
    }
    None
}

/// Stacks defaults, the global file, the project file (explicit or
/// discovered from `cwd`) and finally `overrides`.
pub fn load_layers(
    explicit: Option<&Path>,
    cwd: &Path,
    overrides: ConfigLayer,
) -> Result<ConfigLayer, ConfigError> {
    let mut merged = ConfigLayer::default();
    if let Some(global) = global_config_path().filter(|path| path.is_file()) {
        merged = merged.merge(ConfigLayer::from_file(&global)?);
    }
    let project = match explicit {
        Some(path) if path.is_file() => Some(path.to_path_buf()),
        Some(path) => return Err(ConfigError::NotFound(path.to_path_buf())),
        None => find_config_file(cwd),
    };
    if let Some(path) = project {
        merged = merged.merge(ConfigLayer::from_file(&path)?);
    }
    Ok(merged.merge(overrides))
}
