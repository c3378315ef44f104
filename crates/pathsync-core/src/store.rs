//! The file map: named tasks grouping numbered local/remote pairings.
//!
//! On disk the store is a YAML mapping of task name to a mapping of integer
//! key to a two-element `[local, remote]` list. Task order and per-task key
//! order are preserved. Keys are unique across the whole store.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::debug;

use crate::persist::{self, PersistError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Key {0} not found in file map")]
    KeyNotFound(u32),
    #[error("Task '{0}' not found in file map")]
    TaskNotFound(String),
    #[error("Key {key} appears in both task '{first}' and task '{second}'")]
    DuplicateKey {
        key: u32,
        first: String,
        second: String,
    },
    #[error("Task '{0}' is defined more than once")]
    DuplicateTask(String),
    #[error("Invalid key {key:?} in task '{task}': keys must be positive integers")]
    InvalidKey { task: String, key: String },
    #[error("Malformed file map: {0}")]
    Malformed(String),
    #[error("Task name must not be empty")]
    EmptyTaskName,
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// A local/remote path pair, stored as `[local, remote]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct FileEntry {
    pub local: String,
    pub remote: String,
}

impl FileEntry {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }

    /// Last segment of the local path, as shown in listings.
    pub fn local_name(&self) -> &str {
        crate::matcher::last_segment(&self.local)
    }
}

impl From<(String, String)> for FileEntry {
    fn from((local, remote): (String, String)) -> Self {
        Self { local, remote }
    }
}

impl From<FileEntry> for (String, String) {
    fn from(entry: FileEntry) -> Self {
        (entry.local, entry.remote)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGroup {
    pub name: String,
    pub entries: Vec<(u32, FileEntry)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub task: String,
    pub key: u32,
    pub entry: FileEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySelection {
    All,
    Task(String),
    Keys(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingStore {
    path: PathBuf,
    tasks: Vec<TaskGroup>,
}

impl MappingStore {
    /// Loads the store at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let raw: Option<Value> = persist::read_yaml(&path)?;
        let tasks = match raw {
            Some(value) => parse_tasks(value)?,
            None => Vec::new(),
        };
        debug!(path = %path.display(), tasks = tasks.len(), "file map loaded");
        Ok(Self { path, tasks })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[TaskGroup] {
        &self.tasks
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|task| task.name.as_str()).collect()
    }

    /// The most recently defined task, used when no task is named.
    pub fn last_task(&self) -> Option<&str> {
        self.tasks.last().map(|task| task.name.as_str())
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.tasks.iter().any(|task| task.name == name)
    }

    pub fn list(&self) -> Vec<ListedEntry> {
        self.tasks
            .iter()
            .flat_map(|task| {
                task.entries.iter().map(move |(key, entry)| ListedEntry {
                    task: task.name.clone(),
                    key: *key,
                    entry: entry.clone(),
                })
            })
            .collect()
    }

    pub fn keys(&self) -> BTreeSet<u32> {
        self.tasks
            .iter()
            .flat_map(|task| task.entries.iter().map(|(key, _)| *key))
            .collect()
    }

    pub fn get(&self, key: u32) -> Result<&FileEntry, StoreError> {
        self.locate(key).map(|(_, entry)| entry)
    }

    /// The entry for `key` together with its owning task.
    pub fn info(&self, key: u32) -> Result<ListedEntry, StoreError> {
        let (task, entry) = self.locate(key)?;
        Ok(ListedEntry {
            task: task.to_string(),
            key,
            entry: entry.clone(),
        })
    }

    fn locate(&self, key: u32) -> Result<(&str, &FileEntry), StoreError> {
        self.tasks
            .iter()
            .find_map(|task| {
                task.entries
                    .iter()
                    .find(|(candidate, _)| *candidate == key)
                    .map(|(_, entry)| (task.name.as_str(), entry))
            })
            .ok_or(StoreError::KeyNotFound(key))
    }

    /// Smallest positive integer not used as a key anywhere in the store.
    pub fn next_key(&self) -> u32 {
        let used = self.keys();
        (1..).find(|key| !used.contains(key)).unwrap_or(u32::MAX)
    }

    pub fn add(&mut self, task: &str, entry: FileEntry) -> Result<u32, StoreError> {
        if task.trim().is_empty() {
            return Err(StoreError::EmptyTaskName);
        }
        let key = self.next_key();
        let mut next = self.tasks.clone();
        match next.iter().position(|group| group.name == task) {
            Some(idx) => next[idx].entries.push((key, entry)),
            None => next.push(TaskGroup {
                name: task.to_string(),
                entries: vec![(key, entry)],
            }),
        }
        self.commit(next)?;
        Ok(key)
    }

    /// Removes one entry; a task left without entries is removed with it.
    pub fn delete(&mut self, key: u32) -> Result<ListedEntry, StoreError> {
        let removed = self.info(key)?;
        let mut next = self.tasks.clone();
        for group in next.iter_mut() {
            group.entries.retain(|(candidate, _)| *candidate != key);
        }
        next.retain(|group| !group.entries.is_empty());
        self.commit(next)?;
        Ok(removed)
    }

    /// Removes a task and all of its entries, returning the freed keys.
    pub fn delete_task(&mut self, task: &str) -> Result<Vec<u32>, StoreError> {
        let group = self
            .tasks
            .iter()
            .find(|group| group.name == task)
            .ok_or_else(|| StoreError::TaskNotFound(task.to_string()))?;
        let keys = group.entries.iter().map(|(key, _)| *key).collect();
        let next = self
            .tasks
            .iter()
            .filter(|group| group.name != task)
            .cloned()
            .collect();
        self.commit(next)?;
        Ok(keys)
    }

    /// Entries chosen for a synchronization run, in store order for `All`
    /// and `Task`, in the requested order for `Keys`.
    pub fn select(&self, selection: &EntrySelection) -> Result<Vec<ListedEntry>, StoreError> {
        match selection {
            EntrySelection::All => Ok(self.list()),
            EntrySelection::Task(name) => {
                if !self.has_task(name) {
                    return Err(StoreError::TaskNotFound(name.clone()));
                }
                Ok(self
                    .list()
                    .into_iter()
                    .filter(|listed| listed.task == *name)
                    .collect())
            }
            EntrySelection::Keys(keys) => keys.iter().map(|key| self.info(*key)).collect(),
        }
    }

    pub fn to_yaml_value(&self) -> Value {
        tasks_to_value(&self.tasks)
    }

    /// Persists `next` and only then makes it the in-memory state, so a
    /// failed write leaves both the file and this value unchanged.
    fn commit(&mut self, next: Vec<TaskGroup>) -> Result<(), StoreError> {
        persist::write_yaml_atomic(&self.path, &tasks_to_value(&next))?;
        self.tasks = next;
        debug!(path = %self.path.display(), "file map saved");
        Ok(())
    }

    /// Writes the current state to `path` as-is.
    pub fn save(&self) -> Result<(), StoreError> {
        persist::write_yaml_atomic(&self.path, &self.to_yaml_value())?;
        Ok(())
    }
}

fn tasks_to_value(tasks: &[TaskGroup]) -> Value {
    let mut root = Mapping::new();
    for task in tasks {
        let mut entries = Mapping::new();
        for (key, entry) in &task.entries {
            entries.insert(
                Value::from(*key),
                Value::Sequence(vec![
                    Value::String(entry.local.clone()),
                    Value::String(entry.remote.clone()),
                ]),
            );
        }
        root.insert(Value::String(task.name.clone()), Value::Mapping(entries));
    }
    Value::Mapping(root)
}

fn parse_tasks(value: Value) -> Result<Vec<TaskGroup>, StoreError> {
    let root = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Mapping(map) => map,
        other => {
            return Err(StoreError::Malformed(format!(
                "expected a mapping of tasks, found {}",
                kind(&other)
            )))
        }
    };

    let mut owners: HashMap<u32, String> = HashMap::new();
    let mut names: HashSet<String> = HashSet::new();
    let mut tasks = Vec::new();
    for (name, body) in root {
        let name = scalar_text(&name)
            .ok_or_else(|| StoreError::Malformed("task names must be scalars".to_string()))?;
        // `1` and `'1'` are distinct YAML keys but the same task once saved.
        if !names.insert(name.clone()) {
            return Err(StoreError::DuplicateTask(name));
        }
        let entries_map = match body {
            Value::Null => continue,
            Value::Mapping(map) => map,
            other => {
                return Err(StoreError::Malformed(format!(
                    "task '{name}' must be a mapping, found {}",
                    kind(&other)
                )))
            }
        };
        let mut entries = Vec::new();
        for (raw_key, raw_entry) in entries_map {
            let key = parse_key(&name, &raw_key)?;
            if let Some(first) = owners.get(&key) {
                return Err(StoreError::DuplicateKey {
                    key,
                    first: first.clone(),
                    second: name,
                });
            }
            owners.insert(key, name.clone());
            let entry: FileEntry = serde_yaml::from_value(raw_entry).map_err(|err| {
                StoreError::Malformed(format!("entry {key} in task '{name}': {err}"))
            })?;
            entries.push((key, entry));
        }
        if entries.is_empty() {
            continue;
        }
        tasks.push(TaskGroup { name, entries });
    }
    Ok(tasks)
}

fn parse_key(task: &str, raw: &Value) -> Result<u32, StoreError> {
    let invalid = || StoreError::InvalidKey {
        task: task.to_string(),
        key: scalar_text(raw).unwrap_or_else(|| kind(raw).to_string()),
    };
    let key = match raw {
        Value::Number(number) => number.as_u64().ok_or_else(invalid)?,
        Value::String(text) => text.trim().parse::<u64>().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };
    match u32::try_from(key) {
        Ok(key) if key > 0 => Ok(key),
        _ => Err(invalid()),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
