use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use pathsync_core::config::{ConfigLayer, IgnoreRules, RemoteLayer};
use pathsync_core::index::load_synced_index;
use pathsync_core::matcher::PathMatcher;
use pathsync_core::persist::temp_path;
use pathsync_core::reconcile::{
    rebuild_synced_index, BulkReconciler, NoProgress, ReconcileError, ReconcileProgress,
};
use pathsync_core::remote::{RemoteError, RemoteExecutor, RemoteOutput};

/// Answers `find <root> -name <file>` from a canned `file name -> stdout` table.
struct CannedFind {
    answers: HashMap<String, String>,
    asked: Mutex<Vec<String>>,
}

impl CannedFind {
    fn new(answers: &[(&str, &str)]) -> Self {
        Self {
            answers: answers
                .iter()
                .map(|(name, stdout)| (name.to_string(), stdout.to_string()))
                .collect(),
            asked: Mutex::new(Vec::new()),
        }
    }

    fn asked(&self) -> Vec<String> {
        let mut asked = self.asked.lock().expect("lock").clone();
        asked.sort();
        asked
    }
}

impl RemoteExecutor for CannedFind {
    fn execute(&self, argv: &[String]) -> Result<RemoteOutput, RemoteError> {
        let name = argv.get(3).cloned().unwrap_or_default();
        self.asked.lock().expect("lock").push(name.clone());
        let stdout = self.answers.get(&name).cloned().unwrap_or_default();
        Ok(RemoteOutput {
            stdout,
            exit_code: 0,
        })
    }
}

/// `find` over a search root that does not exist.
struct MissingRoot;

impl RemoteExecutor for MissingRoot {
    fn execute(&self, _argv: &[String]) -> Result<RemoteOutput, RemoteError> {
        Ok(RemoteOutput {
            stdout: String::new(),
            exit_code: 1,
        })
    }
}

struct Unreachable;

impl RemoteExecutor for Unreachable {
    fn execute(&self, _argv: &[String]) -> Result<RemoteOutput, RemoteError> {
        Err(RemoteError::Connection {
            destination: "deploy@vm".to_string(),
            stderr: "Connection refused".to_string(),
        })
    }
}

#[derive(Default)]
struct Counting {
    total: AtomicUsize,
    last: AtomicUsize,
    calls: AtomicUsize,
}

impl ReconcileProgress for Counting {
    fn started(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
    }

    fn advanced(&self, done: usize) {
        self.last.fetch_max(done, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

fn touch(root: &Path, rel: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().expect("parent")).expect("dirs");
    fs::write(path, rel).expect("write");
}

fn no_ignores() -> IgnoreRules {
    IgnoreRules::new(Vec::new(), Vec::new(), Vec::new())
}

#[test]
fn ignored_folder_is_never_looked_up() {
    let temp = TempDir::new().expect("tempdir");
    touch(temp.path(), "a/one.txt");
    touch(temp.path(), "b/two.txt");
    let executor = CannedFind::new(&[
        ("one.txt", "/srv/a/one.txt\n"),
        ("two.txt", "/srv/b/two.txt\n"),
    ]);
    let reconciler = BulkReconciler::new(PathMatcher::new(&executor), 4);
    let ignore = IgnoreRules::new(vec!["b".to_string()], Vec::new(), Vec::new());

    let outcome = reconciler
        .reconcile_tree(temp.path(), "/srv", &ignore, &NoProgress)
        .expect("reconcile");

    let entries: Vec<(&str, &str)> = outcome.index.iter().collect();
    assert_eq!(entries, vec![("a/one.txt", "/srv/a/one.txt")]);
    assert_eq!(executor.asked(), vec!["one.txt"]);
    assert_eq!(outcome.scanned, 1);
}

#[test]
fn files_are_classified_exactly_once() {
    let temp = TempDir::new().expect("tempdir");
    for rel in ["app/main.conf", "x/y/dup.conf", "lost.txt", "lib/util.py"] {
        touch(temp.path(), rel);
    }
    let executor = CannedFind::new(&[
        ("main.conf", "/srv/app/main.conf\n/srv/other/main.conf\n"),
        ("dup.conf", "/srv/a/x/dup.conf\n/srv/b/x/dup.conf\n"),
        ("util.py", "/opt/site/lib/util.py\n"),
    ]);
    let progress = Counting::default();
    let reconciler = BulkReconciler::new(PathMatcher::new(&executor), 3);

    let outcome = reconciler
        .reconcile_tree(temp.path(), "/", &no_ignores(), &progress)
        .expect("reconcile");

    assert_eq!(outcome.index.get("app/main.conf"), Some("/srv/app/main.conf"));
    assert_eq!(outcome.index.get("lib/util.py"), Some("/opt/site/lib/util.py"));
    assert_eq!(outcome.ambiguous, vec!["x/y/dup.conf".to_string()]);
    assert_eq!(outcome.unresolved, vec!["lost.txt".to_string()]);
    assert_eq!(
        outcome.resolved() + outcome.ambiguous.len() + outcome.unresolved.len(),
        outcome.scanned
    );
    assert_eq!(progress.total.load(Ordering::SeqCst), 4);
    assert_eq!(progress.last.load(Ordering::SeqCst), 4);
    assert_eq!(progress.calls.load(Ordering::SeqCst), 4);
}

fn config_for(temp: &TempDir, local_root: &Path) -> pathsync_core::config::SyncConfig {
    ConfigLayer {
        local_root: Some(local_root.to_path_buf()),
        search_root: Some("/srv".to_string()),
        synced_index: Some(temp.path().join("synced_file_map.yaml")),
        file_map: Some(temp.path().join("file_map.yaml")),
        remote: RemoteLayer {
            host: Some("vm".to_string()),
            username: Some("deploy".to_string()),
            ..RemoteLayer::default()
        },
        ..ConfigLayer::default()
    }
    .build()
    .expect("config")
}

#[test]
fn rebuild_discards_stale_temp_and_writes_index() {
    let temp = TempDir::new().expect("tempdir");
    let local = temp.path().join("checkout");
    touch(&local, "a/one.txt");
    let config = config_for(&temp, &local);
    fs::write(temp_path(&config.synced_index), "half-written: [").expect("stale temp");

    let executor = CannedFind::new(&[("one.txt", "/srv/a/one.txt\n")]);
    let outcome = rebuild_synced_index(&config, &executor, &NoProgress).expect("rebuild");

    assert_eq!(outcome.resolved(), 1);
    assert!(!temp_path(&config.synced_index).exists());
    let index = load_synced_index(&config.synced_index)
        .expect("load")
        .expect("present");
    assert_eq!(index.get("a/one.txt"), Some("/srv/a/one.txt"));
}

#[test]
fn remote_failure_keeps_previous_index() {
    let temp = TempDir::new().expect("tempdir");
    let local = temp.path().join("checkout");
    touch(&local, "a/one.txt");
    let config = config_for(&temp, &local);
    fs::write(&config.synced_index, "a/one.txt: /srv/old/one.txt\n").expect("previous index");

    let err = rebuild_synced_index(&config, Unreachable, &NoProgress).expect_err("must fail");
    assert!(matches!(err, ReconcileError::Remote { .. }));
    assert_eq!(
        fs::read_to_string(&config.synced_index).expect("read"),
        "a/one.txt: /srv/old/one.txt\n"
    );
    assert!(!temp_path(&config.synced_index).exists());
}

#[test]
fn failed_searches_are_counted() {
    let temp = TempDir::new().expect("tempdir");
    let local = temp.path().join("checkout");
    touch(&local, "a/one.txt");
    touch(&local, "b/two.txt");
    let config = config_for(&temp, &local);

    let outcome = rebuild_synced_index(&config, MissingRoot, &NoProgress).expect("rebuild");
    assert_eq!(outcome.failed_searches, 2);
    assert!(outcome.all_searches_failed());
    assert_eq!(outcome.unresolved, vec!["a/one.txt", "b/two.txt"]);

    let executor = CannedFind::new(&[("one.txt", "/srv/a/one.txt\n")]);
    let outcome = rebuild_synced_index(&config, &executor, &NoProgress).expect("rebuild");
    assert_eq!(outcome.failed_searches, 0);
    assert!(!outcome.all_searches_failed());
}
