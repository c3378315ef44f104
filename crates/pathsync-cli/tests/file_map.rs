use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

const SEEDED_MAP: &str = "web:\n  1:\n  - conf/nginx.conf\n  - /etc/nginx/nginx.conf\n  2:\n  - conf/site.conf\n  - /etc/nginx/sites-enabled/site.conf\ndb:\n  3:\n  - db/my.cnf\n  - /etc/mysql/my.cnf\n";

struct Workspace {
    temp: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let temp = TempDir::new().expect("tempdir");
        fs::create_dir_all(temp.path().join("home")).expect("home");
        fs::create_dir_all(temp.path().join("repo")).expect("repo");
        Self { temp }
    }

    fn root(&self) -> &Path {
        self.temp.path()
    }

    fn map(&self) -> PathBuf {
        self.root().join("file_map.yaml")
    }

    fn seed_map(&self) {
        fs::write(self.map(), SEEDED_MAP).expect("seed map");
    }

    fn touch(&self, rel: &str) {
        let path = self.root().join("repo").join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("dirs");
        fs::write(path, "x").expect("touch");
    }

    fn write_config(&self, synced_index: &str) {
        let config = "local_root = \"repo\"\n\
            search_root = \"/etc\"\n\
            file_map = \"file_map.yaml\"\n\
            synced_index = \"synced_file_map.yaml\"\n\
            \n\
            [remote]\n\
            host = \"unreachable.invalid\"\n\
            username = \"deploy\"\n";
        fs::write(self.root().join("pathsync.toml"), config).expect("config");
        fs::write(self.root().join("synced_file_map.yaml"), synced_index).expect("index");
    }

    fn command(&self) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_pathsync"));
        command
            .current_dir(self.root())
            .env("PATHSYNC_HOME", self.root().join("home"))
            .env_remove("RUST_LOG");
        command
    }

    fn run(&self, args: &[&str]) -> Output {
        self.command().args(args).output().expect("run pathsync")
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn view_lists_tasks_in_file_order() {
    let ws = Workspace::new();
    ws.seed_map();

    let output = ws.run(&["view"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(
        stdout(&output),
        "[web]:\n    [ 1]: nginx.conf\n    [ 2]: site.conf\n[db]:\n    [ 3]: my.cnf\n"
    );
}

#[test]
fn view_json_reports_every_entry() {
    let ws = Workspace::new();
    ws.seed_map();

    let output = ws.run(&["view", "--json"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let entries: Value = serde_json::from_str(&stdout(&output)).expect("json");
    let entries = entries.as_array().expect("array");
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[2]["task"], "db");
    assert_eq!(entries[2]["key"], 3);
    assert_eq!(entries[2]["remote"], "/etc/mysql/my.cnf");
}

#[test]
fn info_prints_source_and_target() {
    let ws = Workspace::new();
    ws.seed_map();

    let output = ws.run(&["info", "2"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("Item '2' in task 'web'"));
    assert!(text.contains("Source: conf/site.conf"));
    assert!(text.contains("Target: /etc/nginx/sites-enabled/site.conf"));
}

#[test]
fn unknown_key_is_reported_with_its_kind() {
    let ws = Workspace::new();
    ws.seed_map();

    let output = ws.run(&["info", "42"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(
        stderr(&output).starts_with("pathsync: error[not-found]: "),
        "{}",
        stderr(&output)
    );
}

#[test]
fn delete_key_then_task_rewrites_the_map() {
    let ws = Workspace::new();
    ws.seed_map();

    let output = ws.run(&["delete", "1"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let output = ws.run(&["delete", "--task", "db"]);
    assert!(output.status.success(), "{}", stderr(&output));

    let map = fs::read_to_string(ws.map()).expect("read map");
    assert_eq!(
        map,
        "web:\n  2:\n  - conf/site.conf\n  - /etc/nginx/sites-enabled/site.conf\n"
    );
    assert!(!ws.root().join("file_map.yaml.tmp").exists());
}

#[test]
fn add_uses_the_synced_index_without_contacting_the_host() {
    let ws = Workspace::new();
    ws.touch("conf/nginx.conf");
    ws.write_config("conf/nginx.conf: /etc/nginx/nginx.conf\n");

    let output = ws.run(&["add", "conf/nginx.conf", "--task", "web", "--non-interactive"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("Added [1] conf/nginx.conf -> /etc/nginx/nginx.conf"));

    let map = fs::read_to_string(ws.map()).expect("read map");
    assert_eq!(map, "web:\n  1:\n  - conf/nginx.conf\n  - /etc/nginx/nginx.conf\n");
}

#[test]
fn add_rejects_files_outside_the_local_root() {
    let ws = Workspace::new();
    ws.write_config("{}\n");
    fs::write(ws.root().join("stray.conf"), "x").expect("stray");

    let output = ws.run(&["add", "../stray.conf", "--task", "web", "--non-interactive"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(
        stderr(&output).starts_with("pathsync: error[invalid-local-path]: "),
        "{}",
        stderr(&output)
    );
    assert!(!ws.map().exists());
}

#[test]
fn add_without_tasks_requires_a_task_name() {
    let ws = Workspace::new();
    ws.touch("conf/nginx.conf");
    ws.write_config("conf/nginx.conf: /etc/nginx/nginx.conf\n");

    let output = ws.run(&["add", "conf/nginx.conf", "--non-interactive"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("error[no-task]"), "{}", stderr(&output));
}

#[test]
fn add_without_remote_settings_is_a_config_error() {
    let ws = Workspace::new();
    ws.touch("conf/nginx.conf");

    let output = ws.run(&["--local-root", "repo", "add", "conf/nginx.conf", "--task", "web"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("error[config]"), "{}", stderr(&output));
}

#[test]
fn plan_prints_selected_pairs() {
    let ws = Workspace::new();
    ws.write_config("{}\n");
    ws.seed_map();

    let output = ws.run(&["plan", "--task", "db"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    assert_eq!(text.lines().count(), 1);
    assert!(text.contains("db/my.cnf -> deploy@unreachable.invalid:/etc/mysql/my.cnf"));
}

#[test]
fn reconcile_dry_run_lists_retained_files() {
    let ws = Workspace::new();
    ws.write_config("{}\n");
    ws.touch("conf/nginx.conf");
    ws.touch("conf/debug.log");
    ws.touch(".git/HEAD");

    let output = ws.run(&["reconcile", "--dry-run"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "conf/nginx.conf\n1 files\n");
}

#[test]
fn commands_log_through_the_subscriber() {
    let ws = Workspace::new();
    ws.write_config("{}\n");
    ws.touch("conf/nginx.conf");

    let output = ws
        .command()
        .env("RUST_LOG", "info")
        .args(["reconcile", "--dry-run"])
        .output()
        .expect("run pathsync");
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stderr(&output).contains("reconcile dry run"), "{}", stderr(&output));
    assert_eq!(stdout(&output), "conf/nginx.conf\n1 files\n");
}

#[test]
fn global_config_comes_from_pathsync_home() {
    let ws = Workspace::new();
    ws.seed_map();
    let global = format!(
        "local_root = \"{}\"\n\n[remote]\nhost = \"global.invalid\"\nusername = \"ops\"\n",
        ws.root().join("repo").display()
    );
    fs::write(ws.root().join("home").join("config.toml"), global).expect("global config");

    let output = ws.run(&["plan", "--keys", "3"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("ops@global.invalid:/etc/mysql/my.cnf"));
}
