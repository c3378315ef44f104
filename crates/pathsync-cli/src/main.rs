use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::SystemTime;

use anyhow::{Context, Result};
use clap::{ArgGroup, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use pathsync_core::config::{self, ConfigError, ConfigLayer, RemoteLayer, SyncConfig};
use pathsync_core::logs::{self, LogsError, LOG_FILE_PREFIX};
use pathsync_core::matcher::Candidate;
use pathsync_core::persist::PersistError;
use pathsync_core::reconcile::{self, ReconcileError, ReconcileProgress};
use pathsync_core::remote::{RemoteError, SshExecutor};
use pathsync_core::resolve::{
    CandidateSelector, NonInteractive, RemoteResolver, ResolutionSource, ResolveError, Selection,
};
use pathsync_core::store::{EntrySelection, ListedEntry, MappingStore, StoreError};

mod version;

#[derive(Parser)]
#[command(
    name = "pathsync",
    version = version::FULL,
    about = "Map local files to their counterparts on a remote host"
)]
struct Cli {
    /// Configuration file (default: nearest pathsync.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// File map to operate on
    #[arg(long, global = true)]
    map: Option<PathBuf>,
    /// Synced index produced by `reconcile`
    #[arg(long, global = true)]
    synced_index: Option<PathBuf>,
    #[arg(long, global = true)]
    local_root: Option<PathBuf>,
    /// Remote directory searched for matching files
    #[arg(long, global = true)]
    search_root: Option<String>,
    #[arg(long, global = true)]
    host: Option<String>,
    #[arg(long, global = true)]
    user: Option<String>,
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Log debug details to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List tasks and their file keys
    View {
        #[arg(long)]
        json: bool,
    },
    /// Show source and target of one key
    Info {
        key: u32,
        #[arg(long)]
        json: bool,
    },
    /// Add a local file, locating its remote counterpart
    Add {
        /// Path relative to the local root (or absolute inside it)
        local: PathBuf,
        /// Task to add to (default: the last task in the map)
        #[arg(long)]
        task: Option<String>,
        /// Fail on ambiguous matches instead of prompting
        #[arg(long)]
        non_interactive: bool,
    },
    /// Delete one key or a whole task
    #[command(group(ArgGroup::new("target").required(true).args(["key", "task"])))]
    Delete {
        key: Option<u32>,
        #[arg(long)]
        task: Option<String>,
    },
    /// Rebuild the synced index from the whole local tree
    Reconcile {
        /// Only list the files that would be looked up
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the local -> remote pairs selected for synchronization
    Plan {
        #[arg(long, conflicts_with = "keys")]
        task: Option<String>,
        #[arg(long, num_args = 1..)]
        keys: Vec<u32>,
    },
    /// Delete old log files
    PruneLogs {
        /// Log directory (default: log_dir from the configuration)
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long, default_value_t = logs::DEFAULT_RETENTION_DAYS)]
        days: u64,
    },
    /// Print version information
    Version,
}

impl Cli {
    fn overrides(&self) -> ConfigLayer {
        ConfigLayer {
            local_root: self.local_root.clone(),
            search_root: self.search_root.clone(),
            file_map: self.map.clone(),
            synced_index: self.synced_index.clone(),
            remote: RemoteLayer {
                host: self.host.clone(),
                username: self.user.clone(),
                port: self.port,
                ..RemoteLayer::default()
            },
            ..ConfigLayer::default()
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("pathsync: error[{}]: {:#}", error_kind(&err), err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir().context("resolve working directory")?;
    let layers = config::load_layers(cli.config.as_deref(), &cwd, cli.overrides())?;
    init_logging(cli.verbose, layers.log_dir.as_deref())?;

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    match command {
        Command::Version => {
            println!("pathsync {}", version::FULL);
        }
        Command::View { json } => {
            let store = MappingStore::open(layers.file_map_path())?;
            view(&store, json)?;
        }
        Command::Info { key, json } => {
            let store = MappingStore::open(layers.file_map_path())?;
            let listed = store.info(key)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&EntryView::from(&listed))?);
            } else {
                println!("Item '{}' in task '{}':", listed.key, listed.task);
                println!("  Source: {}", listed.entry.local);
                println!("  Target: {}", listed.entry.remote);
            }
        }
        Command::Delete { key, task } => {
            let mut store = MappingStore::open(layers.file_map_path())?;
            match (key, task) {
                (Some(key), _) => {
                    let removed = store.delete(key)?;
                    println!(
                        "Deleted [{}] {} from task '{}'",
                        removed.key,
                        removed.entry.local_name(),
                        removed.task
                    );
                }
                (None, Some(task)) => {
                    let freed = store.delete_task(&task)?;
                    println!("Deleted task '{}' ({} entries)", task, freed.len());
                }
                (None, None) => anyhow::bail!("provide a key or --task"),
            }
        }
        Command::Add {
            local,
            task,
            non_interactive,
        } => {
            let config = layers.build()?;
            add(&config, &local, task.as_deref(), non_interactive)?;
        }
        Command::Reconcile { dry_run } => {
            let config = layers.build()?;
            reconcile_tree(&config, dry_run)?;
        }
        Command::Plan { task, keys } => {
            let config = layers.build()?;
            let selection = match (task, keys.is_empty()) {
                (Some(task), _) => EntrySelection::Task(task),
                (None, false) => EntrySelection::Keys(keys),
                (None, true) => EntrySelection::All,
            };
            plan(&config, &selection)?;
        }
        Command::PruneLogs { dir, days } => {
            let dir = dir
                .or_else(|| layers.log_dir.clone())
                .ok_or(ConfigError::Missing("log_dir"))?;
            let removed = logs::prune_logs(&dir, days, SystemTime::now())?;
            let plural = if removed.len() == 1 { "" } else { "s" };
            println!("Deleted {} log file{}", removed.len(), plural);
            for path in removed {
                println!("  {}", path.display());
            }
        }
    }
    Ok(())
}

fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Result<()> {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            Some(
                fmt::layer()
                    .with_writer(appender)
                    .with_ansi(false)
                    .with_filter(EnvFilter::new("pathsync_core=info,pathsync=info")),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_filter(filter))
        .with(file_layer)
        .try_init()
        .context("install log subscriber")?;
    Ok(())
}

#[derive(Serialize)]
struct EntryView<'a> {
    task: &'a str,
    key: u32,
    local: &'a str,
    remote: &'a str,
}

impl<'a> From<&'a ListedEntry> for EntryView<'a> {
    fn from(listed: &'a ListedEntry) -> Self {
        Self {
            task: &listed.task,
            key: listed.key,
            local: &listed.entry.local,
            remote: &listed.entry.remote,
        }
    }
}

fn view(store: &MappingStore, json: bool) -> Result<()> {
    let listed = store.list();
    if json {
        let views: Vec<EntryView> = listed.iter().map(EntryView::from).collect();
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }
    for task in store.tasks() {
        println!("[{}]:", task.name);
        for (key, entry) in &task.entries {
            println!("    [{:2}]: {}", key, entry.local_name());
        }
    }
    Ok(())
}

fn add(config: &SyncConfig, local: &Path, task: Option<&str>, non_interactive: bool) -> Result<()> {
    let mut store = MappingStore::open(&config.file_map)?;
    let executor = SshExecutor::new(config.remote.clone());
    let resolver = RemoteResolver::new(config, executor);
    let interactive = !non_interactive && io::stdin().is_terminal();
    debug!(local = %local.display(), task, interactive, "adding file");
    let added = if interactive {
        resolver.add_file(&mut store, local, task, &ConsoleSelector)?
    } else {
        resolver.add_file(&mut store, local, task, &NonInteractive)?
    };
    let via = match added.source {
        ResolutionSource::SyncedIndex => "synced index",
        ResolutionSource::RemoteSearch => "remote search",
        ResolutionSource::Selected => "manual selection",
    };
    info!(key = added.key, task = %added.task, via, "add command finished");
    println!(
        "Added [{}] {} -> {} to task '{}' ({})",
        added.key, added.entry.local, added.entry.remote, added.task, via
    );
    Ok(())
}

/// Prompts on the terminal; hinted candidates are marked with `*`.
struct ConsoleSelector;

impl CandidateSelector for ConsoleSelector {
    fn select(&self, local: &str, candidates: &[Candidate]) -> Selection {
        println!("Multiple remote files match '{local}'. Likely candidates are marked with *.");
        println!("Enter 0 if none is suitable.");
        for (idx, candidate) in candidates.iter().enumerate() {
            let mark = if candidate.hinted { '*' } else { ' ' };
            println!("{mark}[{:2}]: {}", idx + 1, candidate.path);
        }
        print!("Select remote file to use: ");
        if io::stdout().flush().is_err() {
            return Selection::Unavailable;
        }
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return Selection::Unavailable;
        }
        match answer.trim().parse::<usize>() {
            Ok(0) | Err(_) => Selection::Declined,
            Ok(choice) => Selection::Chosen(choice),
        }
    }
}

struct BarProgress(ProgressBar);

impl ReconcileProgress for BarProgress {
    fn started(&self, total: usize) {
        self.0.set_length(total as u64);
    }

    fn advanced(&self, done: usize) {
        self.0.set_position(done as u64);
    }
}

fn reconcile_tree(config: &SyncConfig, dry_run: bool) -> Result<()> {
    if dry_run {
        let files = reconcile::collect_local_files(&config.local_root, &config.ignore)?;
        for file in &files {
            println!("{}", reconcile::relative_key(&config.local_root, file));
        }
        println!("{} files", files.len());
        info!(files = files.len(), "reconcile dry run");
        return Ok(());
    }

    let executor = SshExecutor::new(config.remote.clone());
    let hostname = executor.hostname()?;
    info!(host = %hostname, local_root = %config.local_root.display(), "reconcile started");
    println!(
        "Syncing file paths from {} against host {} into {}",
        config.local_root.display(),
        hostname,
        config.synced_index.display()
    );
    if let Some(branch) = reconcile::git_branch(&config.local_root) {
        println!("Using branch {branch} as reference");
    }

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("Finding matches {wide_bar} {pos}/{len} [{elapsed}<{eta}]")
            .context("progress template")?,
    );
    let progress = BarProgress(bar);
    let outcome = reconcile::rebuild_synced_index(config, &executor, &progress);
    progress.0.finish_and_clear();
    let outcome = outcome?;

    println!(
        "{} local files found. {} matched on remote host.",
        outcome.scanned,
        outcome.resolved()
    );
    let details = match &config.log_dir {
        Some(dir) => format!("See {} for details.", dir.join(logs::todays_log_name()).display()),
        None => "Run with a log_dir configured for details.".to_string(),
    };
    if !outcome.unresolved.is_empty() {
        println!("{} files not found on remote host. {details}", outcome.unresolved.len());
    }
    if !outcome.ambiguous.is_empty() {
        println!("{} files have multiple matches on remote host. {details}", outcome.ambiguous.len());
    }
    if outcome.all_searches_failed() {
        println!(
            "Every remote search failed. Check that search_root {} exists on the remote host.",
            config.search_root
        );
    }
    println!("Synced index saved.");
    Ok(())
}

fn plan(config: &SyncConfig, selection: &EntrySelection) -> Result<()> {
    let store = MappingStore::open(&config.file_map)?;
    let destination = config.remote.destination();
    for listed in store.select(selection)? {
        println!(
            "[{:2}] {} -> {}:{}",
            listed.key,
            config.local_root.join(&listed.entry.local).display(),
            destination,
            listed.entry.remote
        );
    }
    Ok(())
}

/// Stable, greppable tag for the failure class of `err`.
fn error_kind(err: &anyhow::Error) -> &'static str {
    for cause in err.chain() {
        if let Some(err) = cause.downcast_ref::<ResolveError>() {
            return match err {
                ResolveError::InvalidLocalPath { .. } => "invalid-local-path",
                ResolveError::RemoteFileNotFound(_) => "remote-not-found",
                ResolveError::AmbiguousMatch { .. } => "ambiguous",
                ResolveError::NoTask => "no-task",
                ResolveError::Store(err) => store_kind(err),
                ResolveError::Remote(_) => "remote",
            };
        }
        if let Some(err) = cause.downcast_ref::<StoreError>() {
            return store_kind(err);
        }
        if let Some(err) = cause.downcast_ref::<ReconcileError>() {
            return match err {
                ReconcileError::Remote { .. } => "remote",
                ReconcileError::Index(_) | ReconcileError::Persist(_) => "persistence",
                ReconcileError::Walk { .. } | ReconcileError::Pool(_) => "reconcile",
            };
        }
        if cause.downcast_ref::<PersistError>().is_some() {
            return "persistence";
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return "config";
        }
        if cause.downcast_ref::<RemoteError>().is_some() {
            return "remote";
        }
        if cause.downcast_ref::<LogsError>().is_some() {
            return "logs";
        }
    }
    "other"
}

fn store_kind(err: &StoreError) -> &'static str {
    match err {
        StoreError::KeyNotFound(_) | StoreError::TaskNotFound(_) => "not-found",
        StoreError::DuplicateKey { .. } => "duplicate-key",
        StoreError::Persist(_) => "persistence",
        _ => "file-map",
    }
}
