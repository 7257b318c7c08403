//! Quarry CLI - structural code index commands and worker entrypoints

mod worker;

use clap::{Parser, Subcommand};
use colored::Colorize;
use quarry_client::{CommandKind, Context, HttpEmbeddingProvider, Indexer, ShutdownFlag, Vectorizer, WorkerType};
use quarry_core::{Config, IndexStats, IntegrityReport, IntegrityStatus, Project, PythonParser, QuarryError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "quarry")]
#[command(about = "Persistent structural index of source trees", long_about = None)]
struct Cli {
    /// Config file (default: $QUARRY_CONFIG or ./quarry.toml)
    #[arg(long, global = true, env = "QUARRY_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Incrementally index a project directory, or reindex one file
    Index {
        /// Project directory or a file inside a project (default: current dir)
        path: Option<PathBuf>,

        /// Index a registered project by id instead of by path
        #[arg(long, conflicts_with = "path")]
        project: Option<String>,
    },

    /// Manage registered projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },

    /// Find classes, functions and methods by name
    Find {
        /// Name or SQL LIKE pattern (`%` and `_` wildcards)
        pattern: String,

        #[arg(long)]
        project: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Entity counts for one project or the whole index
    Stats {
        #[arg(long)]
        project: Option<String>,
    },

    /// Remove a file from the index
    DeleteFile {
        project: String,

        /// Path relative to the project root
        path: String,

        /// Delete the rows instead of marking the file deleted
        #[arg(long, conflicts_with = "version_store")]
        hard: bool,

        /// Move the file on disk into the version store
        #[arg(long)]
        version_store: bool,
    },

    /// Show safe-mode state, integrity and backups
    CorruptionStatus,

    /// Back up the database and its sidecar files
    Backup,

    /// Leave safe mode after an integrity check, or rebuild the database
    Repair {
        /// Back up, then recreate an empty database (destructive)
        #[arg(long)]
        recreate: bool,

        /// Confirm a destructive repair
        #[arg(long)]
        force: bool,
    },

    /// Replace the database with a backup (destructive)
    Restore {
        backup: PathBuf,

        #[arg(long)]
        force: bool,
    },

    /// Control worker processes
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// Vector index maintenance and search
    Vectors {
        #[command(subcommand)]
        command: VectorCommands,
    },
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Register a project root
    Create {
        root: PathBuf,

        /// Project UUID (default: random)
        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        comment: Option<String>,
    },
    List,
    /// Delete a project and everything indexed under it
    Delete { id: String },
    /// Change a project's id; its files follow
    SetId { old_id: String, new_id: String },
}

#[derive(Subcommand)]
enum WorkerCommands {
    Start {
        #[arg(value_parser = parse_worker_type)]
        worker: WorkerType,
    },
    Stop {
        #[arg(value_parser = parse_worker_type)]
        worker: WorkerType,
    },
    Status,
    /// Run a worker loop in the foreground (used by `worker start`)
    Run {
        #[arg(value_parser = parse_worker_type)]
        worker: WorkerType,
    },
}

#[derive(Subcommand)]
enum VectorCommands {
    /// Renumber vector ids and rebuild the saved index
    Rebuild {
        #[arg(long)]
        project: Option<String>,
    },
    /// Nearest chunks to a text query
    Search {
        project: String,
        query: String,

        #[arg(short, default_value_t = 10)]
        k: usize,
    },
}

fn parse_worker_type(s: &str) -> std::result::Result<WorkerType, String> {
    s.parse().map_err(|e: QuarryError| e.to_string())
}

impl Commands {
    fn kind(&self) -> CommandKind {
        match self {
            Commands::CorruptionStatus => CommandKind::Status,
            Commands::Backup => CommandKind::Backup,
            Commands::Repair { .. } => CommandKind::Repair,
            Commands::Restore { .. } => CommandKind::Restore,
            Commands::Worker { .. } => CommandKind::WorkerControl,
            Commands::Index { .. } => CommandKind::Index,
            Commands::Find { .. } | Commands::Stats { .. } => CommandKind::Query,
            Commands::Project { command } => match command {
                ProjectCommands::List => CommandKind::Query,
                _ => CommandKind::Mutate,
            },
            Commands::Vectors { command } => match command {
                VectorCommands::Search { .. } => CommandKind::Query,
                VectorCommands::Rebuild { .. } => CommandKind::Mutate,
            },
            Commands::DeleteFile { .. } => CommandKind::Mutate,
        }
    }
}

fn init_tracing(default_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let runs_worker = matches!(
        cli.command,
        Commands::Worker {
            command: WorkerCommands::Run { .. }
        }
    );
    init_tracing(if runs_worker { "info" } else { "warn" });
    // Workers take SIGTERM through a signal thread; set it up before the
    // HTTP client starts its own threads.
    if runs_worker {
        if let Err(err) = ShutdownFlag::install() {
            report_error(&QuarryError::from(err), cli.json);
            return ExitCode::FAILURE;
        }
    }

    match run(cli.command, cli.config, cli.json) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err, cli.json);
            ExitCode::FAILURE
        }
    }
}

fn report_error(err: &QuarryError, json: bool) {
    let envelope = err.to_envelope();
    if json {
        match serde_json::to_string_pretty(&envelope) {
            Ok(text) => eprintln!("{text}"),
            Err(_) => eprintln!("{}", envelope.message),
        }
        return;
    }
    eprintln!(
        "{}[{}]: {} ({})",
        "error".red().bold(),
        envelope.code,
        envelope.message,
        envelope.hint.dimmed()
    );
    for path in &envelope.backup_paths {
        eprintln!("  {}: {}", "backup".yellow(), path);
    }
}

fn run(command: Commands, config_arg: Option<PathBuf>, json: bool) -> Result<()> {
    let config_path = resolve_config_path(config_arg);
    let config = Config::discover(config_path.as_deref())?;
    let ctx = Context::new(config, config_path)?;
    ctx.gate().check(command.kind())?;

    match command {
        Commands::Index { path, project } => cmd_index(&ctx, path, project, json),
        Commands::Project { command } => cmd_project(&ctx, command, json),
        Commands::Find { pattern, project, limit } => cmd_find(&ctx, &pattern, project.as_deref(), limit, json),
        Commands::Stats { project } => {
            let counts = ctx.store().entity_counts(project.as_deref())?;
            if json {
                return print_json(&counts);
            }
            println!("{}: {}", "files".blue(), counts.files);
            println!("{}: {}", "classes".blue(), counts.classes);
            println!("{}: {}", "methods".blue(), counts.methods);
            println!("{}: {}", "functions".blue(), counts.functions);
            println!("{}: {}", "imports".blue(), counts.imports);
            println!("{}: {}", "usages".blue(), counts.usages);
            println!("{}: {}", "chunks".blue(), counts.chunks);
            Ok(())
        }
        Commands::DeleteFile {
            project,
            path,
            hard,
            version_store,
        } => cmd_delete_file(&ctx, &project, &path, hard, version_store, json),
        Commands::CorruptionStatus => cmd_corruption_status(&ctx, json),
        Commands::Backup => {
            let paths = ctx.monitor().backup()?;
            if json {
                return print_json(&paths);
            }
            if paths.is_empty() {
                println!("{}: no database files to back up", "Backup".yellow());
            }
            for path in paths {
                println!("{}: {}", "Backup".green(), path.display());
            }
            Ok(())
        }
        Commands::Repair { recreate, force } => {
            let outcome = ctx.monitor().repair(recreate, force)?;
            if json {
                return print_json(&outcome);
            }
            if outcome.recreated {
                println!("{}: empty database created", "Recreated".green());
            }
            print_integrity(outcome.integrity.as_ref());
            for path in &outcome.backup_paths {
                println!("{}: {}", "Backup".blue(), path.display());
            }
            print_stopped_workers(&outcome.stopped_workers);
            if outcome.marker_cleared {
                println!("{}: safe mode cleared", "Repaired".green());
            } else {
                println!("{}: database was not in safe mode", "Healthy".green());
            }
            Ok(())
        }
        Commands::Restore { backup, force } => {
            let outcome = ctx.monitor().restore(&backup, force)?;
            if json {
                return print_json(&outcome);
            }
            println!("{}: {}", "Restored".green(), backup.display());
            print_integrity(outcome.integrity.as_ref());
            for path in &outcome.backup_paths {
                println!("{}: {}", "Previous state".blue(), path.display());
            }
            print_stopped_workers(&outcome.stopped_workers);
            Ok(())
        }
        Commands::Worker { command } => cmd_worker(&ctx, command, json),
        Commands::Vectors { command } => cmd_vectors(&ctx, command, json),
    }
}

/// An explicit `--config` (or `$QUARRY_CONFIG`) wins; otherwise `./quarry.toml`
/// when present, made absolute so spawned workers find it too.
fn resolve_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    let path = explicit.or_else(|| {
        let local = PathBuf::from(quarry_core::config::DEFAULT_CONFIG_FILE);
        local.exists().then_some(local)
    })?;
    Some(std::fs::canonicalize(&path).unwrap_or(path))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_integrity(report: Option<&IntegrityReport>) {
    let Some(report) = report else { return };
    let status = match report.status {
        IntegrityStatus::Ok => "ok".green(),
        IntegrityStatus::Corrupt => "corrupt".red(),
        IntegrityStatus::Busy => "busy".yellow(),
    };
    println!("{}: {} ({}) {}", "Integrity".blue(), status, report.check, report.detail);
}

fn print_stopped_workers(workers: &[WorkerType]) {
    for worker in workers {
        println!("{}: {}", "Stopped worker".yellow(), worker);
    }
}

fn print_stats(project: &Project, stats: &IndexStats) {
    println!(
        "{}: {} ({})",
        "Project".blue(),
        project.root_path.display(),
        project.id
    );
    println!(
        "{}: {} files ({} reparsed, {} unchanged)",
        "Indexed".green(),
        stats.files_processed,
        stats.files_reparsed,
        stats.files_skipped
    );
    println!(
        "{}: {} classes, {} methods, {} functions, {} imports, {} usages, {} chunks",
        "Entities".blue(),
        stats.classes,
        stats.methods,
        stats.functions,
        stats.imports,
        stats.usages,
        stats.chunks
    );
    if stats.files_marked_deleted > 0 {
        println!("{}: {} files", "Deleted".yellow(), stats.files_marked_deleted);
    }
    for error in &stats.syntax_errors {
        println!(
            "{}: {}:{} {}",
            "syntax error".red(),
            error.path.display(),
            error.line,
            error.message
        );
    }
    for error in &stats.errors {
        println!("{}: {} {}", "error".red(), error.path.display(), error.message);
    }
}

fn cmd_index(ctx: &Context, path: Option<PathBuf>, project_id: Option<String>, json: bool) -> Result<()> {
    let store = ctx.store();
    let parser = PythonParser::with_extensions(&ctx.config.indexing.extensions);
    let indexer = Indexer::new(store, &parser, &ctx.config.indexing)
        .with_exclude(vec![ctx.config.workers.version_root.clone()]);

    let (project, file) = match project_id {
        Some(id) => (store.get_project(&id)?, None),
        None => {
            let target = absolute(&path.unwrap_or_else(|| PathBuf::from(".")))?;
            if target.is_file() {
                let project = store.find_project_containing(&target)?.ok_or_else(|| {
                    QuarryError::ProjectNotFound(format!("no project contains {}", target.display()))
                })?;
                (project, Some(target))
            } else {
                let project = match store.find_project_by_root(&target)? {
                    Some(project) => project,
                    None => store.create_project(&target, None, None, None)?,
                };
                (project, None)
            }
        }
    };

    let stats = match file {
        Some(file) => indexer.reindex_file(&project, &file, None)?,
        None => indexer.index_project(&project, None)?,
    };
    if json {
        return print_json(&serde_json::json!({ "project": project, "stats": stats }));
    }
    print_stats(&project, &stats);
    Ok(())
}

fn cmd_project(ctx: &Context, command: ProjectCommands, json: bool) -> Result<()> {
    let store = ctx.store();
    match command {
        ProjectCommands::Create { root, id, comment } => {
            let root = absolute(&root)?;
            if !root.is_dir() {
                return Err(QuarryError::FileNotFound(root));
            }
            let project = store.create_project(&root, id.as_deref(), None, comment.as_deref())?;
            if json {
                return print_json(&project);
            }
            println!("{}: {} {}", "Created".green(), project.id, project.root_path.display());
        }
        ProjectCommands::List => {
            let projects = store.list_projects()?;
            if json {
                return print_json(&projects);
            }
            if projects.is_empty() {
                println!("No projects registered");
            }
            for project in projects {
                let comment = project.comment.map(|c| format!(" - {c}")).unwrap_or_default();
                println!("{}  {}{}", project.id.cyan(), project.root_path.display(), comment);
            }
        }
        ProjectCommands::Delete { id } => {
            store.delete_project(&id)?;
            if json {
                return print_json(&serde_json::json!({ "deleted": id }));
            }
            println!("{}: {}", "Deleted".green(), id);
        }
        ProjectCommands::SetId { old_id, new_id } => {
            store.change_project_id(&old_id, &new_id)?;
            if json {
                return print_json(&serde_json::json!({ "old_id": old_id, "new_id": new_id }));
            }
            println!("{}: {} -> {}", "Renamed".green(), old_id, new_id);
        }
    }
    Ok(())
}

fn cmd_find(ctx: &Context, pattern: &str, project: Option<&str>, limit: usize, json: bool) -> Result<()> {
    let like = if pattern.contains('%') || pattern.contains('_') {
        pattern.to_string()
    } else {
        format!("%{pattern}%")
    };
    let hits = ctx.store().find_entities(&like, project, limit)?;
    if json {
        return print_json(&hits);
    }
    for hit in &hits {
        println!("{}: {}:{} {}", hit.kind.cyan(), hit.path, hit.line, hit.name);
    }
    if hits.len() == limit {
        println!("... ({} at {} results)", "truncated".yellow(), limit);
    }
    Ok(())
}

fn cmd_delete_file(
    ctx: &Context,
    project_id: &str,
    path: &str,
    hard: bool,
    version_store: bool,
    json: bool,
) -> Result<()> {
    let store = ctx.store();
    let project = store.get_project(project_id)?;
    let (action, detail) = if version_store {
        let target = store.move_file_to_version_store(&project, path, &ctx.config.workers.version_root)?;
        ("versioned", Some(target))
    } else {
        let found = if hard {
            store.hard_delete_file(&project.id, path)?
        } else {
            store.soft_delete_file(&project.id, path)?
        };
        if !found {
            return Err(QuarryError::FileNotFound(project.root_path.join(path)));
        }
        (if hard { "deleted" } else { "marked deleted" }, None)
    };

    if json {
        return print_json(&serde_json::json!({ "path": path, "action": action, "version_path": detail }));
    }
    match detail {
        Some(target) => println!("{}: {} -> {}", "Versioned".green(), path, target.display()),
        None => println!("{}: {} ({})", "Deleted".green(), path, action),
    }
    Ok(())
}

fn cmd_corruption_status(ctx: &Context, json: bool) -> Result<()> {
    let status = ctx.monitor().status()?;
    if json {
        return print_json(&status);
    }
    println!("{}: {}", "Database".blue(), status.db_path.display());
    if status.safe_mode {
        println!("{}: {}", "Safe mode".red().bold(), "ON".red());
    } else {
        println!("{}: off", "Safe mode".blue());
    }
    if let Some(marker) = &status.marker {
        println!("{}: {} ({})", "Marker".red(), marker.message, marker.timestamp);
        for path in &marker.backup_paths {
            println!("  {}: {}", "backup".yellow(), path.display());
        }
    }
    if status.driver_reachable {
        print_integrity(status.integrity.as_ref());
    } else {
        println!("{}: {}", "Driver".yellow(), "unreachable".red());
    }
    for backup in &status.backups {
        println!("{}: {}", "Backup".blue(), backup.display());
    }
    Ok(())
}

fn cmd_worker(ctx: &Context, command: WorkerCommands, json: bool) -> Result<()> {
    match command {
        WorkerCommands::Start { worker } => {
            let entry = ctx.registry.start(worker)?;
            if json {
                return print_json(&entry);
            }
            println!(
                "{}: {} (pid {}, log {})",
                "Started".green(),
                worker,
                entry.pid,
                entry.log_path.display()
            );
        }
        WorkerCommands::Stop { worker } => {
            let stopped = ctx.registry.stop(worker)?;
            if json {
                return print_json(&serde_json::json!({ "worker": worker, "stopped": stopped }));
            }
            if stopped {
                println!("{}: {}", "Stopped".green(), worker);
            } else {
                println!("{}: {} was not running", "Idle".yellow(), worker);
            }
        }
        WorkerCommands::Status => {
            let workers = ctx.registry.status()?;
            if json {
                return print_json(&workers);
            }
            if workers.is_empty() {
                println!("No workers registered");
            }
            for status in workers {
                let state = if status.alive { "running".green() } else { "dead".red() };
                println!(
                    "{}: {} pid {} since {} ({})",
                    status.entry.worker_type.to_string().cyan(),
                    state,
                    status.entry.pid,
                    status.entry.start_time,
                    status.entry.log_path.display()
                );
            }
        }
        WorkerCommands::Run { worker } => worker::run(ctx, worker)?,
    }
    Ok(())
}

fn cmd_vectors(ctx: &Context, command: VectorCommands, json: bool) -> Result<()> {
    let provider = HttpEmbeddingProvider::from_config(&ctx.config.vectorize)?;
    let mut vectorizer = Vectorizer::new(ctx.store(), &provider, &ctx.config.vectors_dir(), &ctx.config.vectorize);
    match command {
        VectorCommands::Rebuild { project } => {
            let ids = match project {
                Some(id) => vec![ctx.store().get_project(&id)?.id],
                None => ctx.store().list_projects()?.into_iter().map(|p| p.id).collect(),
            };
            let mut rebuilt = Vec::new();
            for id in ids {
                let index = vectorizer.rebuild(&id)?;
                rebuilt.push(serde_json::json!({
                    "project_id": id,
                    "vectors": quarry_core::VectorIndex::len(&index),
                    "path": vectorizer.index_path(&id),
                }));
            }
            if json {
                return print_json(&rebuilt);
            }
            for entry in &rebuilt {
                println!("{}: {} ({} vectors)", "Rebuilt".green(), entry["project_id"], entry["vectors"]);
            }
        }
        VectorCommands::Search { project, query, k } => {
            let results = vectorizer.search(&project, &query, k)?;
            if json {
                return print_json(&results);
            }
            for result in results {
                let preview: String = result.text.lines().next().unwrap_or_default().chars().take(80).collect();
                println!(
                    "{} {}:{} {}",
                    format!("{:.3}", result.score).cyan(),
                    result.path,
                    result.line,
                    preview
                );
            }
        }
    }
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => QuarryError::FileNotFound(path.to_path_buf()),
        _ => err.into(),
    })
}
