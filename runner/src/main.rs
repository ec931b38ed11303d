//! Subagent runner CLI.
//!
//! Runs an instruction through a coding subagent for one or more iterations
//! and records each execution as a session under `.runner/sessions/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use subagent_runner::core::types::{
    BackendKind, ExecutionRequest, ExecutionStatus, MaxIterations, ProgressEvent, ProgressEventType, SubagentKind,
};
use subagent_runner::engine::ExecutionEngine;
use subagent_runner::exit_codes;
use subagent_runner::io::backend::{BackendConfig, create_backend};
use subagent_runner::io::config::{RunnerConfig, load_config};
use subagent_runner::io::init::{InitOptions, RunnerPaths, init_runner};
use subagent_runner::io::session_store::{
    ArchiveOptions, CleanupOptions, ListOptions, NewSession, SessionFilter, SessionStatus, SessionStore, SortField,
    SortOrder,
};
use subagent_runner::logging;
use subagent_runner::run::run_tracked;

#[derive(Parser)]
#[command(
    name = "subagent-runner",
    version,
    about = "Iterative coding-subagent execution runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.runner/` scaffolding (config, services, sessions, archive).
    Init {
        /// Overwrite runner-owned files.
        #[arg(short, long)]
        force: bool,
    },
    /// Execute an instruction and record it as a session.
    Run(RunArgs),
    /// Inspect and maintain recorded sessions.
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Instruction text.
    #[arg(short, long, conflicts_with = "instruction_file")]
    instruction: Option<String>,
    /// Read the instruction from a file.
    #[arg(long)]
    instruction_file: Option<PathBuf>,
    /// Subagent to run (claude, codex, gemini, cursor, or a custom name).
    #[arg(short, long)]
    subagent: Option<String>,
    /// Iteration bound: N or `unlimited`.
    #[arg(short = 'n', long)]
    max_iterations: Option<MaxIterations>,
    #[arg(short, long)]
    model: Option<String>,
    /// Transport: `protocol` or `shell`.
    #[arg(short, long)]
    backend: Option<BackendKind>,
    /// Per-iteration backend timeout.
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Session name.
    #[arg(long)]
    name: Option<String>,
    /// Session tag; repeatable.
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Print structured stream events as raw `key=value` lines.
    #[arg(short, long)]
    verbose: bool,
    /// Suppress progress output.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Subcommand)]
enum SessionsCommand {
    /// List sessions, newest first.
    List(ListArgs),
    /// Print one session as JSON.
    Show { id: String },
    /// Delete one session.
    Remove { id: String },
    /// Move finished sessions into yearly archive files.
    Archive {
        #[arg(long)]
        older_than_days: Option<u32>,
        /// Only these statuses (default: every finished status).
        #[arg(long = "status")]
        statuses: Vec<SessionStatus>,
        /// Keep only session info and context in the archive.
        #[arg(long)]
        metadata_only: bool,
    },
    /// Delete sessions matching every given criterion.
    Cleanup {
        #[arg(long)]
        older_than_days: Option<u32>,
        #[arg(long = "status")]
        statuses: Vec<SessionStatus>,
        /// Only sessions with no history and no result.
        #[arg(long)]
        empty: bool,
        /// Report what would be removed without deleting.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Args)]
struct ListArgs {
    #[arg(long = "status")]
    statuses: Vec<SessionStatus>,
    #[arg(long)]
    subagent: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long, value_enum, default_value_t = SortKey::Created)]
    sort: SortKey,
    /// Oldest first.
    #[arg(long)]
    asc: bool,
    #[arg(long, default_value_t = 0)]
    offset: usize,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Clone, Copy, ValueEnum)]
enum SortKey {
    Created,
    Updated,
    Name,
}

impl From<SortKey> for SortField {
    fn from(key: SortKey) -> Self {
        match key {
            SortKey::Created => SortField::Created,
            SortKey::Updated => SortField::Updated,
            SortKey::Name => SortField::Name,
        }
    }
}

#[tokio::main]
async fn main() {
    logging::init();
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => {
            let paths = init_runner(&root, &InitOptions { force })?;
            println!("initialized {}", paths.runner_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Run(args) => cmd_run(&root, args).await,
        Command::Sessions { command } => cmd_sessions(&root, command),
    }
}

fn load_project_config(paths: &RunnerPaths) -> Result<RunnerConfig> {
    let config = load_config(&paths.config_path)
        .with_context(|| format!("load {}", paths.config_path.display()))?;
    config.validate()?;
    Ok(config)
}

fn session_store(config: &RunnerConfig, paths: &RunnerPaths) -> SessionStore {
    SessionStore::new(config.sessions_dir(paths), config.archive_dir(paths))
}

fn read_instruction(args: &RunArgs) -> Result<String> {
    let instruction = match (&args.instruction, &args.instruction_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?,
        (None, None) => return Err(anyhow!("missing instruction (use --instruction or --instruction-file)")),
    };
    if instruction.trim().is_empty() {
        return Err(anyhow!("instruction must be non-empty"));
    }
    Ok(instruction)
}

fn print_progress(event: &ProgressEvent) {
    let label = match event.event_type {
        ProgressEventType::Start => "start",
        ProgressEventType::Result => "result",
        ProgressEventType::Thinking => "thinking",
        ProgressEventType::Error => "error",
    };
    for line in event.content.lines().filter(|l| !l.trim().is_empty()) {
        eprintln!("[{label}] {line}");
    }
}

async fn cmd_run(root: &Path, args: RunArgs) -> Result<i32> {
    let paths = RunnerPaths::new(root);
    let mut config = load_project_config(&paths)?;
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    config.verbose |= args.verbose;
    let instruction = read_instruction(&args)?;

    let subagent = SubagentKind::from(args.subagent.as_deref().unwrap_or(&config.subagent));
    let max_iterations = args.max_iterations.unwrap_or(config.max_iterations);
    let mut request = ExecutionRequest::new(instruction, subagent, root, max_iterations);
    request.model = args.model.clone().or_else(|| config.model.clone());
    request.timeout = args.timeout_secs.map(Duration::from_secs);

    let backend = create_backend(config.backend, BackendConfig::from_runner_config(&config, &paths));
    backend
        .initialize()
        .await
        .with_context(|| format!("initialize {} backend", config.backend))?;
    let engine = ExecutionEngine::from_config(Arc::from(backend), &config);
    let _progress = (!args.quiet).then(|| {
        engine.on_progress(|event| {
            print_progress(event);
            Ok(())
        })
    });

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling...");
            on_signal.cancel();
        }
    });

    let store = session_store(&config, &paths);
    let session = NewSession {
        name: args.name.clone(),
        tags: args.tags.clone(),
        ..NewSession::from_request(&request, config.backend)
    };
    let outcome = run_tracked(&engine, &store, request, session, Some(cancel)).await;
    if let Err(err) = engine.shutdown().await {
        warn!(err = %err, "engine shutdown incomplete");
    }
    let outcome = outcome?;

    let result = &outcome.result;
    if let Some(content) = result.last_content() {
        println!("{content}");
    }
    eprintln!(
        "session {}: {} ({} iteration(s), {} ms)",
        outcome.session.info.id,
        result.status,
        result.iterations.len(),
        result.duration_ms
    );
    if let Some(err) = &result.error {
        eprintln!("error: {err}");
    }
    Ok(match result.status {
        ExecutionStatus::Completed => exit_codes::OK,
        ExecutionStatus::Cancelled => exit_codes::CANCELLED,
        ExecutionStatus::Timeout => exit_codes::TIMEOUT,
        _ => exit_codes::FAILED,
    })
}

fn cmd_sessions(root: &Path, command: SessionsCommand) -> Result<i32> {
    let paths = RunnerPaths::new(root);
    let config = load_project_config(&paths)?;
    let store = session_store(&config, &paths);
    match command {
        SessionsCommand::List(args) => {
            let options = ListOptions {
                filter: SessionFilter {
                    statuses: args.statuses,
                    subagent: args.subagent.as_deref().map(SubagentKind::from),
                    tags: args.tags,
                    ..SessionFilter::default()
                },
                sort_by: args.sort.into(),
                order: if args.asc { SortOrder::Asc } else { SortOrder::Desc },
                offset: args.offset,
                limit: args.limit,
            };
            for session in store.list_sessions(&options)? {
                let info = &session.info;
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    info.id,
                    info.status,
                    info.subagent,
                    info.created_at.to_rfc3339(),
                    info.name
                );
            }
        }
        SessionsCommand::Show { id } => {
            let session = store
                .load_session(&id)?
                .ok_or_else(|| anyhow!("session {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&session).context("serialize session")?);
        }
        SessionsCommand::Remove { id } => {
            if store.remove_session(&id)? {
                println!("removed {id}");
            } else {
                println!("session {id} not found");
            }
        }
        SessionsCommand::Archive {
            older_than_days,
            statuses,
            metadata_only,
        } => {
            let report = store.archive_sessions(&ArchiveOptions {
                older_than_days,
                statuses,
                include_data: !metadata_only,
            })?;
            for id in &report.archived {
                println!("archived {id}");
            }
        }
        SessionsCommand::Cleanup {
            older_than_days,
            statuses,
            empty,
            dry_run,
        } => {
            let report = store.cleanup(&CleanupOptions {
                older_than_days,
                statuses,
                empty_only: empty,
                dry_run,
            })?;
            let verb = if report.dry_run { "would remove" } else { "removed" };
            for id in &report.removed {
                println!("{verb} {id}");
            }
        }
    }
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["subagent-runner", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["subagent-runner", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "subagent-runner",
            "run",
            "-i",
            "say hi",
            "--backend",
            "shell",
            "--max-iterations",
            "unlimited",
            "--tag",
            "a",
            "--tag",
            "b",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.instruction.as_deref(), Some("say hi"));
        assert_eq!(args.backend, Some(BackendKind::Shell));
        assert_eq!(args.max_iterations, Some(MaxIterations::Unlimited));
        assert_eq!(args.tags, vec!["a", "b"]);
    }

    #[test]
    fn parse_sessions_cleanup_statuses() {
        let cli = Cli::parse_from([
            "subagent-runner",
            "sessions",
            "cleanup",
            "--status",
            "failed",
            "--status",
            "cancelled",
            "--dry-run",
        ]);
        let Command::Sessions {
            command: SessionsCommand::Cleanup { statuses, dry_run, .. },
        } = cli.command
        else {
            panic!("expected sessions cleanup");
        };
        assert_eq!(statuses, vec![SessionStatus::Failed, SessionStatus::Cancelled]);
        assert!(dry_run);
    }

    #[test]
    fn instruction_must_be_present() {
        let cli = Cli::parse_from(["subagent-runner", "run"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(read_instruction(&args).is_err());
    }
}
