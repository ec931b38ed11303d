//! Initialization helpers for `.runner/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{RunnerConfig, write_config};

/// All canonical paths within `.runner/` for a project root.
#[derive(Debug, Clone)]
pub struct RunnerPaths {
    pub root: PathBuf,
    pub runner_dir: PathBuf,
    pub config_path: PathBuf,
    pub services_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub services_readme_path: PathBuf,
}

impl RunnerPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runner_dir = root.join(".runner");
        let services_dir = runner_dir.join("services");
        Self {
            root: root.clone(),
            runner_dir: runner_dir.clone(),
            config_path: runner_dir.join("config.toml"),
            services_dir: services_dir.clone(),
            sessions_dir: runner_dir.join("sessions"),
            archive_dir: runner_dir.join("archive"),
            gitignore_path: runner_dir.join(".gitignore"),
            services_readme_path: services_dir.join("README.md"),
        }
    }
}

/// Options for `init_runner`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing runner-owned files.
    pub force: bool,
}

/// Create `.runner/` scaffolding in `root`.
///
/// Fails if `.runner/` already exists unless `options.force` is set. Service
/// scripts and sessions are never touched by a forced re-init.
pub fn init_runner(root: &Path, options: &InitOptions) -> Result<RunnerPaths> {
    let paths = RunnerPaths::new(root);
    if paths.runner_dir.exists() && !options.force {
        return Err(anyhow!(
            "runner init: .runner already exists (use --force to overwrite)"
        ));
    }
    if paths.runner_dir.exists() && !paths.runner_dir.is_dir() {
        return Err(anyhow!(
            "runner init: .runner exists but is not a directory"
        ));
    }

    create_dir(&paths.runner_dir)?;
    create_dir(&paths.services_dir)?;
    create_dir(&paths.sessions_dir)?;
    create_dir(&paths.archive_dir)?;

    write_file(&paths.gitignore_path, RUNNER_GITIGNORE)?;
    write_file(&paths.services_readme_path, SERVICES_README)?;
    write_config(&paths.config_path, &RunnerConfig::default())?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const RUNNER_GITIGNORE: &str = "sessions/\narchive/\n";
const SERVICES_README: &str = "# Services\n\n\
Service scripts used by the shell backend. For subagent `<name>` the runner\n\
tries `<name>.py`, `<name>.sh`, `subagent.py`, `subagent.sh` in that order.\n\n\
Scripts receive `-p <instruction> --cd <project> [-m <model>]` and the\n\
environment variables `RUNNER_INSTRUCTION`, `RUNNER_PROJECT_PATH`,\n\
`RUNNER_MODEL`, `RUNNER_ITERATION`, `RUNNER_CORRELATION_ID`.\n\n\
Write one JSON event per line to stdout (`{\"type\":\"thinking\",\"content\":\"...\"}`)\n\
or plain text. Exit 0 on success.\n";
