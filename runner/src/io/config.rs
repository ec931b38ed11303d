//! Runner configuration stored under `.runner/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::error::ErrorKind;
use crate::core::rate_limit::RateLimitPolicy;
use crate::core::recovery::RecoverySettings;
use crate::core::types::{BackendKind, MaxIterations};
use crate::io::hooks::{HookOptions, HooksConfig};
use crate::io::init::RunnerPaths;

/// Environment variable that overrides the configured backend.
pub const BACKEND_ENV: &str = "RUNNER_BACKEND";

/// Runner configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values in
/// the `Default` impls below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub backend: BackendKind,

    /// Default subagent when the CLI does not name one.
    pub subagent: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    pub max_iterations: MaxIterations,

    /// Per-call backend timeout in seconds.
    pub iteration_timeout_secs: u64,

    /// Render structured stream events as raw `key=value` summaries.
    pub verbose: bool,

    /// Overrides for `.runner/services`, `.runner/sessions`, `.runner/archive`.
    /// Relative paths resolve against the project root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_dir: Option<PathBuf>,

    pub engine: EngineSettings,
    pub rate_limit: RateLimitPolicy,
    /// Per-kind overrides of the default recovery table.
    pub recovery: BTreeMap<ErrorKind, RecoverySettings>,
    pub hooks: HooksConfig,
    pub hook_runner: HookOptions,
    pub shell: ShellSettings,
    pub protocol: ProtocolSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSettings {
    /// Pause between consecutive iterations.
    pub inter_iteration_delay_ms: u64,
    /// Upper bound on waiting for in-flight executions during shutdown.
    pub shutdown_timeout_secs: u64,
    /// Time a cancelled backend call gets to wind down before it is abandoned.
    pub cancel_grace_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            inter_iteration_delay_ms: 500,
            shutdown_timeout_secs: 30,
            cancel_grace_secs: 5,
        }
    }
}

impl EngineSettings {
    pub fn inter_iteration_delay(&self) -> Duration {
        Duration::from_millis(self.inter_iteration_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShellSettings {
    /// Interpreter for `.py` service scripts.
    pub python: String,
    /// Interpreter for `.sh` service scripts.
    pub bash: String,
    /// Time between SIGTERM and SIGKILL when a script must be stopped.
    pub grace_period_ms: u64,
    /// Byte cap on captured output, applied per stream and per stdout line.
    pub output_limit_bytes: usize,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            bash: "bash".to_string(),
            grace_period_ms: 2_000,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Server command line, e.g. `["python3", "server.py"]`.
    pub command: Vec<String>,
    /// Tool to call. Defaults to `<subagent>_subagent`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Deadline for the `initialize` handshake.
    pub connect_timeout_secs: u64,
    /// Deadline for a liveness `ping`.
    pub ping_timeout_ms: u64,
    /// Extra environment for the server process.
    pub env: BTreeMap<String, String>,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            tool_name: None,
            connect_timeout_secs: 30,
            ping_timeout_ms: 2_000,
            env: BTreeMap::new(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            subagent: "claude".to_string(),
            model: None,
            max_iterations: MaxIterations::Limited(1),
            iteration_timeout_secs: 30 * 60,
            verbose: false,
            services_dir: None,
            sessions_dir: None,
            archive_dir: None,
            engine: EngineSettings::default(),
            rate_limit: RateLimitPolicy::default(),
            recovery: BTreeMap::new(),
            hooks: HooksConfig::default(),
            hook_runner: HookOptions::default(),
            shell: ShellSettings::default(),
            protocol: ProtocolSettings::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.subagent.trim().is_empty() {
            return Err(anyhow!("subagent must be non-empty"));
        }
        if self.max_iterations.is_zero() {
            return Err(anyhow!("max_iterations must be > 0 or \"unlimited\""));
        }
        if self.iteration_timeout_secs == 0 {
            return Err(anyhow!("iteration_timeout_secs must be > 0"));
        }
        if self.engine.shutdown_timeout_secs == 0 {
            return Err(anyhow!("engine.shutdown_timeout_secs must be > 0"));
        }
        if self.rate_limit.fallback_wait_secs > self.rate_limit.max_wait_secs {
            return Err(anyhow!(
                "rate_limit.fallback_wait_secs must not exceed rate_limit.max_wait_secs"
            ));
        }
        if self.shell.output_limit_bytes == 0 {
            return Err(anyhow!("shell.output_limit_bytes must be > 0"));
        }
        if self.hook_runner.output_limit_bytes == 0 {
            return Err(anyhow!("hook_runner.output_limit_bytes must be > 0"));
        }
        if self.protocol.command.first().is_some_and(|c| c.trim().is_empty()) {
            return Err(anyhow!("protocol.command must start with a program"));
        }
        Ok(())
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(BACKEND_ENV).filter(|v| !v.trim().is_empty()) {
            self.backend = raw
                .parse()
                .with_context(|| format!("parse {BACKEND_ENV}"))?;
        }
        Ok(())
    }

    pub fn services_dir(&self, paths: &RunnerPaths) -> PathBuf {
        resolve(&paths.root, self.services_dir.as_deref(), &paths.services_dir)
    }

    pub fn sessions_dir(&self, paths: &RunnerPaths) -> PathBuf {
        resolve(&paths.root, self.sessions_dir.as_deref(), &paths.sessions_dir)
    }

    pub fn archive_dir(&self, paths: &RunnerPaths) -> PathBuf {
        resolve(&paths.root, self.archive_dir.as_deref(), &paths.archive_dir)
    }
}

fn resolve(root: &Path, configured: Option<&Path>, default: &Path) -> PathBuf {
    match configured {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => root.join(path),
        None => default.to_path_buf(),
    }
}

/// Load config from a TOML file and apply process environment overrides.
///
/// If the file is missing, starts from `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Like [`load_config`] with an injectable environment lookup.
pub fn load_config_with_env<F>(path: &Path, lookup: F) -> Result<RunnerConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        RunnerConfig::default()
    };
    cfg.apply_env_overrides(lookup)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::hooks::HookPoint;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config_with_env(&temp.path().join("missing.toml"), no_env).expect("load");
        assert_eq!(cfg, RunnerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = RunnerConfig::default();
        cfg.model = Some("sonnet".to_string());
        cfg.max_iterations = MaxIterations::Unlimited;
        cfg.hooks.set(HookPoint::EndRun, vec!["echo done".to_string()]);
        write_config(&path, &cfg).expect("write");
        let loaded = load_config_with_env(&path, no_env).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn parses_sections() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
backend = "shell"
max_iterations = "unlimited"

[rate_limit]
max_wait_secs = 120

[recovery.tool_execution]
max_retries = 1
continue_on_error = true

[hooks.START_RUN]
commands = ["echo start"]

[protocol]
command = ["python3", "server.py"]
"#,
        )
        .expect("write");
        let cfg = load_config_with_env(&path, no_env).expect("load");
        assert_eq!(cfg.backend, BackendKind::Shell);
        assert_eq!(cfg.max_iterations, MaxIterations::Unlimited);
        assert_eq!(cfg.rate_limit.max_wait_secs, 120);
        assert_eq!(cfg.rate_limit.fallback_wait_secs, 60);
        let recovery = cfg.recovery.get(&ErrorKind::ToolExecution).expect("recovery");
        assert_eq!(recovery.max_retries, 1);
        assert!(recovery.continue_on_error);
        assert!(cfg.hooks.get(HookPoint::StartRun).is_some());
        assert_eq!(cfg.protocol.command, vec!["python3", "server.py"]);
    }

    #[test]
    fn env_overrides_backend() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config_with_env(&temp.path().join("missing.toml"), |key| {
            (key == BACKEND_ENV).then(|| "shell".to_string())
        })
        .expect("load");
        assert_eq!(cfg.backend, BackendKind::Shell);

        let err = load_config_with_env(&temp.path().join("missing.toml"), |_| {
            Some("carrier-pigeon".to_string())
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("unknown backend"));
    }

    #[test]
    fn rejects_zero_iterations() {
        let cfg = RunnerConfig {
            max_iterations: MaxIterations::Limited(0),
            ..RunnerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn directory_overrides_resolve_against_root() {
        let paths = RunnerPaths::new("/project");
        let cfg = RunnerConfig {
            services_dir: Some(PathBuf::from("tools/services")),
            archive_dir: Some(PathBuf::from("/var/archive")),
            ..RunnerConfig::default()
        };
        assert_eq!(cfg.services_dir(&paths), PathBuf::from("/project/tools/services"));
        assert_eq!(cfg.archive_dir(&paths), PathBuf::from("/var/archive"));
        assert_eq!(cfg.sessions_dir(&paths), paths.sessions_dir);
    }
}
