//! Lifecycle hooks: ordered shell commands bound to fixed points of a run.
//!
//! Hooks are best-effort. Spawn failures, non-zero exits, and timeouts are
//! recorded in the [`HookReport`] and logged; they never fail the caller.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::io::process::{run_command_with_timeout, tail_text};

/// Characters of output kept per command in the report.
const REPORT_TAIL_CHARS: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HookPoint {
    StartRun,
    StartIteration,
    EndIteration,
    EndRun,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::StartRun => "START_RUN",
            HookPoint::StartIteration => "START_ITERATION",
            HookPoint::EndIteration => "END_ITERATION",
            HookPoint::EndRun => "END_RUN",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookCommands {
    pub commands: Vec<String>,
}

/// Commands per hook point (TOML `[hooks.START_RUN] commands = [..]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    #[serde(rename = "START_RUN", skip_serializing_if = "Option::is_none")]
    pub start_run: Option<HookCommands>,
    #[serde(rename = "START_ITERATION", skip_serializing_if = "Option::is_none")]
    pub start_iteration: Option<HookCommands>,
    #[serde(rename = "END_ITERATION", skip_serializing_if = "Option::is_none")]
    pub end_iteration: Option<HookCommands>,
    #[serde(rename = "END_RUN", skip_serializing_if = "Option::is_none")]
    pub end_run: Option<HookCommands>,
}

impl HooksConfig {
    pub fn get(&self, point: HookPoint) -> Option<&HookCommands> {
        match point {
            HookPoint::StartRun => self.start_run.as_ref(),
            HookPoint::StartIteration => self.start_iteration.as_ref(),
            HookPoint::EndIteration => self.end_iteration.as_ref(),
            HookPoint::EndRun => self.end_run.as_ref(),
        }
    }

    pub fn set(&mut self, point: HookPoint, commands: Vec<String>) {
        let slot = match point {
            HookPoint::StartRun => &mut self.start_run,
            HookPoint::StartIteration => &mut self.start_iteration,
            HookPoint::EndIteration => &mut self.end_iteration,
            HookPoint::EndRun => &mut self.end_run,
        };
        *slot = Some(HookCommands { commands });
    }

    pub fn is_empty(&self) -> bool {
        [
            HookPoint::StartRun,
            HookPoint::StartIteration,
            HookPoint::EndIteration,
            HookPoint::EndRun,
        ]
        .iter()
        .all(|point| self.get(*point).is_none_or(|h| h.commands.is_empty()))
    }
}

/// Runner-wide hook execution settings (TOML `[hook_runner]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookOptions {
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    pub stop_on_failure: bool,
}

impl Default for HookOptions {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            output_limit_bytes: 64 * 1024,
            stop_on_failure: false,
        }
    }
}

/// Values exported to hook commands as environment variables.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub run_id: String,
    pub session_id: Option<String>,
    pub iteration: Option<u32>,
    pub working_directory: PathBuf,
    pub metadata: BTreeMap<String, String>,
    /// Kills a running command and skips the rest of the list.
    pub cancel: CancellationToken,
}

impl HookContext {
    pub fn with_iteration(&self, iteration: u32) -> Self {
        Self {
            iteration: Some(iteration),
            ..self.clone()
        }
    }

    fn env(&self, point: HookPoint) -> Vec<(String, String)> {
        let mut env = vec![
            ("RUNNER_HOOK".to_string(), point.to_string()),
            ("RUNNER_RUN_ID".to_string(), self.run_id.clone()),
        ];
        if let Some(iteration) = self.iteration {
            env.push(("RUNNER_ITERATION".to_string(), iteration.to_string()));
        }
        if let Some(session_id) = &self.session_id {
            env.push(("RUNNER_SESSION_ID".to_string(), session_id.clone()));
        }
        for (key, value) in &self.metadata {
            env.push((format!("RUNNER_META_{}", env_key(key)), value.clone()));
        }
        env
    }
}

fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Outcome of one hook command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookCommandResult {
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of every command run for one hook point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookReport {
    pub point: HookPoint,
    pub results: Vec<HookCommandResult>,
}

impl HookReport {
    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures() == 0
    }
}

/// Runs hook command lists through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct HookRunner {
    options: HookOptions,
}

impl HookRunner {
    pub fn new(options: HookOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &HookOptions {
        &self.options
    }

    /// Run the commands bound to `point`, sequentially, in the context's working directory.
    ///
    /// A missing or empty entry yields an empty report.
    #[instrument(skip_all, fields(point = %point, run_id = %context.run_id))]
    pub async fn execute_hook(
        &self,
        point: HookPoint,
        hooks: &HooksConfig,
        context: &HookContext,
    ) -> HookReport {
        let mut report = HookReport {
            point,
            results: Vec::new(),
        };
        let Some(entry) = hooks.get(point) else {
            return report;
        };
        let env = context.env(point);
        for command in entry.commands.iter().filter(|c| !c.trim().is_empty()) {
            if context.cancel.is_cancelled() {
                debug!(point = %point, "hook list cancelled");
                break;
            }
            let result = self.run_one(command, &env, context).await;
            let failed = !result.success;
            report.results.push(result);
            if failed && self.options.stop_on_failure {
                warn!(point = %point, "stopping hook list after failure");
                break;
            }
        }
        if !report.results.is_empty() {
            info!(
                point = %point,
                commands = report.results.len(),
                failures = report.failures(),
                "hook finished"
            );
        }
        report
    }

    async fn run_one(
        &self,
        command: &str,
        env: &[(String, String)],
        context: &HookContext,
    ) -> HookCommandResult {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        if context.working_directory.is_dir() {
            cmd.current_dir(&context.working_directory);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }

        debug!(command, "running hook command");
        let started = Instant::now();
        let timeout = Duration::from_secs(self.options.timeout_secs);
        let output = run_command_with_timeout(
            cmd,
            timeout,
            Duration::from_secs(2),
            self.options.output_limit_bytes,
            &context.cancel,
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match output {
            Ok(out) => {
                let success = out.success();
                let error = if out.timed_out {
                    Some(format!("timed out after {}s", timeout.as_secs()))
                } else if out.cancelled {
                    Some("cancelled".to_string())
                } else if !success {
                    Some(format!("exited with status {:?}", out.exit_code()))
                } else {
                    None
                };
                if let Some(err) = &error {
                    warn!(command, err = %err, "hook command failed");
                }
                HookCommandResult {
                    command: command.to_string(),
                    success,
                    exit_code: out.exit_code(),
                    timed_out: out.timed_out,
                    duration_ms,
                    stdout: tail_text(&out.stdout, REPORT_TAIL_CHARS),
                    stderr: format!(
                        "{}{}",
                        tail_text(&out.stderr, REPORT_TAIL_CHARS),
                        out.stderr_truncated_notice("hook")
                    ),
                    error,
                }
            }
            Err(err) => {
                warn!(command, err = %format!("{err:#}"), "hook command could not start");
                HookCommandResult {
                    command: command.to_string(),
                    success: false,
                    exit_code: None,
                    timed_out: false,
                    duration_ms,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(format!("{err:#}")),
                }
            }
        }
    }
}
