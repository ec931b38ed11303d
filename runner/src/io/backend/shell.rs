//! Shell backend: one service-script subprocess per call.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::core::error::SubagentError;
use crate::core::stream::{LineBuffer, parse_line};
use crate::core::types::{BackendKind, BackendResult, ProgressEvent, ProgressEventType, SubagentKind};
use crate::io::backend::{Backend, BackendConfig, BackendRequest, ProgressEmitter};
use crate::io::process::{WaitOutcome, read_stream_limited, tail_text, terminate_gracefully, wait_with_deadline};

/// Characters of stderr used as error text when no error event was seen.
const STDERR_TAIL_CHARS: usize = 2_000;

/// Candidate script paths for `subagent`, in resolution order.
pub fn script_candidates(services_dir: &Path, subagent: &SubagentKind) -> Vec<PathBuf> {
    let name = subagent.as_str();
    vec![
        services_dir.join(format!("{name}.py")),
        services_dir.join(format!("{name}.sh")),
        services_dir.join("subagent.py"),
        services_dir.join("subagent.sh"),
    ]
}

/// First existing candidate, or an error naming every checked path.
pub fn resolve_script(services_dir: &Path, subagent: &SubagentKind) -> Result<PathBuf, SubagentError> {
    let candidates = script_candidates(services_dir, subagent);
    if let Some(found) = candidates.iter().find(|p| p.is_file()) {
        return Ok(found.clone());
    }
    let checked = candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(SubagentError::server_not_found(format!(
        "no service script for {subagent} (checked {checked})"
    )))
}

#[derive(Debug)]
pub struct ShellBackend {
    config: BackendConfig,
    emitter: ProgressEmitter,
}

impl Default for ShellBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellBackend {
    pub fn new() -> Self {
        Self {
            config: BackendConfig::default(),
            emitter: ProgressEmitter::new(BackendKind::Shell),
        }
    }

    fn command(&self, script: &Path, request: &BackendRequest) -> Command {
        let interpreter = match script.extension().and_then(|e| e.to_str()) {
            Some("py") => &self.config.shell.python,
            _ => &self.config.shell.bash,
        };
        let mut cmd = Command::new(interpreter);
        cmd.arg(script)
            .arg("-p")
            .arg(&request.instruction)
            .arg("--cd")
            .arg(&request.working_directory);
        if let Some(model) = &request.model {
            cmd.arg("-m").arg(model);
        }
        if request.working_directory.is_dir() {
            cmd.current_dir(&request.working_directory);
        }
        cmd.env("RUNNER_INSTRUCTION", &request.instruction)
            .env("RUNNER_PROJECT_PATH", &request.working_directory)
            .env("RUNNER_MODEL", request.model.as_deref().unwrap_or(""))
            .env("RUNNER_ITERATION", request.iteration.to_string())
            .env("RUNNER_CORRELATION_ID", &request.correlation_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// What stdout produced during one call.
#[derive(Debug, Default)]
struct StreamSummary {
    events: usize,
    result: Option<String>,
    texts: Vec<String>,
    last_error: Option<String>,
    /// Budget for `texts`, in bytes.
    text_limit: usize,
    text_bytes: usize,
    dropped_texts: usize,
}

impl StreamSummary {
    fn with_limit(text_limit: usize) -> Self {
        Self {
            text_limit,
            ..Self::default()
        }
    }

    fn record(&mut self, event: &ProgressEvent) {
        self.events += 1;
        match event.event_type {
            ProgressEventType::Result => self.result = Some(event.content.clone()),
            ProgressEventType::Error => self.last_error = Some(event.content.clone()),
            ProgressEventType::Start | ProgressEventType::Thinking => {
                if event.content.is_empty() {
                    return;
                }
                if self.text_bytes + event.content.len() > self.text_limit {
                    self.dropped_texts += 1;
                    return;
                }
                self.text_bytes += event.content.len();
                self.texts.push(event.content.clone());
            }
        }
    }

    fn content(&self) -> String {
        match &self.result {
            Some(result) => result.clone(),
            None => self.texts.join("\n"),
        }
    }
}

enum StreamEnd {
    Eof,
    TimedOut,
    Cancelled,
}

#[async_trait]
impl Backend for ShellBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Shell
    }

    fn configure(&mut self, config: BackendConfig) {
        self.config = config;
    }

    async fn initialize(&self) -> Result<(), SubagentError> {
        if !self.config.services_dir.is_dir() {
            return Err(SubagentError::server_not_found(format!(
                "services directory {} does not exist",
                self.config.services_dir.display()
            )));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(subagent = %request.subagent, iteration = request.iteration))]
    async fn execute(&self, request: &BackendRequest) -> Result<BackendResult, SubagentError> {
        let script = resolve_script(&self.config.services_dir, &request.subagent)?;
        info!(script = %script.display(), "starting service script");
        let started = Instant::now();

        let mut child = self.command(&script, request).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SubagentError::server_not_found(format!("spawn {}: {e}", script.display()))
            } else {
                SubagentError::tool_execution(format!("spawn {}: {e}", script.display()), None)
            }
        })?;

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_stream_limited(stderr, self.config.shell.output_limit_bytes)));
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SubagentError::tool_execution("stdout was not piped", None))?;

        let grace = Duration::from_millis(self.config.shell.grace_period_ms);
        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);

        let limit = self.config.shell.output_limit_bytes;
        let mut lines = LineBuffer::with_limit(limit);
        let mut summary = StreamSummary::with_limit(limit);
        let mut chunk = [0u8; 8192];
        let end = loop {
            tokio::select! {
                read = stdout.read(&mut chunk) => {
                    let n = match read {
                        Ok(n) => n,
                        Err(err) => {
                            warn!(err = %err, "stdout read failed");
                            0
                        }
                    };
                    if n == 0 {
                        if let Some(line) = lines.finish() {
                            self.handle_line(request, &line, &mut summary);
                        }
                        break StreamEnd::Eof;
                    }
                    for line in lines.push(&chunk[..n]) {
                        self.handle_line(request, &line, &mut summary);
                    }
                }
                () = request.cancel.cancelled() => break StreamEnd::Cancelled,
                () = &mut deadline => break StreamEnd::TimedOut,
            }
        };
        if lines.truncated_lines() > 0 || summary.dropped_texts > 0 {
            warn!(
                truncated_lines = lines.truncated_lines(),
                dropped_texts = summary.dropped_texts,
                limit_bytes = limit,
                "stdout exceeded the output limit"
            );
        }

        let outcome = match end {
            StreamEnd::Eof => {
                let remaining = request.timeout.saturating_sub(started.elapsed());
                wait_with_deadline(&mut child, remaining, grace, &request.cancel)
                    .await
                    .map_err(|e| SubagentError::tool_execution(format!("{e:#}"), None))?
            }
            StreamEnd::TimedOut => WaitOutcome::TimedOut(terminate_gracefully(&mut child, grace).await),
            StreamEnd::Cancelled => WaitOutcome::Cancelled(terminate_gracefully(&mut child, grace).await),
        };

        let (stderr, stderr_truncated) = match stderr_task {
            Some(task) => match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(Ok(captured))) => captured,
                _ => {
                    warn!("stderr capture failed");
                    (Vec::new(), 0)
                }
            },
            None => (Vec::new(), 0),
        };
        let duration = started.elapsed();

        let status = match outcome {
            WaitOutcome::Exited(status) => status,
            WaitOutcome::TimedOut(_) => {
                warn!(timeout_secs = request.timeout.as_secs(), "service script timed out");
                return Err(SubagentError::timeout(
                    format!("{} timed out after {}s", script.display(), request.timeout.as_secs()),
                    Some(request.timeout),
                ));
            }
            WaitOutcome::Cancelled(_) => {
                debug!("service script cancelled");
                return Err(SubagentError::tool_execution("execution cancelled", None));
            }
        };

        let exit_code = status.code();
        let metadata = json!({
            "script": script.display().to_string(),
            "exit_code": exit_code,
            "events": summary.events,
            "stderr_truncated": stderr_truncated,
        });
        let content = summary.content();
        if status.success() {
            debug!(events = summary.events, "service script completed");
            let mut result = BackendResult::completed(content, duration);
            result.metadata = metadata;
            return Ok(result);
        }

        let error = summary
            .last_error
            .clone()
            .filter(|e| !e.trim().is_empty())
            .or_else(|| Some(tail_text(&stderr, STDERR_TAIL_CHARS)).filter(|e| !e.is_empty()))
            .unwrap_or_else(|| format!("service script exited with status {exit_code:?}"));
        warn!(exit_code = ?exit_code, "service script failed");
        let mut result = BackendResult::failed(content, error, duration);
        result.metadata = metadata;
        Ok(result)
    }

    async fn is_available(&self) -> bool {
        let Ok(entries) = std::fs::read_dir(&self.config.services_dir) else {
            return false;
        };
        entries.flatten().any(|entry| {
            matches!(
                entry.path().extension().and_then(|e| e.to_str()),
                Some("py" | "sh")
            )
        })
    }

    fn emitter(&self) -> &ProgressEmitter {
        &self.emitter
    }

    async fn cleanup(&self) {}
}

impl ShellBackend {
    fn handle_line(&self, request: &BackendRequest, line: &str, summary: &mut StreamSummary) {
        let Some(parsed) = parse_line(line, self.config.verbose) else {
            return;
        };
        let event = self.emitter.emit(request, parsed);
        summary.record(&event);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::sync::{Arc, Mutex};

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::core::types::BackendStatus;

    fn backend(services_dir: &Path) -> ShellBackend {
        let mut backend = ShellBackend::new();
        backend.configure(BackendConfig {
            services_dir: services_dir.to_path_buf(),
            ..BackendConfig::default()
        });
        backend
    }

    fn request(dir: &Path, subagent: SubagentKind) -> BackendRequest {
        BackendRequest {
            instruction: "say hi".to_string(),
            working_directory: dir.to_path_buf(),
            model: Some("tiny".to_string()),
            subagent,
            iteration: 3,
            correlation_id: "corr-7".to_string(),
            timeout: Duration::from_secs(10),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    #[test]
    fn resolves_generic_fallback_script() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("subagent.sh"), "exit 0\n").expect("write");
        let script = resolve_script(temp.path(), &SubagentKind::Codex).expect("resolve");
        assert_eq!(script, temp.path().join("subagent.sh"));
    }

    #[test]
    fn prefers_agent_specific_script() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("subagent.py"), "").expect("write");
        fs::write(temp.path().join("claude.sh"), "").expect("write");
        let script = resolve_script(temp.path(), &SubagentKind::Claude).expect("resolve");
        assert_eq!(script, temp.path().join("claude.sh"));
    }

    #[test]
    fn missing_script_names_every_candidate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = resolve_script(temp.path(), &SubagentKind::Gemini).unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::ServerNotFound);
        for name in ["gemini.py", "gemini.sh", "subagent.py", "subagent.sh"] {
            assert!(err.message().contains(name), "{name} missing from {}", err.message());
        }
    }

    #[tokio::test]
    async fn initialize_requires_services_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = backend(&temp.path().join("missing")).initialize().await.unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::ServerNotFound);
        assert!(backend(temp.path()).initialize().await.is_ok());
    }

    #[tokio::test]
    async fn passes_env_and_args_and_streams_events() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("claude.sh"),
            r#"echo "{\"type\":\"start\",\"content\":\"$RUNNER_ITERATION $RUNNER_CORRELATION_ID $RUNNER_MODEL\"}"
echo "args: $*"
echo "{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"result\":\"$RUNNER_INSTRUCTION done\"}"
"#,
        )
        .expect("write");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let mut req = request(temp.path(), SubagentKind::Claude);
        req.progress = Some(Arc::new(move |e: &ProgressEvent| {
            sink_seen.lock().unwrap().push(e.clone());
        }));

        let result = backend(temp.path()).execute(&req).await.expect("execute");
        assert_eq!(result.status, BackendStatus::Completed);
        assert_eq!(result.content, "say hi done");

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, ProgressEventType::Start);
        assert_eq!(events[0].content, "3 corr-7 tiny");
        assert!(events[1].content.contains("-p say hi --cd"));
        assert!(events[1].content.contains("-m tiny"));
        assert_eq!(events[2].event_type, ProgressEventType::Result);
        let counts: Vec<u64> = events.iter().map(|e| e.count).collect();
        assert_eq!(counts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn nonzero_exit_uses_stderr_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("subagent.sh"),
            "echo working\necho 'fatal: model exploded' >&2\nexit 2\n",
        )
        .expect("write");
        let result = backend(temp.path())
            .execute(&request(temp.path(), SubagentKind::Codex))
            .await
            .expect("execute");
        assert_eq!(result.status, BackendStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("fatal: model exploded"));
        assert_eq!(result.metadata["exit_code"], 2);
        assert_eq!(result.content, "working");
    }

    #[tokio::test]
    async fn error_event_preferred_over_stderr() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("subagent.sh"),
            "echo '{\"type\":\"error\",\"content\":\"usage limit reached|1700000000\"}'\necho noise >&2\nexit 1\n",
        )
        .expect("write");
        let result = backend(temp.path())
            .execute(&request(temp.path(), SubagentKind::Claude))
            .await
            .expect("execute");
        assert_eq!(result.error.as_deref(), Some("usage limit reached|1700000000"));
    }

    #[tokio::test]
    async fn timeout_terminates_script() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("subagent.sh"), "echo started\nsleep 30\n").expect("write");
        let mut backend = backend(temp.path());
        backend.config.shell.grace_period_ms = 200;
        let mut req = request(temp.path(), SubagentKind::Claude);
        req.timeout = Duration::from_millis(300);
        let started = Instant::now();
        let err = backend.execute(&req).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn stdin_is_closed() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("subagent.sh"), "cat\necho after-cat\n").expect("write");
        let result = backend(temp.path())
            .execute(&request(temp.path(), SubagentKind::Claude))
            .await
            .expect("execute");
        assert_eq!(result.content, "after-cat");
    }

    #[tokio::test]
    async fn oversized_stdout_is_capped() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("subagent.sh"),
            "head -c 67108864 /dev/zero | tr '\\0' a\necho\nfor i in 1 2 3 4 5; do echo chatter-$i; done\n",
        )
        .expect("write");
        let mut backend = backend(temp.path());
        backend.config.shell.output_limit_bytes = 1_000;

        let result = backend
            .execute(&request(temp.path(), SubagentKind::Claude))
            .await
            .expect("execute");
        assert_eq!(result.status, BackendStatus::Completed);
        assert!(result.content.len() <= 1_000 + 16, "{} bytes kept", result.content.len());
        assert!(result.content.starts_with("aaaa"));
        assert!(!result.content.contains("chatter"));
    }

    #[tokio::test]
    async fn availability_tracks_scripts() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!backend(temp.path()).is_available().await);
        fs::write(temp.path().join("subagent.py"), "").expect("write");
        assert!(backend(temp.path()).is_available().await);
    }
}
