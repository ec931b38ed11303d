//! Helpers for running child processes with timeouts, cancellation, and bounded output.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// How long to wait for output readers after the child has exited.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    /// `None` when the child had to be killed and its status was unavailable.
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.status.is_some_and(|s| s.success())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// How a supervised child finished.
#[derive(Debug)]
pub enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut(Option<ExitStatus>),
    Cancelled(Option<ExitStatus>),
}

/// Run a command to completion, capturing stdout/stderr without risking pipe deadlocks.
///
/// Stdin is detached. Output is read concurrently while the child runs;
/// `output_limit_bytes` bounds what is kept (the rest is drained and counted).
/// On timeout or cancellation the child is terminated with `grace` before a kill.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub async fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    grace: Duration,
    output_limit_bytes: usize,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = tokio::spawn(read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = tokio::spawn(read_stream_limited(stderr, output_limit_bytes));

    let outcome = wait_with_deadline(&mut child, timeout, grace, cancel).await?;

    let (stdout, stdout_truncated) = join_output(stdout_handle).await.context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).await.context("join stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let (status, timed_out, cancelled) = match outcome {
        WaitOutcome::Exited(status) => (Some(status), false, false),
        WaitOutcome::TimedOut(status) => (status, true, false),
        WaitOutcome::Cancelled(status) => (status, false, true),
    };
    debug!(exit_code = ?status.and_then(|s| s.code()), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

/// Wait for `child`, terminating it when `timeout` elapses or `cancel` fires.
pub async fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
    grace: Duration,
    cancel: &CancellationToken,
) -> Result<WaitOutcome> {
    tokio::select! {
        status = child.wait() => {
            Ok(WaitOutcome::Exited(status.context("wait for command")?))
        }
        () = cancel.cancelled() => {
            debug!("cancellation requested; terminating process");
            Ok(WaitOutcome::Cancelled(terminate_gracefully(child, grace).await))
        }
        () = tokio::time::sleep(timeout) => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, terminating");
            Ok(WaitOutcome::TimedOut(terminate_gracefully(child, grace).await))
        }
    }
}

/// Send SIGTERM, wait up to `grace`, then kill. Returns the exit status when known.
pub async fn terminate_gracefully(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    send_terminate(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => return Some(status),
        Ok(Err(err)) => warn!(err = %err, "wait after terminate failed"),
        Err(_) => debug!(grace_ms = grace.as_millis() as u64, "grace period elapsed, killing"),
    }
    if let Err(err) = child.kill().await {
        warn!(err = %err, "failed to kill process");
    }
    child.wait().await.ok()
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, err = %err, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) {}

async fn join_output(handle: JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match tokio::time::timeout(IO_CAPTURE_TIMEOUT, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(anyhow!("output reader task panicked")),
        Err(_) => {
            warn!("output capture timed out");
            Ok((Vec::new(), 0))
        }
    }
}

/// Read a stream to EOF, keeping at most `limit` bytes.
pub async fn read_stream_limited<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await.context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

/// Last `max_chars` characters of `bytes`, decoded lossily and trimmed.
pub fn tail_text(bytes: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - max_chars).collect()
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_output_and_status() {
        let out = run_command_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            Duration::from_secs(5),
            Duration::from_millis(100),
            1024,
            &CancellationToken::new(),
        )
        .await
        .expect("run");
        assert_eq!(out.stdout, b"out\n");
        assert_eq!(out.stderr, b"err\n");
        assert_eq!(out.exit_code(), Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn truncates_beyond_limit() {
        let out = run_command_with_timeout(
            sh("printf 'abcdefghij'"),
            Duration::from_secs(5),
            Duration::from_millis(100),
            4,
            &CancellationToken::new(),
        )
        .await
        .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
    }

    #[tokio::test]
    async fn timeout_terminates_child() {
        let started = Instant::now();
        let out = run_command_with_timeout(
            sh("sleep 30"),
            Duration::from_millis(200),
            Duration::from_millis(200),
            1024,
            &CancellationToken::new(),
        )
        .await
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_terminates_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let out = run_command_with_timeout(
            sh("sleep 30"),
            Duration::from_secs(30),
            Duration::from_millis(200),
            1024,
            &cancel,
        )
        .await
        .expect("run");
        assert!(out.cancelled);
    }

    #[test]
    fn tail_text_keeps_end() {
        assert_eq!(tail_text(b"  hello world \n", 5), "world");
        assert_eq!(tail_text(b"short", 50), "short");
    }
}
