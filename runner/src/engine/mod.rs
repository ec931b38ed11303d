//! Execution engine: the iteration loop over one backend.
//!
//! One [`ExecutionEngine`] may serve many concurrent `execute()` calls; each
//! call owns its [`context::ExecutionContext`] and runs its iterations strictly
//! in sequence. Backend calls and every wait race the call's cancellation token,
//! which is a child of the engine's shutdown token. Backends observe that token
//! themselves; a call that ignores it is abandoned after a grace period.

pub mod context;
pub mod events;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::error::{ErrorKind, SubagentError};
use crate::core::rate_limit::{RateLimitDecision, RateLimitPolicy};
use crate::core::recovery::{RecoveryDecision, RecoveryTable};
use crate::core::stats::{PerformanceSnapshot, throughput};
use crate::core::stream::ParsedEvent;
use crate::core::types::{
    BackendResult, ExecutionRequest, ExecutionResult, ExecutionStatus, IterationResult, ProgressEvent,
    ProgressEventType,
};
use crate::engine::context::{EventLog, ExecutionContext};
use crate::engine::events::{EngineEvent, RecoveryAction};
use crate::io::backend::{Backend, BackendRequest, ProgressSink};
use crate::io::config::RunnerConfig;
use crate::io::hooks::{HookContext, HookPoint, HookRunner, HooksConfig};
use crate::observers::{Observers, Subscription};

/// Timing knobs for the loop and for shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Backend timeout when the request carries none.
    pub default_timeout: Duration,
    pub inter_iteration_delay: Duration,
    pub shutdown_timeout: Duration,
    /// How long a cancelled backend call may keep running.
    pub cancel_grace: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30 * 60),
            inter_iteration_delay: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            default_timeout: config.iteration_timeout(),
            inter_iteration_delay: config.engine.inter_iteration_delay(),
            shutdown_timeout: config.engine.shutdown_timeout(),
            cancel_grace: config.engine.cancel_grace(),
        }
    }
}

/// Result of a check run before each backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightOutcome {
    pub ok: bool,
    pub message: String,
}

/// Optional check surfaced as a `thinking` progress event before each call.
#[async_trait]
pub trait PreflightCheck: Send + Sync {
    async fn check(&self, request: &ExecutionRequest, iteration: u32) -> PreflightOutcome;
}

type CleanupFn = Box<dyn FnOnce() + Send>;

/// How one `run_loop` ended.
type LoopEnd = (ExecutionStatus, Option<SubagentError>);

pub struct ExecutionEngine {
    backend: Arc<dyn Backend>,
    options: EngineOptions,
    hooks: HooksConfig,
    hook_runner: HookRunner,
    recovery: RecoveryTable,
    rate_limit: RateLimitPolicy,
    preflight: Option<Arc<dyn PreflightCheck>>,
    events: Observers<EngineEvent>,
    progress: Observers<ProgressEvent>,
    active: Mutex<HashMap<String, CancellationToken>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    closed: AtomicBool,
    cleanups: Mutex<Vec<CleanupFn>>,
    started: Instant,
    total_iterations: AtomicU64,
    total_events: Arc<AtomicU64>,
    performance: RwLock<PerformanceSnapshot>,
    system: Mutex<sysinfo::System>,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("backend", &self.backend.kind())
            .field("options", &self.options)
            .field("active", &self.active_executions())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sleep for `duration` unless `cancel` fires first. Returns `false` when cancelled.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = cancel.cancelled() => false,
    }
}

/// Turn a backend-reported failure into a classified error.
fn failure_error(result: &BackendResult) -> SubagentError {
    let text = result
        .error
        .clone()
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| "backend reported failure".to_string());
    match SubagentError::classify(&text) {
        SubagentError::ToolExecution { message, .. } => {
            let exit_code = result
                .metadata
                .get("exit_code")
                .and_then(Value::as_i64)
                .and_then(|c| i32::try_from(c).ok());
            SubagentError::tool_execution(message, exit_code)
        }
        other => other,
    }
}

fn validate_request(request: &ExecutionRequest) -> Result<(), SubagentError> {
    if request.request_id.trim().is_empty() {
        return Err(SubagentError::validation("request_id", "request id must be non-empty"));
    }
    if request.instruction.trim().is_empty() {
        return Err(SubagentError::validation("instruction", "instruction must be non-empty"));
    }
    if request.subagent.as_str().trim().is_empty() {
        return Err(SubagentError::validation("subagent", "subagent must be non-empty"));
    }
    if request.working_directory.as_os_str().is_empty() {
        return Err(SubagentError::validation(
            "working_directory",
            "working directory must be non-empty",
        ));
    }
    if request.max_iterations.is_zero() {
        return Err(SubagentError::validation(
            "max_iterations",
            "max_iterations must be > 0 or unlimited",
        ));
    }
    Ok(())
}

/// Removes the request from the active map and stops the cancel link.
/// Holding it keeps the engine's task tracker from draining.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashMap<String, CancellationToken>>,
    request_id: String,
    link: Option<JoinHandle<()>>,
    _tracked: TaskTrackerToken,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        lock(self.active).remove(&self.request_id);
        if let Some(link) = self.link.take() {
            link.abort();
        }
    }
}

impl ExecutionEngine {
    pub fn new(backend: Arc<dyn Backend>, options: EngineOptions) -> Self {
        Self {
            backend,
            options,
            hooks: HooksConfig::default(),
            hook_runner: HookRunner::default(),
            recovery: RecoveryTable::default(),
            rate_limit: RateLimitPolicy::default(),
            preflight: None,
            events: Observers::new(),
            progress: Observers::new(),
            active: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            cleanups: Mutex::new(Vec::new()),
            started: Instant::now(),
            total_iterations: AtomicU64::new(0),
            total_events: Arc::new(AtomicU64::new(0)),
            performance: RwLock::new(PerformanceSnapshot::default()),
            system: Mutex::new(sysinfo::System::new()),
        }
    }

    /// Engine wired with hooks, recovery overrides, and rate-limit policy from `config`.
    pub fn from_config(backend: Arc<dyn Backend>, config: &RunnerConfig) -> Self {
        Self::new(backend, EngineOptions::from_config(config))
            .with_hooks(config.hooks.clone(), HookRunner::new(config.hook_runner.clone()))
            .with_recovery(RecoveryTable::from_settings(&config.recovery))
            .with_rate_limit(config.rate_limit)
    }

    pub fn with_hooks(mut self, hooks: HooksConfig, runner: HookRunner) -> Self {
        self.hooks = hooks;
        self.hook_runner = runner;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryTable) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = policy;
        self
    }

    pub fn with_preflight(mut self, check: Arc<dyn PreflightCheck>) -> Self {
        self.preflight = Some(check);
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn on_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&EngineEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// Observe progress events from every execution.
    pub fn on_progress<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ProgressEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.progress.subscribe(callback)
    }

    /// Run `callback` once during [`ExecutionEngine::shutdown`].
    pub fn register_cleanup<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        lock(&self.cleanups).push(Box::new(callback));
    }

    pub fn active_executions(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn performance(&self) -> PerformanceSnapshot {
        self.performance
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Cancel one in-flight execution. Returns `false` when it is not running.
    pub fn cancel(&self, request_id: &str) -> bool {
        match lock(&self.active).get(request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run `request` to a terminal status.
    ///
    /// Only request validation fails with `Err`; every other failure is
    /// reported through the returned result's status and error.
    #[instrument(skip_all, fields(request_id = %request.request_id, subagent = %request.subagent))]
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<ExecutionResult, SubagentError> {
        validate_request(&request)?;
        if self.is_shutting_down() {
            return Err(SubagentError::validation("engine", "engine is shutting down"));
        }

        let token = self.shutdown.child_token();
        {
            let mut active = lock(&self.active);
            if active.contains_key(&request.request_id) {
                return Err(SubagentError::validation(
                    "request_id",
                    format!("request {} is already running", request.request_id),
                ));
            }
            active.insert(request.request_id.clone(), token.clone());
        }
        let link = cancel.map(|user| {
            let token = token.clone();
            tokio::spawn(async move {
                user.cancelled().await;
                token.cancel();
            })
        });
        let _guard = ActiveGuard {
            active: &self.active,
            request_id: request.request_id.clone(),
            link,
            _tracked: self.tracker.token(),
        };

        let hook_ctx = HookContext {
            run_id: request.request_id.clone(),
            session_id: request.session_id.clone(),
            iteration: None,
            working_directory: request.working_directory.clone(),
            metadata: request.metadata.clone(),
            cancel: token.clone(),
        };
        let mut ctx = ExecutionContext::new(request, token);
        info!(max_iterations = %ctx.request.max_iterations, "execution started");
        self.events.emit(&EngineEvent::ExecutionStarted {
            request_id: ctx.request.request_id.clone(),
            subagent: ctx.request.subagent.clone(),
            max_iterations: ctx.request.max_iterations,
        });

        self.run_hook(HookPoint::StartRun, &hook_ctx).await;
        ctx.status = ExecutionStatus::Running;
        let (status, error) = self.run_loop(&mut ctx, &hook_ctx).await;
        ctx.status = status;
        // A cancelled run still gets its END_RUN hooks; only shutdown interrupts them.
        let end_ctx = HookContext {
            cancel: self.shutdown.child_token(),
            ..hook_ctx
        };
        self.run_hook(HookPoint::EndRun, &end_ctx).await;

        let result = ctx.finish(status, error);
        match &result.error {
            Some(err) => warn!(status = %result.status, err = %err, "execution finished"),
            None => info!(status = %result.status, iterations = result.iterations.len(), "execution finished"),
        }
        self.refresh_performance();
        self.events.emit(&EngineEvent::ExecutionCompleted {
            result: Box::new(result.clone()),
        });
        Ok(result)
    }

    async fn run_loop(&self, ctx: &mut ExecutionContext, hook_ctx: &HookContext) -> LoopEnd {
        let request_id = ctx.request.request_id.clone();
        let mut iteration = 1u32;
        let mut retries = 0u32;

        loop {
            if ctx.is_cancelled() {
                return (ExecutionStatus::Cancelled, None);
            }
            if !ctx.request.max_iterations.allows(iteration) {
                return (ExecutionStatus::Completed, None);
            }

            let iter_hooks = hook_ctx.with_iteration(iteration);
            self.run_hook(HookPoint::StartIteration, &iter_hooks).await;
            if ctx.is_cancelled() {
                return (ExecutionStatus::Cancelled, None);
            }
            self.events.emit(&EngineEvent::IterationStarted {
                request_id: request_id.clone(),
                iteration,
                attempt: retries,
            });

            let backend_request = self.backend_request(ctx, iteration);
            if let Some(check) = &self.preflight {
                let outcome = check.check(&ctx.request, iteration).await;
                self.backend.emitter().emit(
                    &backend_request,
                    ParsedEvent {
                        event_type: ProgressEventType::Thinking,
                        content: outcome.message,
                        metadata: json!({"preflight": true, "ok": outcome.ok}),
                    },
                );
            }

            let started_at = Utc::now();
            let started = Instant::now();
            let Some(outcome) = self.call_backend(&backend_request).await else {
                return (ExecutionStatus::Cancelled, None);
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let (error, payload) = match outcome {
                Ok(result) if result.is_success() => {
                    let settled = IterationResult {
                        iteration,
                        success: true,
                        started_at,
                        ended_at: Utc::now(),
                        duration_ms,
                        result: Some(result),
                        error: None,
                        retries,
                    };
                    self.settle(ctx, settled, &iter_hooks).await;
                    iteration += 1;
                    retries = 0;
                    if ctx.request.max_iterations.allows(iteration)
                        && !pause(&ctx.cancel, self.options.inter_iteration_delay).await
                    {
                        return (ExecutionStatus::Cancelled, None);
                    }
                    continue;
                }
                Ok(result) => (failure_error(&result), Some(result)),
                Err(err) => (err, None),
            };

            if ctx.is_cancelled() {
                debug!(iteration, err = %error, "error after cancellation");
                return (ExecutionStatus::Cancelled, None);
            }
            let kind = error.kind();
            warn!(iteration, kind = kind.as_str(), err = %error, "iteration failed");
            self.events.emit(&EngineEvent::Error {
                request_id: request_id.clone(),
                iteration,
                error: error.clone(),
            });

            // A rate limit that is waited out counts toward the rate-limit tally only.
            if kind == ErrorKind::RateLimit {
                match self.rate_limit.decide(error.reset_time(), Utc::now()) {
                    RateLimitDecision::Wait(wait) => {
                        ctx.statistics.record_rate_limit(wait);
                        ctx.status = ExecutionStatus::RateLimited;
                        ctx.rate_limited_until =
                            chrono::Duration::from_std(wait).ok().map(|w| Utc::now() + w);
                        info!(iteration, wait_secs = wait.as_secs(), "rate limited; waiting");
                        self.events.emit(&EngineEvent::RateLimitStarted {
                            request_id: request_id.clone(),
                            iteration,
                            wait_ms: wait.as_millis() as u64,
                        });
                        let waited = pause(&ctx.cancel, wait).await;
                        ctx.rate_limited_until = None;
                        if !waited {
                            return (ExecutionStatus::Cancelled, None);
                        }
                        ctx.status = ExecutionStatus::Running;
                        self.events.emit(&EngineEvent::RateLimitEnded {
                            request_id: request_id.clone(),
                            iteration,
                        });
                        continue;
                    }
                    RateLimitDecision::Abort(wait) => {
                        ctx.statistics.record_error(kind);
                        ctx.statistics.record_rate_limit(Duration::ZERO);
                        let error = error.annotate(&format!(
                            "required wait {}s exceeds limit {}s",
                            wait.as_secs(),
                            self.rate_limit.max_wait().as_secs()
                        ));
                        error!(iteration, wait_secs = wait.as_secs(), "rate-limit wait too long; aborting");
                        let settled = self.failed_iteration(iteration, started_at, duration_ms, payload, &error, retries);
                        self.settle(ctx, settled, &iter_hooks).await;
                        self.emit_recovery(&request_id, iteration, kind, RecoveryAction::Abort, Duration::ZERO);
                        return (ExecutionStatus::Failed, Some(error));
                    }
                }
            }

            ctx.statistics.record_error(kind);
            match self.recovery.decide(&error, iteration, retries) {
                RecoveryDecision::Retry(delay) => {
                    retries += 1;
                    ctx.statistics.retries += 1;
                    info!(iteration, retry = retries, "retrying iteration");
                    self.emit_recovery(&request_id, iteration, kind, RecoveryAction::Retry, delay);
                    if !pause(&ctx.cancel, delay).await {
                        return (ExecutionStatus::Cancelled, None);
                    }
                }
                RecoveryDecision::Continue(delay) => {
                    let settled = self.failed_iteration(iteration, started_at, duration_ms, payload, &error, retries);
                    self.settle(ctx, settled, &iter_hooks).await;
                    self.emit_recovery(&request_id, iteration, kind, RecoveryAction::Continue, delay);
                    iteration += 1;
                    retries = 0;
                    if !pause(&ctx.cancel, delay).await {
                        return (ExecutionStatus::Cancelled, None);
                    }
                }
                RecoveryDecision::Abort => {
                    let settled = self.failed_iteration(iteration, started_at, duration_ms, payload, &error, retries);
                    self.settle(ctx, settled, &iter_hooks).await;
                    self.emit_recovery(&request_id, iteration, kind, RecoveryAction::Abort, Duration::ZERO);
                    let status = if kind == ErrorKind::Timeout {
                        ExecutionStatus::Timeout
                    } else {
                        ExecutionStatus::Failed
                    };
                    return (status, Some(error));
                }
            }
        }
    }

    /// Await one backend call. Once the request is cancelled the backend has
    /// `cancel_grace` to return on its own; `None` means it was abandoned.
    async fn call_backend(&self, request: &BackendRequest) -> Option<Result<BackendResult, SubagentError>> {
        let call = self.backend.execute(request);
        tokio::pin!(call);
        tokio::select! {
            outcome = &mut call => return Some(outcome),
            () = request.cancel.cancelled() => {}
        }
        debug!(iteration = request.iteration, "backend call cancelled; waiting for it to stop");
        match tokio::time::timeout(self.options.cancel_grace, call).await {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                warn!(
                    iteration = request.iteration,
                    grace_ms = self.options.cancel_grace.as_millis() as u64,
                    "backend ignored cancellation; abandoning call"
                );
                None
            }
        }
    }

    fn backend_request(&self, ctx: &ExecutionContext, iteration: u32) -> BackendRequest {
        BackendRequest {
            instruction: ctx.request.instruction.clone(),
            working_directory: ctx.request.working_directory.clone(),
            model: ctx.request.model.clone(),
            subagent: ctx.request.subagent.clone(),
            iteration,
            correlation_id: ctx.request.correlation_id().to_string(),
            timeout: ctx.request.timeout.unwrap_or(self.options.default_timeout),
            cancel: ctx.cancel.clone(),
            progress: Some(self.progress_sink(&ctx.events)),
        }
    }

    /// Sink that records into the execution's log and forwards to observers.
    fn progress_sink(&self, log: &EventLog) -> ProgressSink {
        let log = log.clone();
        let progress = self.progress.clone();
        let events = self.events.clone();
        let total = Arc::clone(&self.total_events);
        Arc::new(move |event: &ProgressEvent| {
            log.push(event.clone());
            total.fetch_add(1, Ordering::Relaxed);
            progress.emit(event);
            events.emit(&EngineEvent::Progress(event.clone()));
        })
    }

    fn failed_iteration(
        &self,
        iteration: u32,
        started_at: chrono::DateTime<Utc>,
        duration_ms: u64,
        payload: Option<BackendResult>,
        error: &SubagentError,
        retries: u32,
    ) -> IterationResult {
        IterationResult {
            iteration,
            success: false,
            started_at,
            ended_at: Utc::now(),
            duration_ms,
            result: payload,
            error: Some(error.clone()),
            retries,
        }
    }

    /// Record a settled iteration, publish it, and run `END_ITERATION`.
    async fn settle(&self, ctx: &mut ExecutionContext, settled: IterationResult, hook_ctx: &HookContext) {
        debug!(iteration = settled.iteration, success = settled.success, "iteration settled");
        ctx.record_iteration(settled.clone());
        self.total_iterations.fetch_add(1, Ordering::Relaxed);
        self.events.emit(&EngineEvent::IterationCompleted {
            request_id: ctx.request.request_id.clone(),
            result: settled,
        });
        self.refresh_performance();
        self.run_hook(HookPoint::EndIteration, hook_ctx).await;
    }

    fn emit_recovery(&self, request_id: &str, iteration: u32, kind: ErrorKind, action: RecoveryAction, delay: Duration) {
        self.events.emit(&EngineEvent::Recovery {
            request_id: request_id.to_string(),
            iteration,
            kind,
            action,
            delay_ms: delay.as_millis() as u64,
        });
    }

    /// Hooks share the context's cancel token, so cancellation interrupts them.
    async fn run_hook(&self, point: HookPoint, hook_ctx: &HookContext) {
        let report = self.hook_runner.execute_hook(point, &self.hooks, hook_ctx).await;
        if !report.all_succeeded() {
            warn!(point = %point, failures = report.failures(), "hook commands failed");
        }
    }

    fn refresh_performance(&self) {
        let total_iterations = self.total_iterations.load(Ordering::Relaxed);
        let total_events = self.total_events.load(Ordering::Relaxed);
        let (iterations_per_minute, events_per_second) =
            throughput(total_iterations, total_events, self.started.elapsed());
        let snapshot = PerformanceSnapshot {
            memory_bytes: self.process_memory(),
            iterations_per_minute,
            events_per_second,
            active_executions: self.active_executions(),
            total_iterations,
            total_events,
            updated_at: Some(Utc::now()),
        };
        *self
            .performance
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot;
    }

    fn process_memory(&self) -> u64 {
        let Ok(pid) = sysinfo::get_current_pid() else {
            return 0;
        };
        let mut system = lock(&self.system);
        system.refresh_process(pid);
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }

    /// Stop accepting work, cancel in-flight executions, and release resources.
    ///
    /// Cleanup callbacks and backend cleanup run even when in-flight executions
    /// do not unwind within the shutdown timeout; the timeout is still reported.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) -> Result<(), SubagentError> {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        self.tracker.close();

        let mut outcome = Ok(());
        if tokio::time::timeout(self.options.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            let pending = self.active_executions();
            error!(pending, "executions did not stop before the shutdown timeout");
            outcome = Err(SubagentError::timeout(
                format!("{pending} execution(s) still running at shutdown"),
                Some(self.options.shutdown_timeout),
            ));
        }

        let cleanups = std::mem::take(&mut *lock(&self.cleanups));
        for cleanup in cleanups {
            cleanup();
        }
        self.backend.cleanup().await;
        info!("engine shut down");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::core::types::{BackendStatus, MaxIterations, SubagentKind};

    #[test]
    fn failure_error_classifies_text_and_keeps_exit_code() {
        let mut result = BackendResult::failed("", "boom", Duration::ZERO);
        result.metadata = json!({"exit_code": 3});
        assert_eq!(failure_error(&result), SubagentError::tool_execution("boom", Some(3)));

        let limited = BackendResult::failed("", "429 Too Many Requests", Duration::ZERO);
        assert_eq!(failure_error(&limited).kind(), ErrorKind::RateLimit);

        let reset = BackendResult::failed("", "read: connection reset by peer", Duration::ZERO);
        assert_eq!(failure_error(&reset).kind(), ErrorKind::Connection);

        let mut silent = BackendResult::failed("", "", Duration::ZERO);
        silent.status = BackendStatus::Failed;
        assert_eq!(failure_error(&silent).message(), "backend reported failure");
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        let base = ExecutionRequest::new("x", SubagentKind::Claude, "/tmp", MaxIterations::Limited(1));
        assert!(validate_request(&base).is_ok());

        let mut empty = base.clone();
        empty.instruction = "  ".to_string();
        assert_eq!(validate_request(&empty).unwrap_err().kind(), ErrorKind::Validation);

        let mut zero = base.clone();
        zero.max_iterations = MaxIterations::Limited(0);
        assert!(validate_request(&zero).unwrap_err().message().contains("max_iterations"));

        let mut no_dir = base.clone();
        no_dir.working_directory = PathBuf::new();
        assert!(validate_request(&no_dir).is_err());

        let mut no_agent = base;
        no_agent.subagent = SubagentKind::Other(String::new());
        assert!(validate_request(&no_agent).is_err());
    }

    #[tokio::test]
    async fn pause_returns_false_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!pause(&cancel, Duration::from_secs(60)).await);
        assert!(pause(&CancellationToken::new(), Duration::from_millis(1)).await);
    }

    #[test]
    fn engine_event_request_ids() {
        let event = EngineEvent::RateLimitEnded {
            request_id: "r1".to_string(),
            iteration: 2,
        };
        assert_eq!(event.request_id(), Some("r1"));
    }
}
