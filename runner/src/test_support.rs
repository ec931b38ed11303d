//! Test-only helpers: a scripted backend, request builders, and scratch projects.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use crate::core::error::SubagentError;
use crate::core::stream::ParsedEvent;
use crate::core::types::{
    BackendKind, BackendResult, ExecutionRequest, MaxIterations, ProgressEventType, SubagentKind,
};
use crate::engine::{EngineOptions, ExecutionEngine};
use crate::io::backend::{Backend, BackendConfig, BackendRequest, ProgressEmitter};
use crate::io::init::{InitOptions, RunnerPaths, init_runner};
use crate::io::session_store::SessionStore;

/// One scripted backend reply.
#[derive(Debug, Clone)]
pub enum ScriptedCall {
    /// Completed with this content.
    Ok(String),
    /// `Failed` result with this error text.
    Fail(String),
    /// Typed transport error.
    Err(SubagentError),
    /// Block until the call is cancelled.
    Hang,
    /// Block forever, ignoring cancellation.
    Stuck,
}

impl ScriptedCall {
    pub fn ok(content: &str) -> Self {
        ScriptedCall::Ok(content.to_string())
    }
}

/// Backend that replays queued replies, then repeats the fallback.
///
/// Every call emits one `thinking` progress event and records its iteration.
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<ScriptedCall>>,
    fallback: ScriptedCall,
    iterations: Mutex<Vec<u32>>,
    cleanups: AtomicU32,
    emitter: ProgressEmitter,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<ScriptedCall>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: ScriptedCall::ok("ok"),
            iterations: Mutex::new(Vec::new()),
            cleanups: AtomicU32::new(0),
            emitter: ProgressEmitter::new(BackendKind::Shell),
        }
    }

    pub fn with_fallback(mut self, fallback: ScriptedCall) -> Self {
        self.fallback = fallback;
        self
    }

    /// Iteration numbers seen, one per call.
    pub fn iterations(&self) -> Vec<u32> {
        self.iterations.lock().expect("iterations lock").clone()
    }

    pub fn calls(&self) -> usize {
        self.iterations().len()
    }

    pub fn cleanup_count(&self) -> u32 {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Shell
    }

    fn configure(&mut self, _config: BackendConfig) {}

    async fn initialize(&self) -> Result<(), SubagentError> {
        Ok(())
    }

    async fn execute(&self, request: &BackendRequest) -> Result<BackendResult, SubagentError> {
        self.iterations
            .lock()
            .expect("iterations lock")
            .push(request.iteration);
        self.emitter.emit(
            request,
            ParsedEvent {
                event_type: ProgressEventType::Thinking,
                content: format!("iteration {}", request.iteration),
                metadata: Value::Null,
            },
        );
        let reply = self
            .replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            ScriptedCall::Ok(content) => Ok(BackendResult::completed(content, Duration::from_millis(1))),
            ScriptedCall::Fail(error) => Ok(BackendResult::failed("", error, Duration::from_millis(1))),
            ScriptedCall::Err(err) => Err(err),
            ScriptedCall::Hang => {
                request.cancel.cancelled().await;
                Err(SubagentError::tool_execution("execution cancelled", None))
            }
            ScriptedCall::Stuck => std::future::pending().await,
        }
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn emitter(&self) -> &ProgressEmitter {
        &self.emitter
    }

    async fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Engine options with no pauses, for fast tests.
pub fn fast_options() -> EngineOptions {
    EngineOptions {
        default_timeout: Duration::from_secs(10),
        inter_iteration_delay: Duration::ZERO,
        shutdown_timeout: Duration::from_secs(5),
        cancel_grace: Duration::from_secs(5),
    }
}

/// Engine over `backend` with [`fast_options`].
pub fn engine(backend: Arc<ScriptedBackend>) -> ExecutionEngine {
    ExecutionEngine::new(backend, fast_options())
}

/// Request for the Claude subagent in `dir`.
pub fn request(dir: &Path, instruction: &str, max_iterations: MaxIterations) -> ExecutionRequest {
    ExecutionRequest::new(instruction, SubagentKind::Claude, dir, max_iterations)
}

/// Scratch project with `.runner/` scaffolding.
pub struct TestProject {
    dir: TempDir,
    pub paths: RunnerPaths,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let paths = init_runner(dir.path(), &InitOptions { force: false })?;
        Ok(Self { dir, paths })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn store(&self) -> SessionStore {
        SessionStore::new(&self.paths.sessions_dir, &self.paths.archive_dir)
    }

    /// Write a service script into `.runner/services`.
    pub fn write_service(&self, file_name: &str, body: &str) -> Result<PathBuf> {
        let path = self.paths.services_dir.join(file_name);
        fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}
