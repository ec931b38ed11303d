//! Backend abstraction over subagent transports.
//!
//! The [`Backend`] trait decouples the engine from how a subagent is reached.
//! [`shell::ShellBackend`] spawns a service script per call;
//! [`protocol::ProtocolBackend`] calls a tool on a long-lived MCP server.
//! Tests use scripted backends that return predetermined results.

pub mod mcp;
pub mod protocol;
pub mod shell;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::core::error::SubagentError;
use crate::core::stream::ParsedEvent;
use crate::core::types::{BackendKind, BackendResult, ProgressEvent, SubagentKind};
use crate::io::config::{ProtocolSettings, RunnerConfig, ShellSettings};
use crate::io::init::RunnerPaths;
use crate::observers::{Observers, Subscription};

/// Per-call sink the engine passes to record and forward progress events.
pub type ProgressSink = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Settings assigned by [`Backend::configure`].
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub services_dir: PathBuf,
    /// Render structured events as raw `key=value` summaries.
    pub verbose: bool,
    pub shell: ShellSettings,
    pub protocol: ProtocolSettings,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            services_dir: PathBuf::from(".runner/services"),
            verbose: false,
            shell: ShellSettings::default(),
            protocol: ProtocolSettings::default(),
        }
    }
}

impl BackendConfig {
    pub fn from_runner_config(config: &RunnerConfig, paths: &RunnerPaths) -> Self {
        Self {
            services_dir: config.services_dir(paths),
            verbose: config.verbose,
            shell: config.shell.clone(),
            protocol: config.protocol.clone(),
        }
    }
}

/// Parameters for one backend call.
#[derive(Clone)]
pub struct BackendRequest {
    pub instruction: String,
    pub working_directory: PathBuf,
    pub model: Option<String>,
    pub subagent: SubagentKind,
    /// 1-based iteration number.
    pub iteration: u32,
    /// Stamped on progress events as their session id.
    pub correlation_id: String,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressSink>,
}

impl std::fmt::Debug for BackendRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRequest")
            .field("subagent", &self.subagent)
            .field("iteration", &self.iteration)
            .field("correlation_id", &self.correlation_id)
            .field("working_directory", &self.working_directory)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Common contract for subagent transports.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Assign settings. Performs no I/O.
    fn configure(&mut self, config: BackendConfig);

    /// Acquire required resources; fails when they are missing.
    async fn initialize(&self) -> Result<(), SubagentError>;

    /// Run one call. Failures the subagent itself reports come back as a
    /// `Failed` result; transport problems come back as errors.
    async fn execute(&self, request: &BackendRequest) -> Result<BackendResult, SubagentError>;

    /// Never fails; `false` when the backend cannot serve calls right now.
    async fn is_available(&self) -> bool;

    /// Emitter that stamps this backend's events. Events raised on the
    /// backend's behalf go through it too, so one instance has one sequence.
    fn emitter(&self) -> &ProgressEmitter;

    /// Observe every progress event this backend emits.
    fn on_progress(&self, callback: Box<dyn Fn(&ProgressEvent) + Send + Sync>) -> Subscription {
        self.emitter().subscribe(callback)
    }

    /// Release resources. Safe to call more than once.
    async fn cleanup(&self);
}

/// Stamps parsed events with backend identity and a per-instance sequence.
#[derive(Debug)]
pub struct ProgressEmitter {
    kind: BackendKind,
    sequence: AtomicU64,
    observers: Observers<ProgressEvent>,
}

impl ProgressEmitter {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            sequence: AtomicU64::new(0),
            observers: Observers::new(),
        }
    }

    pub fn subscribe(&self, callback: Box<dyn Fn(&ProgressEvent) + Send + Sync>) -> Subscription {
        self.observers.subscribe(move |event| {
            callback(event);
            Ok(())
        })
    }

    /// Stamp `parsed`, deliver it to the request sink and to subscribers.
    pub fn emit(&self, request: &BackendRequest, parsed: ParsedEvent) -> ProgressEvent {
        let count = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = ProgressEvent {
            session_id: request.correlation_id.clone(),
            timestamp: Utc::now(),
            backend: self.kind,
            count,
            event_type: parsed.event_type,
            content: parsed.content,
            metadata: parsed.metadata,
        };
        if let Some(sink) = &request.progress {
            sink(&event);
        }
        self.observers.emit(&event);
        event
    }
}

/// Build and configure the backend for `kind`.
pub fn create_backend(kind: BackendKind, config: BackendConfig) -> Box<dyn Backend> {
    let mut backend: Box<dyn Backend> = match kind {
        BackendKind::Shell => Box::new(shell::ShellBackend::new()),
        BackendKind::Protocol => Box::new(protocol::ProtocolBackend::stdio()),
    };
    backend.configure(config);
    backend
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::Value;

    use super::*;
    use crate::core::types::ProgressEventType;

    fn request(sink: Option<ProgressSink>) -> BackendRequest {
        BackendRequest {
            instruction: "x".to_string(),
            working_directory: PathBuf::from("/tmp"),
            model: None,
            subagent: SubagentKind::Claude,
            iteration: 1,
            correlation_id: "corr-1".to_string(),
            timeout: Duration::from_secs(1),
            cancel: CancellationToken::new(),
            progress: sink,
        }
    }

    fn parsed(content: &str) -> ParsedEvent {
        ParsedEvent {
            event_type: ProgressEventType::Thinking,
            content: content.to_string(),
            metadata: Value::Null,
        }
    }

    #[test]
    fn sequence_is_strictly_increasing_per_instance() {
        let emitter = ProgressEmitter::new(BackendKind::Shell);
        let other = ProgressEmitter::new(BackendKind::Shell);
        let req = request(None);
        let first = emitter.emit(&req, parsed("a"));
        let second = emitter.emit(&req, parsed("b"));
        assert_eq!((first.count, second.count), (1, 2));
        assert_eq!(other.emit(&req, parsed("c")).count, 1);
        assert_eq!(second.session_id, "corr-1");
    }

    #[test]
    fn events_reach_sink_and_subscribers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: ProgressSink = Arc::new(move |e: &ProgressEvent| {
            sink_seen.lock().unwrap().push(format!("sink:{}", e.content));
        });
        let emitter = ProgressEmitter::new(BackendKind::Protocol);
        let sub_seen = seen.clone();
        let sub = emitter.subscribe(Box::new(move |e: &ProgressEvent| {
            sub_seen.lock().unwrap().push(format!("sub:{}", e.content));
        }));
        emitter.emit(&request(Some(sink)), parsed("hi"));
        sub.unsubscribe();
        emitter.emit(&request(None), parsed("bye"));
        assert_eq!(*seen.lock().unwrap(), vec!["sink:hi", "sub:hi"]);
    }
}
