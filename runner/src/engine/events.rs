//! Lifecycle events the engine publishes to observers.

use serde::Serialize;

use crate::core::error::{ErrorKind, SubagentError};
use crate::core::types::{ExecutionResult, IterationResult, MaxIterations, ProgressEvent, SubagentKind};

/// What the engine did after an iteration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Continue,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    ExecutionStarted {
        request_id: String,
        subagent: SubagentKind,
        max_iterations: MaxIterations,
    },
    IterationStarted {
        request_id: String,
        iteration: u32,
        /// 0 for the first attempt, then one per retry.
        attempt: u32,
    },
    IterationCompleted {
        request_id: String,
        result: IterationResult,
    },
    Error {
        request_id: String,
        iteration: u32,
        error: SubagentError,
    },
    RateLimitStarted {
        request_id: String,
        iteration: u32,
        wait_ms: u64,
    },
    RateLimitEnded {
        request_id: String,
        iteration: u32,
    },
    Recovery {
        request_id: String,
        iteration: u32,
        kind: ErrorKind,
        action: RecoveryAction,
        delay_ms: u64,
    },
    Progress(ProgressEvent),
    ExecutionCompleted {
        result: Box<ExecutionResult>,
    },
}

impl EngineEvent {
    /// Request the event belongs to; progress events carry a correlation id instead.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            EngineEvent::ExecutionStarted { request_id, .. }
            | EngineEvent::IterationStarted { request_id, .. }
            | EngineEvent::IterationCompleted { request_id, .. }
            | EngineEvent::Error { request_id, .. }
            | EngineEvent::RateLimitStarted { request_id, .. }
            | EngineEvent::RateLimitEnded { request_id, .. }
            | EngineEvent::Recovery { request_id, .. } => Some(request_id),
            EngineEvent::ExecutionCompleted { result } => Some(&result.request_id),
            EngineEvent::Progress(_) => None,
        }
    }
}
