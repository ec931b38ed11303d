//! Shared data types for requests, iteration results, and progress events.
//!
//! These types define stable contracts between the engine, the backends, and the
//! session store. They carry no I/O and serialize deterministically.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::core::error::SubagentError;

/// External coding assistant invoked once per iteration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubagentKind {
    Claude,
    Codex,
    Gemini,
    Cursor,
    Other(String),
}

impl SubagentKind {
    pub fn as_str(&self) -> &str {
        match self {
            SubagentKind::Claude => "claude",
            SubagentKind::Codex => "codex",
            SubagentKind::Gemini => "gemini",
            SubagentKind::Cursor => "cursor",
            SubagentKind::Other(name) => name.as_str(),
        }
    }
}

impl fmt::Display for SubagentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for SubagentKind {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "claude" => SubagentKind::Claude,
            "codex" => SubagentKind::Codex,
            "gemini" => SubagentKind::Gemini,
            "cursor" => SubagentKind::Cursor,
            _ => SubagentKind::Other(value.trim().to_string()),
        }
    }
}

impl Serialize for SubagentKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SubagentKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(SubagentKind::from(raw.as_str()))
    }
}

/// Iteration bound for one execution.
///
/// Serialized as a positive integer, or `-1` / `"unlimited"` for no bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxIterations {
    Limited(u32),
    Unlimited,
}

impl MaxIterations {
    /// Whether `iteration` (1-based) is still inside the bound.
    pub fn allows(&self, iteration: u32) -> bool {
        match self {
            MaxIterations::Limited(max) => iteration <= *max,
            MaxIterations::Unlimited => true,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, MaxIterations::Limited(0))
    }
}

impl Default for MaxIterations {
    fn default() -> Self {
        MaxIterations::Limited(1)
    }
}

impl fmt::Display for MaxIterations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxIterations::Limited(max) => write!(f, "{max}"),
            MaxIterations::Unlimited => f.write_str("unlimited"),
        }
    }
}

impl FromStr for MaxIterations {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("unlimited") || trimmed == "-1" {
            return Ok(MaxIterations::Unlimited);
        }
        let value: u32 = trimmed
            .parse()
            .map_err(|_| anyhow!("invalid max iterations '{trimmed}' (expected N or 'unlimited')"))?;
        Ok(MaxIterations::Limited(value))
    }
}

impl Serialize for MaxIterations {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            MaxIterations::Limited(max) => serializer.serialize_i64(i64::from(*max)),
            MaxIterations::Unlimited => serializer.serialize_i64(-1),
        }
    }
}

impl<'de> Deserialize<'de> for MaxIterations {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(-1) => Ok(MaxIterations::Unlimited),
            Raw::Number(n) => u32::try_from(n)
                .map(MaxIterations::Limited)
                .map_err(|_| serde::de::Error::custom(format!("invalid max iterations {n}"))),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Scheduling hint carried through to backends and hooks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Caller-built description of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub request_id: String,
    pub instruction: String,
    pub subagent: SubagentKind,
    pub working_directory: PathBuf,
    pub max_iterations: MaxIterations,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Per-call backend timeout. Falls back to the engine default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_ms_opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub priority: Priority,
    /// Session the execution is recorded under, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ExecutionRequest {
    pub fn new(
        instruction: impl Into<String>,
        subagent: SubagentKind,
        working_directory: impl Into<PathBuf>,
        max_iterations: MaxIterations,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            instruction: instruction.into(),
            subagent,
            working_directory: working_directory.into(),
            max_iterations,
            model: None,
            timeout: None,
            priority: Priority::default(),
            session_id: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Identifier used to correlate progress events and hooks.
    pub fn correlation_id(&self) -> &str {
        self.session_id.as_deref().unwrap_or(&self.request_id)
    }
}

/// Engine state machine for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    RateLimited,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::RateLimited => "rate_limited",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Timeout => "timeout",
        };
        f.write_str(label)
    }
}

/// Transport used to reach the subagent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Protocol,
    Shell,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Protocol => f.write_str("protocol"),
            BackendKind::Shell => f.write_str("shell"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "protocol" | "mcp" => Ok(BackendKind::Protocol),
            "shell" => Ok(BackendKind::Shell),
            other => Err(anyhow!("unknown backend '{other}' (expected protocol or shell)")),
        }
    }
}

/// Outcome reported by a backend for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Completed,
    Failed,
}

/// Uniform result shape returned by every backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResult {
    pub status: BackendStatus,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl BackendResult {
    pub fn completed(content: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: BackendStatus::Completed,
            content: content.into(),
            error: None,
            duration_ms: duration.as_millis() as u64,
            metadata: Value::Null,
        }
    }

    pub fn failed(content: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: BackendStatus::Failed,
            content: content.into(),
            error: Some(error.into()),
            duration_ms: duration.as_millis() as u64,
            metadata: Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == BackendStatus::Completed
    }
}

/// Vocabulary of normalized progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    Start,
    Result,
    Thinking,
    Error,
}

impl ProgressEventType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "start" | "tool_start" => Some(ProgressEventType::Start),
            "result" | "tool_result" => Some(ProgressEventType::Result),
            "thinking" | "info" | "progress" => Some(ProgressEventType::Thinking),
            "error" => Some(ProgressEventType::Error),
            _ => None,
        }
    }
}

/// A normalized unit of streamed output from a backend during one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub backend: BackendKind,
    /// Strictly increasing per backend instance.
    pub count: u64,
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Outcome of one iteration (successful or failed after recovery decisions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration: u32,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<BackendResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SubagentError>,
    /// Retries spent on this iteration number before it settled.
    #[serde(default)]
    pub retries: u32,
}

/// Aggregate statistics for one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatistics {
    pub total_iterations: u32,
    pub successful_iterations: u32,
    pub failed_iterations: u32,
    pub average_iteration_ms: f64,
    pub total_duration_ms: u64,
    pub rate_limit_encounters: u32,
    pub rate_limit_wait_ms: u64,
    pub retries: u32,
    pub progress_events: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors_by_kind: BTreeMap<String, u32>,
}

/// Immutable terminal snapshot of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub iterations: Vec<IterationResult>,
    pub statistics: ExecutionStatistics,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub progress_events: Vec<ProgressEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SubagentError>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    /// Content of the last successful iteration, if any.
    pub fn last_content(&self) -> Option<&str> {
        self.iterations
            .iter()
            .rev()
            .filter(|iteration| iteration.success)
            .find_map(|iteration| iteration.result.as_ref().map(|r| r.content.as_str()))
    }
}

mod duration_ms_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_u64(duration.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
