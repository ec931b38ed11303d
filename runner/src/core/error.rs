//! Classified subagent errors.
//!
//! Every failure the engine reacts to carries one [`ErrorKind`]. Errors that
//! arrive untyped (plain text from a process or a transport) are classified by
//! [`SubagentError::classify`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::rate_limit::parse_reset_time;

/// Fixed set of error kinds recovery policy is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Timeout,
    RateLimit,
    ToolExecution,
    Validation,
    ServerNotFound,
    Protocol,
    Authentication,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::Connection,
        ErrorKind::Timeout,
        ErrorKind::RateLimit,
        ErrorKind::ToolExecution,
        ErrorKind::Validation,
        ErrorKind::ServerNotFound,
        ErrorKind::Protocol,
        ErrorKind::Authentication,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ToolExecution => "tool_execution",
            ErrorKind::Validation => "validation",
            ErrorKind::ServerNotFound => "server_not_found",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Authentication => "authentication",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure raised by a backend, the engine, or request validation.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubagentError {
    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("timeout: {message}")]
    Timeout {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reset_time: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remaining: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tier: Option<String>,
    },

    #[error("tool execution failed: {message}")]
    ToolExecution {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },

    #[error("invalid request: {message}")]
    Validation {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },

    #[error("server not found: {message}")]
    ServerNotFound { message: String },

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("authentication failed: {message}")]
    Authentication { message: String },
}

const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "too many requests", "429", "usage limit"];

const CONNECTION_MARKERS: &[&str] = &[
    "connection reset",
    "econnreset",
    "broken pipe",
    "epipe",
    "socket hang up",
    "econnrefused",
    "connection refused",
    "connection closed",
    "network error",
    "etimedout",
];

const AUTH_MARKERS: &[&str] = &["unauthorized", "401", "invalid api key", "authentication"];

impl SubagentError {
    pub fn connection(message: impl Into<String>) -> Self {
        SubagentError::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>, timeout: Option<Duration>) -> Self {
        SubagentError::Timeout {
            message: message.into(),
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        }
    }

    pub fn rate_limit(message: impl Into<String>, reset_time: Option<DateTime<Utc>>) -> Self {
        SubagentError::RateLimit {
            message: message.into(),
            reset_time,
            remaining: None,
            tier: None,
        }
    }

    pub fn tool_execution(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        SubagentError::ToolExecution {
            message: message.into(),
            exit_code,
        }
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        SubagentError::Validation {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    pub fn server_not_found(message: impl Into<String>) -> Self {
        SubagentError::ServerNotFound {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        SubagentError::Protocol {
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        SubagentError::Authentication {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SubagentError::Connection { .. } => ErrorKind::Connection,
            SubagentError::Timeout { .. } => ErrorKind::Timeout,
            SubagentError::RateLimit { .. } => ErrorKind::RateLimit,
            SubagentError::ToolExecution { .. } => ErrorKind::ToolExecution,
            SubagentError::Validation { .. } => ErrorKind::Validation,
            SubagentError::ServerNotFound { .. } => ErrorKind::ServerNotFound,
            SubagentError::Protocol { .. } => ErrorKind::Protocol,
            SubagentError::Authentication { .. } => ErrorKind::Authentication,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            SubagentError::Connection { message }
            | SubagentError::Timeout { message, .. }
            | SubagentError::RateLimit { message, .. }
            | SubagentError::ToolExecution { message, .. }
            | SubagentError::Validation { message, .. }
            | SubagentError::ServerNotFound { message }
            | SubagentError::Protocol { message }
            | SubagentError::Authentication { message } => message,
        }
    }

    /// Server-provided reset time for rate-limit errors.
    pub fn reset_time(&self) -> Option<DateTime<Utc>> {
        match self {
            SubagentError::RateLimit { reset_time, .. } => *reset_time,
            _ => None,
        }
    }

    /// Append context to the message while keeping kind and fields.
    pub fn annotate(mut self, note: &str) -> Self {
        match &mut self {
            SubagentError::Connection { message }
            | SubagentError::Timeout { message, .. }
            | SubagentError::RateLimit { message, .. }
            | SubagentError::ToolExecution { message, .. }
            | SubagentError::Validation { message, .. }
            | SubagentError::ServerNotFound { message }
            | SubagentError::Protocol { message }
            | SubagentError::Authentication { message } => {
                message.push_str(" (");
                message.push_str(note);
                message.push(')');
            }
        }
        self
    }

    /// Classify free-form error text.
    ///
    /// Rate-limit phrases win over connection markers; anything unrecognized is
    /// a tool execution failure.
    pub fn classify(text: &str) -> Self {
        let lower = text.to_ascii_lowercase();
        if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
            return SubagentError::rate_limit(text, parse_reset_time(text, Utc::now()));
        }
        if CONNECTION_MARKERS.iter().any(|m| lower.contains(m)) {
            return SubagentError::connection(text);
        }
        SubagentError::tool_execution(text, None)
    }

    /// Like [`SubagentError::classify`], but also recognizes authentication failures.
    /// Used for transport-level replies where a 401 is unambiguous.
    pub fn classify_transport(text: &str) -> Self {
        let lower = text.to_ascii_lowercase();
        if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
            return SubagentError::authentication(text);
        }
        SubagentError::classify(text)
    }
}

impl From<anyhow::Error> for SubagentError {
    fn from(err: anyhow::Error) -> Self {
        SubagentError::classify(&format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_detects_rate_limits() {
        for text in [
            "Rate limit exceeded",
            "HTTP 429 from upstream",
            "Too Many Requests",
            "Claude usage limit reached",
        ] {
            assert_eq!(SubagentError::classify(text).kind(), ErrorKind::RateLimit, "{text}");
        }
    }

    #[test]
    fn classify_detects_transport_failures() {
        for text in [
            "read ECONNRESET",
            "write EPIPE",
            "socket hang up",
            "connect ECONNREFUSED 127.0.0.1:80",
            "Connection closed by peer",
        ] {
            assert_eq!(SubagentError::classify(text).kind(), ErrorKind::Connection, "{text}");
        }
    }

    #[test]
    fn classify_defaults_to_tool_execution() {
        let err = SubagentError::classify("something odd happened");
        assert_eq!(err.kind(), ErrorKind::ToolExecution);
        assert_eq!(err.message(), "something odd happened");
    }

    #[test]
    fn classify_extracts_epoch_reset_time() {
        let err = SubagentError::classify("Claude AI usage limit reached|1700000000");
        let reset = err.reset_time().expect("reset time");
        assert_eq!(reset.timestamp(), 1_700_000_000);
    }

    #[test]
    fn transport_classification_recognizes_auth() {
        let err = SubagentError::classify_transport("HTTP 401 Unauthorized");
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn serializes_with_kind_tag() {
        let err = SubagentError::timeout("too slow", Some(Duration::from_secs(2)));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["timeout_ms"], 2000);
        let back: SubagentError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn annotate_keeps_kind() {
        let err = SubagentError::rate_limit("slow down", None).annotate("wait 7200s exceeds ceiling");
        assert_eq!(err.kind(), ErrorKind::RateLimit);
        assert_eq!(err.message(), "slow down (wait 7200s exceeds ceiling)");
    }
}
