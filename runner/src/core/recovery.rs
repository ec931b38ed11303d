//! Per-kind recovery policy for non-rate-limit errors.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{ErrorKind, SubagentError};

/// Caller-supplied override consulted once per failed iteration.
///
/// Receives the error and the iteration number; `true` continues the run.
pub type RecoveryPredicate = Arc<dyn Fn(&SubagentError, u32) -> bool + Send + Sync>;

/// Recovery settings for one error kind (TOML shape).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub continue_on_error: bool,
}

impl RecoverySettings {
    pub fn default_for(kind: ErrorKind) -> Self {
        let (max_retries, retry_delay_ms, continue_on_error) = match kind {
            ErrorKind::Connection => (3, 2_000, true),
            ErrorKind::Timeout => (2, 5_000, true),
            ErrorKind::Protocol => (2, 1_000, false),
            ErrorKind::RateLimit
            | ErrorKind::ToolExecution
            | ErrorKind::Validation
            | ErrorKind::ServerNotFound
            | ErrorKind::Authentication => (0, 0, false),
        };
        Self {
            max_retries,
            retry_delay_ms,
            continue_on_error,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Settings plus an optional predicate for one error kind.
#[derive(Clone, Default)]
pub struct RecoveryPolicy {
    pub settings: RecoverySettings,
    pub predicate: Option<RecoveryPredicate>,
}

impl fmt::Debug for RecoveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryPolicy")
            .field("settings", &self.settings)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Decision after the retries for one iteration are spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Retry the same iteration after the delay.
    Retry(Duration),
    /// Record the failure and advance after the delay.
    Continue(Duration),
    /// Stop the run with this error.
    Abort,
}

/// Policy table keyed by error kind.
#[derive(Debug, Clone)]
pub struct RecoveryTable {
    policies: BTreeMap<ErrorKind, RecoveryPolicy>,
}

impl Default for RecoveryTable {
    fn default() -> Self {
        let policies = ErrorKind::ALL
            .iter()
            .map(|kind| {
                (
                    *kind,
                    RecoveryPolicy {
                        settings: RecoverySettings::default_for(*kind),
                        predicate: None,
                    },
                )
            })
            .collect();
        Self { policies }
    }
}

impl RecoveryTable {
    /// Defaults overlaid with configured settings.
    pub fn from_settings(overrides: &BTreeMap<ErrorKind, RecoverySettings>) -> Self {
        let mut table = Self::default();
        for (kind, settings) in overrides {
            table.set_settings(*kind, *settings);
        }
        table
    }

    pub fn set_settings(&mut self, kind: ErrorKind, settings: RecoverySettings) {
        self.policies.entry(kind).or_default().settings = settings;
    }

    pub fn set_predicate(&mut self, kind: ErrorKind, predicate: RecoveryPredicate) {
        self.policies.entry(kind).or_default().predicate = Some(predicate);
    }

    pub fn policy(&self, kind: ErrorKind) -> RecoveryPolicy {
        self.policies.get(&kind).cloned().unwrap_or_else(|| RecoveryPolicy {
            settings: RecoverySettings::default_for(kind),
            predicate: None,
        })
    }

    /// Decide how to handle `error` on `iteration` after `retries_spent` retries.
    ///
    /// The predicate runs only once retries are exhausted, so it is evaluated at
    /// most once per failed iteration. Its answer replaces `continue_on_error`.
    pub fn decide(&self, error: &SubagentError, iteration: u32, retries_spent: u32) -> RecoveryDecision {
        let policy = self.policy(error.kind());
        let delay = policy.settings.retry_delay();
        if retries_spent < policy.settings.max_retries {
            return RecoveryDecision::Retry(delay);
        }
        let proceed = match &policy.predicate {
            Some(predicate) => predicate(error, iteration),
            None => policy.settings.continue_on_error,
        };
        if proceed {
            RecoveryDecision::Continue(delay)
        } else {
            RecoveryDecision::Abort
        }
    }
}
