//! Mutable state owned by one `execute()` call.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::core::error::SubagentError;
use crate::core::types::{
    ExecutionRequest, ExecutionResult, ExecutionStatistics, ExecutionStatus, IterationResult, ProgressEvent,
};

/// Progress events recorded during one execution.
///
/// Shared with the per-call progress sink, which runs on the backend's task.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl EventLog {
    fn lock(&self) -> MutexGuard<'_, Vec<ProgressEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, event: ProgressEvent) {
        self.lock().push(event);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ProgressEvent> {
        self.lock().clone()
    }
}

#[derive(Debug)]
pub struct ExecutionContext {
    pub request: ExecutionRequest,
    pub status: ExecutionStatus,
    pub iterations: Vec<IterationResult>,
    pub statistics: ExecutionStatistics,
    pub events: EventLog,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
    started: Instant,
    /// Set while waiting out a rate limit.
    pub rate_limited_until: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    pub fn new(request: ExecutionRequest, cancel: CancellationToken) -> Self {
        Self {
            request,
            status: ExecutionStatus::Pending,
            iterations: Vec::new(),
            statistics: ExecutionStatistics::default(),
            events: EventLog::default(),
            cancel,
            started_at: Utc::now(),
            started: Instant::now(),
            rate_limited_until: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Append a settled iteration and fold it into the statistics.
    pub fn record_iteration(&mut self, result: IterationResult) {
        self.statistics.record_iteration(result.duration_ms, result.success);
        self.iterations.push(result);
    }

    /// Freeze the context into the terminal snapshot.
    pub fn finish(mut self, status: ExecutionStatus, error: Option<SubagentError>) -> ExecutionResult {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        self.statistics.total_duration_ms = duration_ms;
        let progress_events = self.events.snapshot();
        self.statistics.progress_events = progress_events.len() as u64;
        ExecutionResult {
            request_id: self.request.request_id,
            status,
            started_at: self.started_at,
            ended_at: Utc::now(),
            duration_ms,
            iterations: self.iterations,
            statistics: self.statistics,
            progress_events,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MaxIterations, SubagentKind};

    fn iteration(n: u32, success: bool, duration_ms: u64) -> IterationResult {
        let now = Utc::now();
        IterationResult {
            iteration: n,
            success,
            started_at: now,
            ended_at: now,
            duration_ms,
            result: None,
            error: None,
            retries: 0,
        }
    }

    #[test]
    fn finish_carries_iterations_and_statistics() {
        let request = ExecutionRequest::new("x", SubagentKind::Claude, "/tmp", MaxIterations::Limited(2));
        let id = request.request_id.clone();
        let mut ctx = ExecutionContext::new(request, CancellationToken::new());
        ctx.record_iteration(iteration(1, true, 100));
        ctx.record_iteration(iteration(2, false, 300));

        let result = ctx.finish(ExecutionStatus::Failed, None);
        assert_eq!(result.request_id, id);
        assert_eq!(result.iterations.len(), 2);
        assert_eq!(result.statistics.total_iterations, 2);
        assert_eq!(result.statistics.successful_iterations, 1);
        assert_eq!(result.statistics.failed_iterations, 1);
        assert!((result.statistics.average_iteration_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(result.statistics.progress_events, 0);
    }
}
