//! Running statistics and throughput math.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::ErrorKind;
use crate::core::types::ExecutionStatistics;

impl ExecutionStatistics {
    /// Fold one finished iteration into the aggregates.
    ///
    /// The average uses an incremental mean so no per-iteration history is needed.
    pub fn record_iteration(&mut self, duration_ms: u64, success: bool) {
        self.total_iterations += 1;
        if success {
            self.successful_iterations += 1;
        } else {
            self.failed_iterations += 1;
        }
        let n = f64::from(self.total_iterations);
        self.average_iteration_ms += (duration_ms as f64 - self.average_iteration_ms) / n;
    }

    pub fn record_error(&mut self, kind: ErrorKind) {
        *self.errors_by_kind.entry(kind.as_str().to_string()).or_insert(0) += 1;
    }

    pub fn record_rate_limit(&mut self, wait: Duration) {
        self.rate_limit_encounters += 1;
        self.rate_limit_wait_ms += wait.as_millis() as u64;
    }
}

/// Live engine-wide resource and throughput view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub memory_bytes: u64,
    pub iterations_per_minute: f64,
    pub events_per_second: f64,
    pub active_executions: usize,
    pub total_iterations: u64,
    pub total_events: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Rates over `elapsed`; zero elapsed yields zero rates.
pub fn throughput(iterations: u64, events: u64, elapsed: Duration) -> (f64, f64) {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        return (0.0, 0.0);
    }
    (iterations as f64 * 60.0 / secs, events as f64 / secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_mean_matches_arithmetic_mean() {
        let mut stats = ExecutionStatistics::default();
        for (ms, ok) in [(100, true), (200, false), (600, true)] {
            stats.record_iteration(ms, ok);
        }
        assert_eq!(stats.total_iterations, 3);
        assert_eq!(stats.successful_iterations, 2);
        assert_eq!(stats.failed_iterations, 1);
        assert!((stats.average_iteration_ms - 300.0).abs() < 1e-9);
    }

    #[test]
    fn errors_tallied_by_kind() {
        let mut stats = ExecutionStatistics::default();
        stats.record_error(ErrorKind::Connection);
        stats.record_error(ErrorKind::Connection);
        stats.record_error(ErrorKind::Timeout);
        assert_eq!(stats.errors_by_kind.get("connection"), Some(&2));
        assert_eq!(stats.errors_by_kind.get("timeout"), Some(&1));
    }

    #[test]
    fn rate_limit_wait_accumulates() {
        let mut stats = ExecutionStatistics::default();
        stats.record_rate_limit(Duration::from_millis(250));
        stats.record_rate_limit(Duration::from_millis(750));
        assert_eq!(stats.rate_limit_encounters, 2);
        assert_eq!(stats.rate_limit_wait_ms, 1000);
    }

    #[test]
    fn throughput_handles_zero_elapsed() {
        assert_eq!(throughput(5, 5, Duration::ZERO), (0.0, 0.0));
        let (ipm, eps) = throughput(2, 30, Duration::from_secs(60));
        assert!((ipm - 2.0).abs() < 1e-9);
        assert!((eps - 0.5).abs() < 1e-9);
    }
}
