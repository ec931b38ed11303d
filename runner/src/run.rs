//! Tracked runs: an engine execution recorded into the session store.

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::core::types::{ExecutionRequest, ExecutionResult};
use crate::engine::ExecutionEngine;
use crate::engine::events::{EngineEvent, RecoveryAction};
use crate::io::session_store::{
    HistoryEntry, HistoryKind, NewSession, Session, SessionResult, SessionStatus, SessionStore,
};

/// Characters of the last iteration's content kept as the session summary.
const SUMMARY_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct TrackedOutcome {
    pub session: Session,
    pub result: ExecutionResult,
}

/// Create a session, run `request` under it, and record the outcome.
///
/// Iteration, error, and recovery events are appended to the session history
/// while the execution runs. Validation failures still complete the session
/// (as failed) before the error is returned.
#[instrument(skip_all, fields(request_id = %request.request_id))]
pub async fn run_tracked(
    engine: &ExecutionEngine,
    store: &SessionStore,
    mut request: ExecutionRequest,
    session: NewSession,
    cancel: Option<CancellationToken>,
) -> Result<TrackedOutcome> {
    let created = store.create_session(session).context("create session")?;
    let session_id = created.info.id.clone();
    request.session_id = Some(session_id.clone());
    info!(session_id = %session_id, "tracking execution");

    let (tx, rx) = mpsc::unbounded_channel();
    let request_id = request.request_id.clone();
    let subscription = engine.on_event(move |event| {
        if event.request_id() == Some(request_id.as_str()) {
            tx.send(event.clone())
                .map_err(|_| anyhow!("session recorder stopped"))?;
        }
        Ok(())
    });

    let run = async {
        let outcome = engine.execute(request, cancel).await;
        subscription.unsubscribe();
        outcome
    };
    let (outcome, ()) = tokio::join!(run, record_history(store, &session_id, rx));

    let result = match outcome {
        Ok(result) => result,
        Err(err) => {
            store
                .add_history_entry(&session_id, HistoryEntry::new(HistoryKind::Error, err.to_string()))
                .context("record validation failure")?;
            store
                .complete_session(
                    &session_id,
                    SessionStatus::Failed,
                    SessionResult {
                        status: crate::core::types::ExecutionStatus::Failed,
                        iterations: 0,
                        duration_ms: 0,
                        summary: None,
                        error: Some(err.clone()),
                    },
                )
                .context("complete session")?;
            return Err(anyhow::Error::new(err).context("execution rejected"));
        }
    };

    store
        .update_statistics(&session_id, &result.statistics)
        .context("record statistics")?;
    store
        .add_history_entry(
            &session_id,
            HistoryEntry::new(HistoryKind::System, format!("execution finished: {}", result.status))
                .with_duration(result.duration_ms),
        )
        .context("record completion")?;
    let summary = result
        .last_content()
        .map(|content| content.chars().take(SUMMARY_CHARS).collect::<String>())
        .filter(|s| !s.is_empty());
    let session = store
        .complete_session(
            &session_id,
            SessionStatus::from(result.status),
            SessionResult {
                status: result.status,
                iterations: result.iterations.len() as u32,
                duration_ms: result.duration_ms,
                summary,
                error: result.error.clone(),
            },
        )
        .context("complete session")?;
    Ok(TrackedOutcome { session, result })
}

/// Append history entries until the sender side is dropped.
async fn record_history(store: &SessionStore, session_id: &str, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(entry) = history_entry(&event) else {
            continue;
        };
        if let Err(err) = store.add_history_entry(session_id, entry) {
            warn!(session_id, err = %err, "failed to record history entry");
        }
    }
}

fn history_entry(event: &EngineEvent) -> Option<HistoryEntry> {
    let entry = match event {
        EngineEvent::IterationCompleted { result, .. } => {
            let content = match (&result.result, &result.error) {
                (_, Some(err)) => err.to_string(),
                (Some(payload), None) => payload.content.clone(),
                (None, None) => String::new(),
            };
            HistoryEntry::new(HistoryKind::Iteration, content)
                .with_iteration(result.iteration)
                .with_duration(result.duration_ms)
                .with_metadata(json!({"success": result.success, "retries": result.retries}))
        }
        EngineEvent::Error { iteration, error, .. } => HistoryEntry::new(HistoryKind::Error, error.to_string())
            .with_iteration(*iteration)
            .with_metadata(json!({"kind": error.kind()})),
        EngineEvent::RateLimitStarted { iteration, wait_ms, .. } => {
            HistoryEntry::new(HistoryKind::System, format!("rate limited; waiting {wait_ms}ms"))
                .with_iteration(*iteration)
        }
        EngineEvent::Recovery {
            iteration,
            kind,
            action,
            delay_ms,
            ..
        } => {
            let verb = match action {
                RecoveryAction::Retry => "retrying",
                RecoveryAction::Continue => "continuing after",
                RecoveryAction::Abort => "aborting on",
            };
            HistoryEntry::new(HistoryKind::System, format!("{verb} {kind} error"))
                .with_iteration(*iteration)
                .with_metadata(json!({"delay_ms": delay_ms}))
        }
        _ => return None,
    };
    Some(entry)
}
