//! MCP client for a tool server on stdio, built on `rmcp`.
//!
//! The server is spawned lazily on first use and kept alive across calls.
//! Calls share one peer handle, so a liveness check never waits behind a
//! running tool call. Progress and log notifications are fanned out to the
//! calls in flight.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{LoggingMessageNotificationParam, ProgressNotificationParam};
use rmcp::service::{NotificationContext, Peer, RunningService, ServiceError};
use rmcp::transport::TokioChildProcess;
use rmcp::{ClientHandler, RoleClient, ServiceExt};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::core::error::{ErrorKind, SubagentError};
use crate::core::rate_limit::parse_reset_time;
use crate::io::backend::protocol::{NotifyFn, ToolCall, ToolCallResult, ToolClient};
use crate::io::config::ProtocolSettings;

/// Server-defined JSON-RPC code used for rate limiting.
const RATE_LIMIT_CODE: i64 = -32001;

type Listeners = Arc<StdMutex<Vec<mpsc::UnboundedSender<Value>>>>;

/// Forwards server notifications, as JSON-RPC frames, to every listening call.
struct NotificationRouter {
    listeners: Listeners,
}

impl NotificationRouter {
    fn forward(&self, method: &str, params: &impl Serialize) {
        let frame = json!({
            "method": method,
            "params": serde_json::to_value(params).unwrap_or(Value::Null),
        });
        let mut listeners = self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners.retain(|tx| tx.send(frame.clone()).is_ok());
    }
}

impl ClientHandler for NotificationRouter {
    fn on_progress(
        &self,
        params: ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        self.forward("notifications/progress", &params);
        std::future::ready(())
    }

    fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        self.forward("notifications/message", &params);
        std::future::ready(())
    }
}

struct Session {
    service: RunningService<RoleClient, NotificationRouter>,
    peer: Peer<RoleClient>,
}

impl Session {
    async fn shutdown(self) {
        if let Err(err) = self.service.cancel().await {
            debug!(err = %err, "server task already gone");
        }
    }
}

/// Classify a JSON-RPC error object from the server.
fn server_error(error: &Value) -> SubagentError {
    let code = error.get("code").and_then(Value::as_i64);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown server error")
        .to_string();
    match code {
        Some(RATE_LIMIT_CODE) => {
            let reset = error
                .get("data")
                .and_then(|d| d.get("reset_time"))
                .and_then(Value::as_str)
                .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
                .map(|t| t.with_timezone(&chrono::Utc))
                .or_else(|| parse_reset_time(&message, chrono::Utc::now()));
            SubagentError::rate_limit(message, reset)
        }
        Some(-32700 | -32600 | -32601 | -32602) => SubagentError::protocol(message),
        _ => SubagentError::classify_transport(&message),
    }
}

impl From<ServiceError> for SubagentError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::McpError(data) => match serde_json::to_value(&data) {
                Ok(error) => server_error(&error),
                Err(encode) => SubagentError::protocol(format!("unreadable server error: {encode}")),
            },
            ServiceError::Timeout { timeout } => {
                SubagentError::timeout(format!("server request timed out after {}s", timeout.as_secs()), Some(timeout))
            }
            ServiceError::TransportClosed => SubagentError::connection("server closed the connection"),
            other => {
                let classified = SubagentError::classify_transport(&other.to_string());
                if classified.kind() == ErrorKind::ToolExecution {
                    SubagentError::protocol(other.to_string())
                } else {
                    classified
                }
            }
        }
    }
}

/// MCP client that owns the server process.
pub struct McpToolClient {
    command: Vec<String>,
    env: BTreeMap<String, String>,
    connect_timeout: Duration,
    listeners: Listeners,
    session: Mutex<Option<Session>>,
}

impl std::fmt::Debug for McpToolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpToolClient")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

enum CallEnd {
    Done(Result<Value, SubagentError>),
    TimedOut,
    Cancelled,
}

impl McpToolClient {
    pub fn new(settings: &ProtocolSettings) -> Self {
        Self {
            command: settings.command.clone(),
            env: settings.env.clone(),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            listeners: Arc::default(),
            session: Mutex::new(None),
        }
    }

    #[instrument(skip_all, fields(program = self.command.first().map(String::as_str).unwrap_or("")))]
    async fn spawn(&self) -> Result<Session, SubagentError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(SubagentError::server_not_found(
                "protocol.command is not configured",
            ));
        };
        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&self.env)
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let transport = TokioChildProcess::new(command).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SubagentError::server_not_found(format!("start server {program}: {e}"))
            } else {
                SubagentError::connection(format!("start server {program}: {e}"))
            }
        })?;

        let router = NotificationRouter {
            listeners: Arc::clone(&self.listeners),
        };
        let service = match tokio::time::timeout(self.connect_timeout, router.serve(transport)).await {
            Ok(Ok(service)) => service,
            Ok(Err(err)) => {
                return Err(SubagentError::connection(format!("initialize {program}: {err}")));
            }
            Err(_) => {
                return Err(SubagentError::timeout(
                    "server did not answer initialize",
                    Some(self.connect_timeout),
                ));
            }
        };
        info!(
            server = service.peer_info().map(|info| info.server_info.name.as_str()).unwrap_or("unknown"),
            "protocol server connected"
        );
        let peer = service.peer().clone();
        Ok(Session { service, peer })
    }

    /// Peer handle of the live session, connecting first when needed.
    async fn peer(&self) -> Result<Peer<RoleClient>, SubagentError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn().await?);
        }
        match guard.as_ref() {
            Some(session) => Ok(session.peer.clone()),
            None => Err(SubagentError::connection("not connected")),
        }
    }

    async fn drop_session(&self) {
        if let Some(session) = self.session.lock().await.take() {
            warn!("dropping protocol connection");
            session.shutdown().await;
        }
    }
}

#[async_trait]
impl ToolClient for McpToolClient {
    async fn connect(&self) -> Result<(), SubagentError> {
        self.peer().await.map(|_| ())
    }

    async fn call_tool(&self, call: ToolCall<'_>, notify: &NotifyFn<'_>) -> Result<ToolCallResult, SubagentError> {
        let peer = self.peer().await?;
        let params = serde_json::from_value(json!({"name": call.name, "arguments": call.arguments}))
            .map_err(|e| SubagentError::protocol(format!("encode tool call: {e}")))?;

        let (tx, mut frames) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);

        let request = peer.call_tool(params);
        tokio::pin!(request);
        let deadline = tokio::time::sleep(call.timeout);
        tokio::pin!(deadline);
        let end = loop {
            tokio::select! {
                result = &mut request => {
                    let result = result.map_err(SubagentError::from).and_then(|result| {
                        serde_json::to_value(&result)
                            .map_err(|e| SubagentError::protocol(format!("decode tool result: {e}")))
                    });
                    break CallEnd::Done(result);
                }
                Some(frame) = frames.recv() => notify(&frame),
                () = &mut deadline => break CallEnd::TimedOut,
                () = call.cancel.cancelled() => break CallEnd::Cancelled,
            }
        };
        while let Ok(frame) = frames.try_recv() {
            notify(&frame);
        }

        let result = match end {
            CallEnd::Done(result) => result,
            CallEnd::TimedOut => Err(SubagentError::timeout(
                format!("tool {} timed out after {}s", call.name, call.timeout.as_secs()),
                Some(call.timeout),
            )),
            CallEnd::Cancelled => Err(SubagentError::tool_execution("execution cancelled", None)),
        };
        let broken = result.as_ref().is_err_and(|err| {
            matches!(err.kind(), ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Protocol)
        });
        if broken || call.cancel.is_cancelled() {
            self.drop_session().await;
        }
        Ok(ToolCallResult::from_result(&result?))
    }

    /// Liveness check: a `tools/list` round trip within `timeout`.
    async fn ping(&self, timeout: Duration) -> Result<(), SubagentError> {
        let peer = match self.session.lock().await.as_ref() {
            Some(session) => session.peer.clone(),
            None => return Err(SubagentError::connection("not connected")),
        };
        match tokio::time::timeout(timeout, peer.list_all_tools()).await {
            Ok(result) => result.map(|_| ()).map_err(SubagentError::from),
            Err(_) => Err(SubagentError::timeout("ping timed out", Some(timeout))),
        }
    }

    async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            debug!("closing protocol server");
            session.shutdown().await;
        }
    }
}
