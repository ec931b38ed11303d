//! Protocol backend: one tool call per iteration on a long-lived server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::error::SubagentError;
use crate::core::stream::ParsedEvent;
use crate::core::types::{BackendKind, BackendResult, ProgressEventType};
use crate::io::backend::mcp::McpToolClient;
use crate::io::backend::{Backend, BackendConfig, BackendRequest, ProgressEmitter};

/// One `tools/call` invocation.
#[derive(Debug, Clone)]
pub struct ToolCall<'a> {
    pub name: &'a str,
    pub arguments: Value,
    pub timeout: Duration,
    pub cancel: &'a CancellationToken,
}

/// Text content and error flag of a tool result.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub text: String,
    pub is_error: bool,
    pub raw: Value,
}

impl ToolCallResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
            raw: Value::Null,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
            raw: Value::Null,
        }
    }

    /// Join the `text` parts of a `tools/call` result.
    pub fn from_result(result: &Value) -> Self {
        let text = match result.get("content") {
            Some(Value::Array(parts)) => parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            Some(Value::String(text)) => text.clone(),
            _ => String::new(),
        };
        Self {
            text,
            is_error: result.get("isError").and_then(Value::as_bool).unwrap_or(false),
            raw: result.clone(),
        }
    }
}

/// Receiver for server notifications seen during a call.
pub type NotifyFn<'a> = dyn Fn(&Value) + Send + Sync + 'a;

/// Client side of the tool-call protocol.
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Start the server and complete the handshake if not yet connected.
    async fn connect(&self) -> Result<(), SubagentError>;

    /// Call a tool. `notify` receives server notifications seen meanwhile.
    async fn call_tool(
        &self,
        call: ToolCall<'_>,
        notify: &NotifyFn<'_>,
    ) -> Result<ToolCallResult, SubagentError>;

    async fn ping(&self, timeout: Duration) -> Result<(), SubagentError>;

    async fn close(&self);
}

/// Translate a server notification into a progress event.
pub fn notification_event(frame: &Value) -> Option<ParsedEvent> {
    let method = frame.get("method").and_then(Value::as_str)?;
    let params = frame.get("params").cloned().unwrap_or(Value::Null);
    let content = match method {
        "notifications/progress" => match params.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => {
                let progress = params.get("progress").and_then(Value::as_f64).unwrap_or(0.0);
                match params.get("total").and_then(Value::as_f64) {
                    Some(total) => format!("progress {progress}/{total}"),
                    None => format!("progress {progress}"),
                }
            }
        },
        "notifications/message" => match params.get("data") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => return None,
        },
        _ => return None,
    };
    let mut metadata = Map::new();
    metadata.insert("method".to_string(), json!(method));
    if !params.is_null() {
        metadata.insert("params".to_string(), params);
    }
    Some(ParsedEvent {
        event_type: ProgressEventType::Thinking,
        content,
        metadata: Value::Object(metadata),
    })
}

pub struct ProtocolBackend {
    config: BackendConfig,
    client: Arc<dyn ToolClient>,
    /// Rebuild a stdio client whenever the backend is reconfigured.
    stdio: bool,
    emitter: ProgressEmitter,
}

impl std::fmt::Debug for ProtocolBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolBackend")
            .field("command", &self.config.protocol.command)
            .field("stdio", &self.stdio)
            .finish_non_exhaustive()
    }
}

impl ProtocolBackend {
    /// Backend that spawns `protocol.command` as an MCP server on stdio.
    pub fn stdio() -> Self {
        let config = BackendConfig::default();
        Self {
            client: Arc::new(McpToolClient::new(&config.protocol)),
            config,
            stdio: true,
            emitter: ProgressEmitter::new(BackendKind::Protocol),
        }
    }

    /// Backend over an existing client.
    pub fn with_client(client: Arc<dyn ToolClient>) -> Self {
        Self {
            config: BackendConfig::default(),
            client,
            stdio: false,
            emitter: ProgressEmitter::new(BackendKind::Protocol),
        }
    }

    fn tool_name(&self, request: &BackendRequest) -> String {
        match &self.config.protocol.tool_name {
            Some(name) => name.clone(),
            None => format!("{}_subagent", request.subagent.as_str()),
        }
    }

    fn emit(&self, request: &BackendRequest, event_type: ProgressEventType, content: &str, metadata: Value) {
        self.emitter.emit(
            request,
            ParsedEvent {
                event_type,
                content: content.to_string(),
                metadata,
            },
        );
    }
}

#[async_trait]
impl Backend for ProtocolBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Protocol
    }

    fn configure(&mut self, config: BackendConfig) {
        if self.stdio {
            self.client = Arc::new(McpToolClient::new(&config.protocol));
        }
        self.config = config;
    }

    async fn initialize(&self) -> Result<(), SubagentError> {
        self.client.connect().await
    }

    #[instrument(skip_all, fields(subagent = %request.subagent, iteration = request.iteration))]
    async fn execute(&self, request: &BackendRequest) -> Result<BackendResult, SubagentError> {
        let tool = self.tool_name(request);
        let arguments = json!({
            "instruction": request.instruction,
            "project_path": request.working_directory.display().to_string(),
            "model": request.model,
            "iteration": request.iteration,
            "subagent": request.subagent.as_str(),
            "timeout_ms": request.timeout.as_millis() as u64,
        });
        info!(tool = %tool, "calling protocol tool");
        let started = Instant::now();
        self.emit(
            request,
            ProgressEventType::Start,
            &format!("calling {tool}"),
            json!({"tool": tool}),
        );

        let notify = |frame: &Value| {
            if let Some(parsed) = notification_event(frame) {
                self.emitter.emit(request, parsed);
            }
        };
        let call = ToolCall {
            name: &tool,
            arguments,
            timeout: request.timeout,
            cancel: &request.cancel,
        };
        let outcome = match self.client.call_tool(call, &notify).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(kind = err.kind().as_str(), err = %err, "protocol call failed");
                self.emit(request, ProgressEventType::Error, err.message(), json!({"kind": err.kind().as_str()}));
                return Err(err);
            }
        };
        let duration = started.elapsed();
        let metadata = json!({"tool": tool});

        if outcome.is_error {
            warn!("tool reported an error");
            self.emit(request, ProgressEventType::Error, &outcome.text, Value::Null);
            let error = if outcome.text.trim().is_empty() {
                format!("tool {tool} reported an error")
            } else {
                outcome.text.clone()
            };
            let mut result = BackendResult::failed(outcome.text, error, duration);
            result.metadata = metadata;
            return Ok(result);
        }

        debug!(chars = outcome.text.len(), "tool call completed");
        self.emit(request, ProgressEventType::Result, &outcome.text, Value::Null);
        let mut result = BackendResult::completed(outcome.text, duration);
        result.metadata = metadata;
        Ok(result)
    }

    async fn is_available(&self) -> bool {
        if let Err(err) = self.client.connect().await {
            debug!(err = %err, "protocol server unavailable");
            return false;
        }
        let timeout = Duration::from_millis(self.config.protocol.ping_timeout_ms);
        match self.client.ping(timeout).await {
            Ok(()) => true,
            Err(err) => {
                debug!(err = %err, "protocol ping failed");
                false
            }
        }
    }

    fn emitter(&self) -> &ProgressEmitter {
        &self.emitter
    }

    async fn cleanup(&self) {
        self.client.close().await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use super::*;
    use crate::core::error::ErrorKind;
    use crate::core::types::{BackendStatus, ProgressEvent, SubagentKind};
    use crate::io::backend::ProgressSink;

    #[derive(Default)]
    struct FakeClient {
        responses: Mutex<VecDeque<Result<ToolCallResult, SubagentError>>>,
        calls: Mutex<Vec<(String, Value)>>,
        notifications: Vec<Value>,
        ping_ok: bool,
        closed: Mutex<u32>,
    }

    #[async_trait]
    impl ToolClient for FakeClient {
        async fn connect(&self) -> Result<(), SubagentError> {
            Ok(())
        }

        async fn call_tool(
            &self,
            call: ToolCall<'_>,
            notify: &NotifyFn<'_>,
        ) -> Result<ToolCallResult, SubagentError> {
            self.calls
                .lock()
                .unwrap()
                .push((call.name.to_string(), call.arguments.clone()));
            for frame in &self.notifications {
                notify(frame);
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ToolCallResult::text("default")))
        }

        async fn ping(&self, _timeout: Duration) -> Result<(), SubagentError> {
            if self.ping_ok {
                Ok(())
            } else {
                Err(SubagentError::timeout("ping timed out", None))
            }
        }

        async fn close(&self) {
            *self.closed.lock().unwrap() += 1;
        }
    }

    fn request(sink: Option<ProgressSink>) -> BackendRequest {
        BackendRequest {
            instruction: "say hi".to_string(),
            working_directory: PathBuf::from("/work"),
            model: Some("sonnet".to_string()),
            subagent: SubagentKind::Claude,
            iteration: 2,
            correlation_id: "corr".to_string(),
            timeout: Duration::from_secs(60),
            cancel: CancellationToken::new(),
            progress: sink,
        }
    }

    fn collecting_sink() -> (ProgressSink, Arc<Mutex<Vec<ProgressEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: ProgressSink = Arc::new(move |e: &ProgressEvent| sink_seen.lock().unwrap().push(e.clone()));
        (sink, seen)
    }

    #[tokio::test]
    async fn sends_tool_arguments_and_maps_success() {
        let client = Arc::new(FakeClient {
            responses: Mutex::new(VecDeque::from([Ok(ToolCallResult::text("hi!"))])),
            notifications: vec![json!({
                "jsonrpc": "2.0",
                "method": "notifications/message",
                "params": {"level": "info", "data": "warming up"}
            })],
            ..FakeClient::default()
        });
        let backend = ProtocolBackend::with_client(client.clone());
        let (sink, seen) = collecting_sink();

        let result = backend.execute(&request(Some(sink))).await.expect("execute");
        assert_eq!(result.status, BackendStatus::Completed);
        assert_eq!(result.content, "hi!");

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls[0].0, "claude_subagent");
        assert_eq!(calls[0].1["instruction"], "say hi");
        assert_eq!(calls[0].1["project_path"], "/work");
        assert_eq!(calls[0].1["iteration"], 2);
        assert_eq!(calls[0].1["timeout_ms"], 60_000);

        let types: Vec<_> = seen.lock().unwrap().iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![ProgressEventType::Start, ProgressEventType::Thinking, ProgressEventType::Result]
        );
        assert_eq!(seen.lock().unwrap()[1].content, "warming up");
    }

    #[tokio::test]
    async fn tool_error_becomes_failed_result() {
        let client = Arc::new(FakeClient {
            responses: Mutex::new(VecDeque::from([Ok(ToolCallResult::error("429 too many requests"))])),
            ..FakeClient::default()
        });
        let backend = ProtocolBackend::with_client(client);
        let result = backend.execute(&request(None)).await.expect("execute");
        assert_eq!(result.status, BackendStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("429 too many requests"));
    }

    #[tokio::test]
    async fn transport_errors_pass_through() {
        let client = Arc::new(FakeClient {
            responses: Mutex::new(VecDeque::from([Err(SubagentError::authentication("401"))])),
            ..FakeClient::default()
        });
        let backend = ProtocolBackend::with_client(client);
        let err = backend.execute(&request(None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn configured_tool_name_wins() {
        let client = Arc::new(FakeClient::default());
        let mut backend = ProtocolBackend::with_client(client.clone());
        let mut config = BackendConfig::default();
        config.protocol.tool_name = Some("run_agent".to_string());
        backend.configure(config);
        backend.execute(&request(None)).await.expect("execute");
        assert_eq!(client.calls.lock().unwrap()[0].0, "run_agent");
    }

    #[tokio::test]
    async fn availability_uses_ping_and_cleanup_closes() {
        let up = Arc::new(FakeClient {
            ping_ok: true,
            ..FakeClient::default()
        });
        let backend = ProtocolBackend::with_client(up.clone());
        assert!(backend.is_available().await);
        backend.cleanup().await;
        backend.cleanup().await;
        assert_eq!(*up.closed.lock().unwrap(), 2);

        let down = ProtocolBackend::with_client(Arc::new(FakeClient::default()));
        assert!(!down.is_available().await);
    }

    #[test]
    fn progress_notification_without_message() {
        let event = notification_event(&json!({
            "method": "notifications/progress",
            "params": {"progressToken": "t", "progress": 2, "total": 4}
        }))
        .expect("event");
        assert_eq!(event.content, "progress 2/4");
        assert_eq!(event.metadata["method"], "notifications/progress");
        assert!(notification_event(&json!({"method": "notifications/cancelled"})).is_none());
    }

    #[test]
    fn result_text_joins_text_parts() {
        let result = ToolCallResult::from_result(&json!({
            "content": [
                {"type": "text", "text": "a"},
                {"type": "image", "data": "..."},
                {"type": "text", "text": "b"}
            ],
            "isError": true
        }));
        assert_eq!(result.text, "a\nb");
        assert!(result.is_error);
    }
}
