//! Incremental parsing of streamed subagent stdout into progress events.
//!
//! Output arrives in arbitrary chunks. [`LineBuffer`] splits on `\n` and holds
//! back the incomplete tail; [`parse_line`] turns each complete line into a
//! [`ParsedEvent`]. Unrecognized lines are kept as plain-text thinking events.

use serde_json::{Map, Value, json};

use crate::core::types::ProgressEventType;

/// Longest string value kept verbatim in a raw summary line.
const SUMMARY_TEXT_LIMIT: usize = 200;

/// Splits a byte stream into complete lines.
///
/// Each byte is scanned once. Lines longer than the limit keep their first
/// `max_line_bytes` bytes; the rest up to the next newline is dropped.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_line_bytes: usize,
    /// Dropping bytes until the next newline.
    overflowed: bool,
    truncated_lines: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(usize::MAX)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_line_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line_bytes,
            overflowed: false,
            truncated_lines: 0,
        }
    }

    /// Append a chunk and return every line it completed.
    ///
    /// Splitting happens on bytes, so a multi-byte character cut across chunks
    /// is decoded only once its line is complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.append(&rest[..pos]);
            lines.push(self.take_line());
            rest = &rest[pos + 1..];
        }
        self.append(rest);
        lines
    }

    /// Flush a trailing line that never received its newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            self.overflowed = false;
            return None;
        }
        Some(self.take_line())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Lines cut at the length limit so far.
    pub fn truncated_lines(&self) -> usize {
        self.truncated_lines
    }

    fn append(&mut self, bytes: &[u8]) {
        if self.overflowed {
            return;
        }
        let room = self.max_line_bytes.saturating_sub(self.pending.len());
        if bytes.len() > room {
            self.pending.extend_from_slice(&bytes[..room]);
            self.overflowed = true;
            self.truncated_lines += 1;
        } else {
            self.pending.extend_from_slice(bytes);
        }
    }

    fn take_line(&mut self) -> String {
        let line = decode_line(&self.pending);
        self.pending.clear();
        self.overflowed = false;
        line
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// One normalized event before the backend stamps session, sequence, and time.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub event_type: ProgressEventType,
    pub content: String,
    pub metadata: Value,
}

impl ParsedEvent {
    fn new(event_type: ProgressEventType, content: impl Into<String>, metadata: Value) -> Self {
        Self {
            event_type,
            content: content.into(),
            metadata,
        }
    }

    pub fn is_error(&self) -> bool {
        self.event_type == ProgressEventType::Error
    }
}

/// Parse one complete stdout line.
///
/// Returns `None` for blank and comment-like lines. With `raw` set, structured
/// events keep their type but their content becomes a `key=value` summary.
pub fn parse_line(line: &str, raw: bool) -> Option<ParsedEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("//") {
        return None;
    }
    let value = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => map,
        _ => return Some(plain_text(trimmed)),
    };
    let mut event = if is_generic(&value) {
        parse_generic(&value)
    } else {
        parse_structured(&value, trimmed)
    };
    if raw {
        event.content = render_summary(&value);
    }
    Some(event)
}

fn plain_text(line: &str) -> ParsedEvent {
    ParsedEvent::new(
        ProgressEventType::Thinking,
        line,
        json!({"format": "text", "priority": "low"}),
    )
}

/// The generic shape uses the progress vocabulary directly and never carries
/// the result-family fields.
fn is_generic(value: &Map<String, Value>) -> bool {
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return false;
    };
    matches!(kind, "start" | "result" | "thinking" | "error")
        && !value.contains_key("subtype")
        && !value.contains_key("result")
        && !value.contains_key("is_error")
}

fn parse_generic(value: &Map<String, Value>) -> ParsedEvent {
    let event_type = value
        .get("type")
        .and_then(Value::as_str)
        .and_then(ProgressEventType::parse)
        .unwrap_or(ProgressEventType::Thinking);
    let content = value.get("content").map(value_text).unwrap_or_default();
    let metadata = value.get("metadata").cloned().unwrap_or(Value::Null);
    ParsedEvent::new(event_type, content, metadata)
}

fn parse_structured(value: &Map<String, Value>, line: &str) -> ParsedEvent {
    match value.get("type").and_then(Value::as_str) {
        Some("system") => parse_system(value),
        Some("assistant") => parse_assistant(value),
        Some("user") => parse_user(value),
        Some("result") => parse_result(value),
        _ => {
            let content = ["content", "message", "text"]
                .iter()
                .find_map(|key| value.get(*key).map(value_text))
                .unwrap_or_else(|| line.to_string());
            ParsedEvent::new(
                ProgressEventType::Thinking,
                content,
                json!({"format": "json", "priority": "low"}),
            )
        }
    }
}

fn parse_system(value: &Map<String, Value>) -> ParsedEvent {
    let subtype = str_field(value, "subtype").unwrap_or("system");
    let mut metadata = Map::new();
    metadata.insert("subtype".into(), json!(subtype));
    copy_fields(value, &mut metadata, &["session_id", "model", "cwd", "permissionMode"]);
    if let Some(tools) = value.get("tools").and_then(Value::as_array) {
        metadata.insert("tool_count".into(), json!(tools.len()));
    }
    let content = match str_field(value, "model") {
        Some(model) if subtype == "init" => format!("session initialized (model {model})"),
        _ if subtype == "init" => "session initialized".to_string(),
        _ => format!("system: {subtype}"),
    };
    let event_type = if subtype == "init" {
        ProgressEventType::Start
    } else {
        ProgressEventType::Thinking
    };
    ParsedEvent::new(event_type, content, Value::Object(metadata))
}

fn parse_assistant(value: &Map<String, Value>) -> ParsedEvent {
    let mut metadata = Map::new();
    copy_fields(value, &mut metadata, &["datetime", "counter", "session_id"]);

    // Simplified form emitted by the service scripts.
    if let Some(tool) = value.get("tool_use") {
        metadata.insert("tool_use".into(), tool.clone());
        let name = tool.get("name").and_then(Value::as_str).unwrap_or("tool");
        return ParsedEvent::new(
            ProgressEventType::Thinking,
            format!("using tool {name}"),
            Value::Object(metadata),
        );
    }
    if let Some(content) = value.get("content").and_then(Value::as_str) {
        return ParsedEvent::new(ProgressEventType::Thinking, content, Value::Object(metadata));
    }

    let message = value.get("message").and_then(Value::as_object);
    if let Some(usage) = message.and_then(|m| m.get("usage")) {
        copy_usage(usage, &mut metadata);
    }
    copy_fields(message.unwrap_or(value), &mut metadata, &["model"]);

    let mut texts = Vec::new();
    let mut tools = Vec::new();
    for item in message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        match item.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    texts.push(text.to_string());
                }
            }
            Some("tool_use") => {
                let name = item.get("name").and_then(Value::as_str).unwrap_or("tool");
                tools.push(name.to_string());
                metadata
                    .entry("tool_use")
                    .or_insert_with(|| json!({"name": name, "input": item.get("input").cloned().unwrap_or(Value::Null)}));
            }
            _ => {}
        }
    }
    let content = if !texts.is_empty() {
        texts.join("\n")
    } else if !tools.is_empty() {
        format!("using tool {}", tools.join(", "))
    } else {
        String::new()
    };
    ParsedEvent::new(ProgressEventType::Thinking, content, Value::Object(metadata))
}

fn parse_user(value: &Map<String, Value>) -> ParsedEvent {
    let mut metadata = Map::new();
    copy_fields(value, &mut metadata, &["session_id"]);
    let mut is_error = false;
    let mut texts = Vec::new();
    let items = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array);
    for item in items.into_iter().flatten() {
        if item.get("type").and_then(Value::as_str) == Some("tool_result") {
            is_error |= item.get("is_error").and_then(Value::as_bool).unwrap_or(false);
            if let Some(content) = item.get("content") {
                texts.push(value_text(content));
            }
        }
    }
    metadata.insert("tool_result".into(), json!(true));
    metadata.insert("is_error".into(), json!(is_error));
    let content = if texts.is_empty() {
        "tool result".to_string()
    } else {
        texts.join("\n")
    };
    ParsedEvent::new(ProgressEventType::Thinking, content, Value::Object(metadata))
}

fn parse_result(value: &Map<String, Value>) -> ParsedEvent {
    let subtype = str_field(value, "subtype").unwrap_or("success");
    let is_error = value.get("is_error").and_then(Value::as_bool).unwrap_or(false)
        || subtype.starts_with("error");
    let mut metadata = Map::new();
    metadata.insert("subtype".into(), json!(subtype));
    metadata.insert("is_error".into(), json!(is_error));
    copy_fields(
        value,
        &mut metadata,
        &[
            "total_cost_usd",
            "cost_usd",
            "num_turns",
            "duration_ms",
            "duration_api_ms",
            "session_id",
        ],
    );
    if let Some(usage) = value.get("usage") {
        copy_usage(usage, &mut metadata);
    }
    let content = value
        .get("result")
        .map(value_text)
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| subtype.to_string());
    let event_type = if is_error {
        ProgressEventType::Error
    } else {
        ProgressEventType::Result
    };
    ParsedEvent::new(event_type, content, Value::Object(metadata))
}

fn str_field<'a>(value: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn copy_fields(from: &Map<String, Value>, to: &mut Map<String, Value>, keys: &[&str]) {
    for key in keys {
        if let Some(v) = from.get(*key)
            && !v.is_null()
        {
            to.insert((*key).to_string(), v.clone());
        }
    }
}

fn copy_usage(usage: &Value, to: &mut Map<String, Value>) {
    for key in [
        "input_tokens",
        "output_tokens",
        "cache_creation_input_tokens",
        "cache_read_input_tokens",
    ] {
        if let Some(n) = usage.get(key).filter(|v| v.is_number()) {
            to.insert(key.to_string(), n.clone());
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => value_text(item),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Render a structured event as one `key=value` line.
///
/// `type` and `subtype` lead; every other scalar follows in key order with
/// nested objects flattened to dotted keys. Numbers and booleans are never
/// truncated.
pub fn render_summary(value: &Map<String, Value>) -> String {
    let mut parts = Vec::new();
    for key in ["type", "subtype"] {
        if let Some(v) = value.get(key) {
            push_scalar(&mut parts, key, v);
        }
    }
    let mut rest: Vec<(&String, &Value)> = value
        .iter()
        .filter(|(k, _)| k.as_str() != "type" && k.as_str() != "subtype")
        .collect();
    rest.sort_by(|a, b| a.0.cmp(b.0));
    for (key, v) in rest {
        flatten(&mut parts, key, v);
    }
    parts.join(" ")
}

fn flatten(parts: &mut Vec<String>, key: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (child, v) in entries {
                flatten(parts, &format!("{key}.{child}"), v);
            }
        }
        Value::Array(items) => {
            let text = value_text(value);
            if !text.trim().is_empty() && items.iter().any(|item| item.get("text").is_some()) {
                push_scalar(parts, key, &Value::String(text));
            } else {
                parts.push(format!("{key}=[{}]", items.len()));
            }
        }
        _ => push_scalar(parts, key, value),
    }
}

fn push_scalar(parts: &mut Vec<String>, key: &str, value: &Value) {
    match value {
        Value::String(s) => {
            let mut text: String = s.chars().take(SUMMARY_TEXT_LIMIT).collect();
            if s.chars().count() > SUMMARY_TEXT_LIMIT {
                text.push_str("...");
            }
            if text.is_empty() || text.contains(char::is_whitespace) || text.contains('"') {
                parts.push(format!("{key}={}", Value::String(text)));
            } else {
                parts.push(format!("{key}={text}"));
            }
        }
        Value::Null => parts.push(format!("{key}=null")),
        other => parts.push(format!("{key}={other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_json_object_yields_one_line() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(br#"{"type":"thinking","con"#).is_empty());
        let lines = buffer.push(b"tent\":\"hi\"}\n");
        assert_eq!(lines, vec![r#"{"type":"thinking","content":"hi"}"#.to_string()]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let mut buffer = LineBuffer::new();
        let text = "héllo\n".as_bytes();
        assert!(buffer.push(&text[..2]).is_empty());
        assert_eq!(buffer.push(&text[2..]), vec!["héllo".to_string()]);
    }

    #[test]
    fn finish_flushes_trailing_line() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push(b"a\r\nb"), vec!["a".to_string()]);
        assert_eq!(buffer.finish(), Some("b".to_string()));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn newline_free_stream_stays_bounded() {
        let limit = 100_000;
        let mut buffer = LineBuffer::with_limit(limit);
        let chunk = vec![b'a'; 8192];
        for _ in 0..(64 * 1024 * 1024 / chunk.len()) {
            assert!(buffer.push(&chunk).is_empty());
            assert!(buffer.pending_len() <= limit);
        }
        let lines = buffer.push(b"tail\nnext\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), limit);
        assert_eq!(lines[1], "next");
        assert_eq!(buffer.truncated_lines(), 1);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn line_exactly_at_limit_is_kept_whole() {
        let mut buffer = LineBuffer::with_limit(4);
        assert_eq!(buffer.push(b"abcd\nabcdef"), vec!["abcd".to_string()]);
        assert_eq!(buffer.finish(), Some("abcd".to_string()));
        assert_eq!(buffer.truncated_lines(), 1);
    }

    #[test]
    fn generic_event_maps_directly() {
        let event = parse_line(r#"{"type":"start","content":"go","metadata":{"k":1}}"#, false).unwrap();
        assert_eq!(event.event_type, ProgressEventType::Start);
        assert_eq!(event.content, "go");
        assert_eq!(event.metadata, json!({"k": 1}));
    }

    #[test]
    fn result_with_result_field_is_not_generic() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":"done","total_cost_usd":0.01,"num_turns":3}"#;
        let event = parse_line(line, false).unwrap();
        assert_eq!(event.event_type, ProgressEventType::Result);
        assert_eq!(event.content, "done");
        assert_eq!(event.metadata["num_turns"], 3);
        assert_eq!(event.metadata["total_cost_usd"], 0.01);
    }

    #[test]
    fn error_result_becomes_error_event() {
        let line = r#"{"type":"result","subtype":"error_max_turns","is_error":true,"result":""}"#;
        let event = parse_line(line, false).unwrap();
        assert!(event.is_error());
        assert_eq!(event.content, "error_max_turns");
    }

    #[test]
    fn system_init_becomes_start() {
        let line = r#"{"type":"system","subtype":"init","model":"sonnet","tools":["Bash","Edit"]}"#;
        let event = parse_line(line, false).unwrap();
        assert_eq!(event.event_type, ProgressEventType::Start);
        assert_eq!(event.metadata["tool_count"], 2);
    }

    #[test]
    fn assistant_message_extracts_text_and_usage() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"}],"usage":{"input_tokens":10,"output_tokens":4}}}"#;
        let event = parse_line(line, false).unwrap();
        assert_eq!(event.event_type, ProgressEventType::Thinking);
        assert_eq!(event.content, "Hello");
        assert_eq!(event.metadata["output_tokens"], 4);
    }

    #[test]
    fn simplified_assistant_tool_use() {
        let line = r##"{"type":"assistant","datetime":"10:00:00 AM","counter":"#2","tool_use":{"name":"Bash","input":{"command":"ls"}}}"##;
        let event = parse_line(line, false).unwrap();
        assert_eq!(event.content, "using tool Bash");
        assert_eq!(event.metadata["counter"], "#2");
    }

    #[test]
    fn plain_text_and_comments() {
        let event = parse_line("compiling crate...", false).unwrap();
        assert_eq!(event.event_type, ProgressEventType::Thinking);
        assert_eq!(event.metadata["priority"], "low");
        assert!(parse_line("   ", false).is_none());
        assert!(parse_line("# comment", false).is_none());
        assert!(parse_line("// note", false).is_none());
    }

    #[test]
    fn raw_mode_keeps_numeric_fields() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":"all done","num_turns":4,"total_cost_usd":0.25,"usage":{"input_tokens":7}}"#;
        let event = parse_line(line, true).unwrap();
        assert_eq!(event.event_type, ProgressEventType::Result);
        assert!(event.content.starts_with("type=result subtype=success"));
        assert!(event.content.contains("num_turns=4"));
        assert!(event.content.contains("total_cost_usd=0.25"));
        assert!(event.content.contains("usage.input_tokens=7"));
        assert!(event.content.contains(r#"result="all done""#));
    }
}
