//! Subprocess backend: spawns an executable per call and converts its
//! stdout stream into progress events plus a final result.
//!
//! Output is read line-buffered. A line that parses as a JSON object with a
//! string `type` field is a structured record: `assistant` records become
//! thinking events, a `result` record supplies the final text and usage.
//! Anything else is emitted verbatim as a `thinking` event with leading and
//! trailing whitespace preserved exactly, since downstream consumers of
//! streamed code are whitespace-sensitive.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::backend::{Backend, BackendError};
use crate::domain::{ProgressEvent, ResultMetadata, ToolCallRequest, ToolCallResult, Usage};
use crate::progress::{ProgressBus, ProgressSubscription};

/// Configuration for the subprocess backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubprocessConfig {
    /// Executable to spawn per call
    pub program: String,

    /// Fixed arguments placed before the instruction
    pub args: Vec<String>,

    /// Extra environment variables for the child
    pub env: Vec<(String, String)>,

    /// Upper bound on captured stdout/stderr kept in memory
    pub max_capture_bytes: usize,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
            env: Vec::new(),
            max_capture_bytes: 1024 * 1024,
        }
    }
}

/// A rate-limit signal found in process output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RateLimitNotice {
    reset_at: Option<i64>,
}

/// Scan output text for provider rate-limit phrasing.
///
/// Usage-limit banners carry the reset time as a `|<epoch-seconds>` trailer.
fn detect_rate_limit(text: &str) -> Option<RateLimitNotice> {
    let lower = text.to_ascii_lowercase();
    let hit = lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("usage limit reached")
        || lower.contains("too many requests");
    if !hit {
        return None;
    }

    let reset_at = text
        .rsplit('|')
        .next()
        .and_then(|tail| tail.trim().parse::<i64>().ok());
    Some(RateLimitNotice { reset_at })
}

/// Strip exactly one trailing line terminator, leaving all other whitespace
/// untouched.
fn trim_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Parse a line as a structured record: a JSON object carrying a string
/// `type` discriminator. Anything else is opaque text.
fn as_structured_record(text: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(text).ok()?;
    let is_record = value.is_object() && value.get("type").is_some_and(Value::is_string);
    is_record.then_some(value)
}

/// Accumulated state of one call's stdout stream.
#[derive(Debug, Default)]
struct ParsedStream {
    /// Raw captured text, bounded by `max_capture_bytes`
    captured: String,
    capture_truncated: bool,
    saw_structured: bool,
    saw_result: bool,
    result_text: Option<String>,
    result_is_error: bool,
    usage: Option<Usage>,
    tool_calls: u32,
    rate_limit: Option<RateLimitNotice>,
}

impl ParsedStream {
    fn capture(&mut self, line: &str, max_bytes: usize) {
        if self.capture_truncated {
            return;
        }
        let remaining = max_bytes.saturating_sub(self.captured.len());
        if remaining == 0 {
            warn!(max_bytes, "stdout capture exceeded limit, truncating");
            self.capture_truncated = true;
            return;
        }
        let mut take = line.len().min(remaining);
        while !line.is_char_boundary(take) {
            take -= 1;
        }
        self.captured.push_str(&line[..take]);
        if take < line.len() {
            self.capture_truncated = true;
        }
    }

    fn note_rate_limit(&mut self, text: &str) {
        if self.rate_limit.is_none() {
            self.rate_limit = detect_rate_limit(text);
        }
    }

    /// Handle one structured record, emitting progress events as needed.
    fn process_record(&mut self, record: &Value, bus: &ProgressBus) {
        self.saw_structured = true;
        match record.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                if let Some(content) = record.get("content").and_then(Value::as_str) {
                    bus.emit(ProgressEvent::thinking(content));
                } else if let Some(blocks) =
                    record.pointer("/message/content").and_then(Value::as_array)
                {
                    for block in blocks {
                        match block.get("type").and_then(Value::as_str) {
                            Some("text") => {
                                if let Some(text) = block.get("text").and_then(Value::as_str) {
                                    bus.emit(ProgressEvent::thinking(text));
                                }
                            }
                            Some("tool_use") => {
                                let name = block
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .unwrap_or("unknown");
                                self.tool_calls += 1;
                                bus.emit(ProgressEvent::tool_start(name));
                            }
                            _ => {}
                        }
                    }
                }
            }
            Some("user") => {
                if let Some(blocks) = record.pointer("/message/content").and_then(Value::as_array) {
                    for block in blocks {
                        if block.get("type").and_then(Value::as_str) == Some("tool_result") {
                            let id = block
                                .get("tool_use_id")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown");
                            let is_error =
                                block.get("is_error").and_then(Value::as_bool).unwrap_or(false);
                            bus.emit(ProgressEvent::tool_result(id, !is_error));
                        }
                    }
                }
            }
            Some("result") => {
                self.saw_result = true;
                self.result_is_error = record
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                    || record
                        .get("subtype")
                        .and_then(Value::as_str)
                        .is_some_and(|s| s.starts_with("error"));
                self.result_text = record
                    .get("result")
                    .and_then(Value::as_str)
                    .or_else(|| record.get("error").and_then(Value::as_str))
                    .map(str::to_string);
                self.usage = record
                    .get("usage")
                    .and_then(|u| serde_json::from_value(u.clone()).ok());
                if let Some(text) = self.result_text.clone() {
                    self.note_rate_limit(&text);
                }
            }
            Some(other) => {
                debug!(record_type = other, "ignoring unrecognized structured record");
            }
            None => {}
        }
    }
}

/// Read a child's stdout incrementally, classifying each line.
///
/// A `result` record ends the classification phase; later lines flow through
/// the plain-text path. Read errors end the stream without failing the call.
async fn parse_stream<R: AsyncRead + Unpin>(
    reader: R,
    bus: ProgressBus,
    max_capture_bytes: usize,
) -> ParsedStream {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut parsed = ParsedStream::default();
    let mut classifying = true;

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "stdout read ended early");
                break;
            }
        }

        parsed.capture(&line, max_capture_bytes);
        let text = trim_line_ending(&line);

        if classifying && let Some(record) = as_structured_record(text) {
            parsed.process_record(&record, &bus);
            if parsed.saw_result {
                classifying = false;
            }
            continue;
        }

        // Free-form output: forward verbatim, whitespace intact.
        parsed.note_rate_limit(text);
        bus.emit(ProgressEvent::thinking(text));
    }

    parsed
}

/// Read a stream to completion, keeping at most `max_bytes` in memory.
async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R, max_bytes: usize) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(error = %err, "stderr read ended early");
                break;
            }
        };

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            // Keep draining the pipe but discard the rest.
            continue;
        }
        buf.extend_from_slice(&chunk[..n.min(remaining)]);
    }

    String::from_utf8_lossy(&buf).into_owned()
}

/// Backend that executes each iteration by spawning a configured executable.
pub struct SubprocessBackend {
    config: SubprocessConfig,
    bus: ProgressBus,
}

impl SubprocessBackend {
    pub fn new(config: SubprocessConfig) -> Self {
        Self {
            config,
            bus: ProgressBus::new(),
        }
    }

    /// Locate the configured program: explicit paths are checked directly,
    /// bare names are resolved against PATH.
    fn resolve_program(&self) -> Option<PathBuf> {
        let program = Path::new(&self.config.program);
        if program.components().count() > 1 {
            return program.is_file().then(|| program.to_path_buf());
        }

        let path_var = std::env::var_os("PATH")?;
        std::env::split_paths(&path_var)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    }

    fn build_command(&self, request: &ToolCallRequest) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args);
        if let Some(model) = &request.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(subagent) = &request.subagent {
            cmd.arg("--agent").arg(subagent);
        }
        cmd.args(&request.arguments);
        cmd.arg(&request.instruction);
        cmd.current_dir(&request.working_dir);
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Backend for SubprocessBackend {
    async fn initialize(&self) -> Result<(), BackendError> {
        debug!(program = %self.config.program, "subprocess backend initialized");
        Ok(())
    }

    async fn execute(&self, request: ToolCallRequest) -> Result<ToolCallResult, BackendError> {
        let mut child = self.build_command(&request).spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Unrecoverable("child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Unrecoverable("child stderr not captured".to_string()))?;

        let max_capture = self.config.max_capture_bytes;
        let stdout_task = tokio::spawn(parse_stream(stdout, self.bus.clone(), max_capture));
        let stderr_task = tokio::spawn(read_bounded(stderr, max_capture));

        // timeout_ms == 0 means no per-call bound
        let status = if request.timeout_ms == 0 {
            Some(child.wait().await.map_err(BackendError::Spawn)?)
        } else {
            match tokio::time::timeout(request.timeout(), child.wait()).await {
                Ok(waited) => Some(waited.map_err(BackendError::Spawn)?),
                Err(_) => {
                    warn!(timeout_ms = request.timeout_ms, "call timed out; killing child");
                    if let Err(err) = child.kill().await {
                        warn!(error = %err, "failed to kill timed-out child");
                    }
                    let _ = child.wait().await;
                    None
                }
            }
        };

        // Join the readers so every already-emitted event is flushed before
        // the call resolves; pipes are closed once the child is gone.
        let (parsed, stderr_text) = futures::future::join(stdout_task, stderr_task).await;
        let parsed = parsed
            .map_err(|err| BackendError::Unrecoverable(format!("stdout reader failed: {}", err)))?;
        let stderr_text = stderr_text.unwrap_or_default();

        let Some(status) = status else {
            return Err(BackendError::Timeout {
                limit_ms: request.timeout_ms,
            });
        };

        if let Some(notice) = parsed
            .rate_limit
            .or_else(|| detect_rate_limit(&stderr_text))
        {
            return Err(BackendError::RateLimited {
                reset_at: notice.reset_at,
            });
        }

        let metadata = ResultMetadata {
            structured_output: parsed.saw_structured,
            raw_output: parsed.saw_structured.then(|| parsed.captured.clone()),
            task_complete: false,
            tool_calls: parsed.tool_calls,
            usage: parsed.usage,
        };

        if !status.success() && !(parsed.saw_result && parsed.result_is_error) {
            return Err(BackendError::Exited {
                code: status.code(),
                stderr: stderr_text,
            });
        }

        let content = parsed.result_text.unwrap_or_else(|| parsed.captured.clone());
        if parsed.result_is_error {
            Ok(ToolCallResult::failure(content.clone(), content).with_metadata(metadata))
        } else {
            Ok(ToolCallResult::success(content).with_metadata(metadata))
        }
    }

    async fn cleanup(&self) -> Result<(), BackendError> {
        // Children are per-call and reaped in execute; nothing persistent.
        debug!("subprocess backend cleaned up");
        Ok(())
    }

    async fn is_available(&self) -> bool {
        self.resolve_program().is_some()
    }

    fn on_progress(&self) -> ProgressSubscription {
        self.bus.subscribe()
    }
}

impl std::fmt::Debug for SubprocessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessBackend")
            .field("program", &self.config.program)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProgressPayload;

    fn sh(script: &str) -> SubprocessBackend {
        SubprocessBackend::new(SubprocessConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: Vec::new(),
            max_capture_bytes: 64 * 1024,
        })
    }

    fn call() -> ToolCallRequest {
        ToolCallRequest::new("unused", "/tmp", 10_000)
    }

    fn thinking_contents(events: &[crate::domain::ProgressEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match &event.payload {
                ProgressPayload::Thinking { content } => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_trim_line_ending() {
        assert_eq!(trim_line_ending("hello\n"), "hello");
        assert_eq!(trim_line_ending("hello\r\n"), "hello");
        assert_eq!(trim_line_ending("hello"), "hello");
        assert_eq!(trim_line_ending("\t\tkeep me\t\n"), "\t\tkeep me\t");
    }

    #[test]
    fn test_as_structured_record() {
        assert!(as_structured_record(r#"{"type":"assistant","content":"hi"}"#).is_some());
        assert!(as_structured_record(r#"{"no_type":"here"}"#).is_none());
        assert!(as_structured_record(r#"{"type":42}"#).is_none());
        assert!(as_structured_record("plain words").is_none());
        assert!(as_structured_record(r#"["type","result"]"#).is_none());
    }

    #[test]
    fn test_detect_rate_limit_patterns() {
        assert!(detect_rate_limit("Error: rate_limit_error").is_some());
        assert!(detect_rate_limit("hit the rate limit, slow down").is_some());
        assert!(detect_rate_limit("HTTP 429 Too Many Requests").is_some());
        assert!(detect_rate_limit("all good here").is_none());
    }

    #[test]
    fn test_detect_rate_limit_reset_trailer() {
        let notice = detect_rate_limit("Claude AI usage limit reached|1999999999").unwrap();
        assert_eq!(notice.reset_at, Some(1999999999));

        let notice = detect_rate_limit("rate limit exceeded").unwrap();
        assert_eq!(notice.reset_at, None);
    }

    #[tokio::test]
    async fn test_plain_text_preserves_whitespace_exactly() {
        let backend = sh(r#"printf '\t\tconst x = 1;\n'"#);
        let mut sub = backend.on_progress();

        let result = backend.execute(call()).await.unwrap();

        let thinking = thinking_contents(&sub.drain());
        assert_eq!(thinking, vec!["\t\tconst x = 1;".to_string()]);
        assert!(!result.metadata.structured_output);
        assert!(result.metadata.raw_output.is_none());
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_plain_text_result_content_is_captured_stream() {
        let backend = sh("printf 'line one\\nline two\\n'");
        let result = backend.execute(call()).await.unwrap();
        assert_eq!(result.content, "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_empty_lines_are_forwarded_verbatim() {
        let backend = sh("printf 'a\\n\\nb\\n'");
        let mut sub = backend.on_progress();

        backend.execute(call()).await.unwrap();

        let thinking = thinking_contents(&sub.drain());
        assert_eq!(thinking, vec!["a".to_string(), "".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_structured_round_trip() {
        let backend = sh(
            r#"echo '{"type":"assistant","content":"thinking"}'; echo '{"type":"result","result":"done","usage":{"input_tokens":5,"output_tokens":7}}'"#,
        );
        let mut sub = backend.on_progress();

        let result = backend.execute(call()).await.unwrap();

        assert!(result.success);
        assert!(result.metadata.structured_output);
        assert!(result.content.contains("done"));
        assert_eq!(result.metadata.usage, Some(Usage::new(5, 7)));
        assert!(result.metadata.raw_output.is_some());

        let thinking = thinking_contents(&sub.drain());
        assert_eq!(thinking, vec!["thinking".to_string()]);
    }

    #[tokio::test]
    async fn test_nested_message_blocks_emit_tool_events() {
        let backend = sh(
            r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"checking"},{"type":"tool_use","name":"bash","id":"t1"}]}}'; echo '{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","is_error":false}]}}'; echo '{"type":"result","result":"ok"}'"#,
        );
        let mut sub = backend.on_progress();

        let result = backend.execute(call()).await.unwrap();
        assert_eq!(result.metadata.tool_calls, 1);

        let events = sub.drain();
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["thinking", "tool_start", "tool_result"]);
    }

    #[tokio::test]
    async fn test_result_record_ends_classification() {
        let backend = sh(
            r#"echo '{"type":"result","result":"done"}'; echo '{"type":"assistant","content":"late"}'"#,
        );
        let mut sub = backend.on_progress();

        let result = backend.execute(call()).await.unwrap();
        assert!(result.success);

        // The post-result JSON line flows through the plain-text path.
        let thinking = thinking_contents(&sub.drain());
        assert_eq!(thinking, vec![r#"{"type":"assistant","content":"late"}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_record_type_is_skipped_but_marks_structured() {
        let backend = sh(
            r#"echo '{"type":"system","subtype":"init"}'; echo '{"type":"result","result":"fin"}'"#,
        );
        let mut sub = backend.on_progress();

        let result = backend.execute(call()).await.unwrap();
        assert!(result.metadata.structured_output);
        assert!(thinking_contents(&sub.drain()).is_empty());
    }

    #[tokio::test]
    async fn test_structured_error_record_becomes_failed_result() {
        let backend =
            sh(r#"echo '{"type":"result","error":"could not apply patch","is_error":true}'; exit 1"#);

        let result = backend.execute(call()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("could not apply patch"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_structured_error() {
        let backend = sh("echo oops >&2; exit 3");

        let err = backend.execute(call()).await.unwrap_err();
        match err {
            BackendError::Exited { code, stderr } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("oops"));
            }
            other => panic!("expected Exited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_child_and_keeps_events() {
        let backend = sh("echo started; exec sleep 30");
        let mut sub = backend.on_progress();

        let request = ToolCallRequest::new("unused", "/tmp", 200);
        let err = backend.execute(request).await.unwrap_err();

        assert!(matches!(err, BackendError::Timeout { limit_ms: 200 }));
        let thinking = thinking_contents(&sub.drain());
        assert_eq!(thinking, vec!["started".to_string()]);
    }

    #[tokio::test]
    async fn test_rate_limit_detected_in_output() {
        let backend = sh("echo 'Claude AI usage limit reached|1999999999'");

        let err = backend.execute(call()).await.unwrap_err();
        match err {
            BackendError::RateLimited { reset_at } => assert_eq!(reset_at, Some(1999999999)),
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_detected_in_stderr() {
        let backend = sh("echo 'Error: rate_limit_error' >&2; exit 1");

        let err = backend.execute(call()).await.unwrap_err();
        assert!(err.is_rate_limit());
    }

    #[tokio::test]
    async fn test_is_available() {
        assert!(sh("true").is_available().await);

        let missing = SubprocessBackend::new(SubprocessConfig {
            program: "definitely-not-a-real-binary-xyz".to_string(),
            ..SubprocessConfig::default()
        });
        assert!(!missing.is_available().await);
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces_as_spawn_error() {
        let backend = SubprocessBackend::new(SubprocessConfig {
            program: "definitely-not-a-real-binary-xyz".to_string(),
            args: Vec::new(),
            env: Vec::new(),
            max_capture_bytes: 1024,
        });

        let err = backend.execute(call()).await.unwrap_err();
        assert!(matches!(err, BackendError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_lifecycle_is_idempotent() {
        let backend = sh("true");
        backend.initialize().await.unwrap();
        backend.cleanup().await.unwrap();
        backend.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_capture_is_bounded() {
        let backend = SubprocessBackend::new(SubprocessConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "yes 'a long filler line' | head -n 1000".to_string(),
            ],
            env: Vec::new(),
            max_capture_bytes: 512,
        });

        let result = backend.execute(call()).await.unwrap();
        assert!(result.content.len() <= 512);
    }

    #[test]
    fn test_default_config_targets_stream_json() {
        let config = SubprocessConfig::default();
        assert_eq!(config.program, "claude");
        assert!(config.args.iter().any(|a| a == "stream-json"));
    }
}
