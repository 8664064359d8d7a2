//! Progress event types flowing from backends through the engine to
//! subscribers.

use serde::{Deserialize, Serialize};

use crate::id::now_ms;

/// The typed payload of a progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressPayload {
    /// The engine is starting an iteration
    IterationStart { iteration: u32 },
    /// An iteration finished (successfully or not)
    IterationComplete {
        iteration: u32,
        success: bool,
        duration_ms: u64,
    },
    /// A backend observed a tool invocation starting
    ToolStart { tool: String },
    /// A backend observed a tool invocation finishing
    ToolResult { tool: String, success: bool },
    /// Streaming model/agent output, whitespace preserved verbatim
    Thinking { content: String },
    /// Informational note from a backend or the engine
    Info { content: String },
    /// An error surfaced mid-run
    Error { content: String },
    /// A rate limit was detected; reset time in epoch seconds if known
    RateLimit { reset_at: Option<i64> },
}

/// A progress event: a payload plus the wall-clock time it was produced.
///
/// Events are value objects; their only identity is their position in the
/// stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(flatten)]
    pub payload: ProgressPayload,
    pub timestamp_ms: u64,
}

impl ProgressEvent {
    fn new(payload: ProgressPayload) -> Self {
        Self {
            payload,
            timestamp_ms: now_ms(),
        }
    }

    pub fn iteration_start(iteration: u32) -> Self {
        Self::new(ProgressPayload::IterationStart { iteration })
    }

    pub fn iteration_complete(iteration: u32, success: bool, duration_ms: u64) -> Self {
        Self::new(ProgressPayload::IterationComplete {
            iteration,
            success,
            duration_ms,
        })
    }

    pub fn tool_start(tool: impl Into<String>) -> Self {
        Self::new(ProgressPayload::ToolStart { tool: tool.into() })
    }

    pub fn tool_result(tool: impl Into<String>, success: bool) -> Self {
        Self::new(ProgressPayload::ToolResult {
            tool: tool.into(),
            success,
        })
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self::new(ProgressPayload::Thinking {
            content: content.into(),
        })
    }

    pub fn info(content: impl Into<String>) -> Self {
        Self::new(ProgressPayload::Info {
            content: content.into(),
        })
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(ProgressPayload::Error {
            content: content.into(),
        })
    }

    pub fn rate_limit(reset_at: Option<i64>) -> Self {
        Self::new(ProgressPayload::RateLimit { reset_at })
    }

    /// Short name of the payload variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self.payload {
            ProgressPayload::IterationStart { .. } => "iteration_start",
            ProgressPayload::IterationComplete { .. } => "iteration_complete",
            ProgressPayload::ToolStart { .. } => "tool_start",
            ProgressPayload::ToolResult { .. } => "tool_result",
            ProgressPayload::Thinking { .. } => "thinking",
            ProgressPayload::Info { .. } => "info",
            ProgressPayload::Error { .. } => "error",
            ProgressPayload::RateLimit { .. } => "rate_limit",
        }
    }
}
