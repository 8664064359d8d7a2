//! Per-call types exchanged with a backend
//!
//! One [`ToolCallRequest`] in, one [`ToolCallResult`] out, per iteration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scheduling hint attached to a call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// The unit of work handed to a backend for a single iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Instruction text for this iteration
    pub instruction: String,

    /// Extra backend-specific arguments
    #[serde(default)]
    pub arguments: Vec<String>,

    /// Optional model hint
    pub model: Option<String>,

    /// Named subagent to delegate to, when the backend supports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent: Option<String>,

    /// Working directory for the call
    pub working_dir: PathBuf,

    /// Per-call timeout in milliseconds
    pub timeout_ms: u64,

    /// Scheduling priority hint
    pub priority: Priority,
}

impl ToolCallRequest {
    /// Create a call request with normal priority.
    pub fn new(instruction: impl Into<String>, working_dir: impl AsRef<Path>, timeout_ms: u64) -> Self {
        Self {
            instruction: instruction.into(),
            arguments: Vec::new(),
            model: None,
            subagent: None,
            working_dir: working_dir.as_ref().to_path_buf(),
            timeout_ms,
            priority: Priority::default(),
        }
    }

    /// Set the model hint.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the subagent name.
    pub fn with_subagent(mut self, subagent: impl Into<String>) -> Self {
        self.subagent = Some(subagent.into());
        self
    }

    /// Set extra arguments.
    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Set the priority hint.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// The per-call timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Token usage reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    /// Create new usage stats
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Calculate total tokens
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Backend-specific metadata attached to a call result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// Whether the backend recognized structured records in the output stream
    #[serde(default)]
    pub structured_output: bool,

    /// Raw captured output, retained for diagnostics when structured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,

    /// Whether the backend signaled that the overall task is done
    #[serde(default)]
    pub task_complete: bool,

    /// Tool invocations observed during the call
    #[serde(default)]
    pub tool_calls: u32,

    /// Token usage, when the backend reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Final result of one backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Result content (final text, or the captured stream in plain-text mode)
    pub content: String,

    /// Whether the call succeeded from the backend's point of view
    pub success: bool,

    /// Error text when the backend reported a structured failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Backend-specific metadata
    #[serde(default)]
    pub metadata: ResultMetadata,
}

impl ToolCallResult {
    /// Create a successful result.
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
            error: None,
            metadata: ResultMetadata::default(),
        }
    }

    /// Create a failed result carrying an error explanation.
    pub fn failure(content: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: false,
            error: Some(error.into()),
            metadata: ResultMetadata::default(),
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: ResultMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}
