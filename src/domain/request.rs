//! Execution request types
//!
//! An [`ExecutionRequest`] is the immutable description of one run: what to
//! do, which backend does it, and how many iterations it may take.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::id::generate_execution_id;

/// Which concrete backend executes iterations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Spawn a local executable per iteration
    Subprocess,
    /// Send requests to a remote service over a negotiated protocol
    Protocol,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Subprocess => write!(f, "subprocess"),
            BackendKind::Protocol => write!(f, "protocol"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "subprocess" => Ok(BackendKind::Subprocess),
            "protocol" => Ok(BackendKind::Protocol),
            other => Err(format!("unknown backend kind: {}", other)),
        }
    }
}

/// Iteration budget for a run.
///
/// Serialized as an optional count: a number bounds the run, `null`/absent
/// means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<u32>", into = "Option<u32>")]
pub enum IterationLimit {
    /// At most this many iterations (must be > 0)
    Bounded(u32),
    /// Loop until completion, cancellation or an unrecoverable error
    Unlimited,
}

impl From<Option<u32>> for IterationLimit {
    fn from(value: Option<u32>) -> Self {
        match value {
            Some(n) => IterationLimit::Bounded(n),
            None => IterationLimit::Unlimited,
        }
    }
}

impl From<IterationLimit> for Option<u32> {
    fn from(value: IterationLimit) -> Self {
        match value {
            IterationLimit::Bounded(n) => Some(n),
            IterationLimit::Unlimited => None,
        }
    }
}

impl IterationLimit {
    /// Whether `completed` iterations exhaust this budget.
    pub fn is_reached(&self, completed: u32) -> bool {
        match self {
            IterationLimit::Bounded(cap) => completed >= *cap,
            IterationLimit::Unlimited => false,
        }
    }

    /// Remaining budget, if bounded.
    pub fn remaining(&self, completed: u32) -> Option<u32> {
        match self {
            IterationLimit::Bounded(cap) => Some(cap.saturating_sub(completed)),
            IterationLimit::Unlimited => None,
        }
    }
}

impl fmt::Display for IterationLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IterationLimit::Bounded(n) => write!(f, "{}", n),
            IterationLimit::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// Immutable description of one execution run.
///
/// Created once by the caller and never mutated; the engine reads it per
/// iteration to build backend calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Unique run identifier ("exec-{ts}-{hex}")
    pub id: String,

    /// Instruction handed to the backend each iteration
    pub instruction: String,

    /// Which backend executes the work
    pub backend: BackendKind,

    /// Optional named subagent the backend should delegate to
    pub subagent: Option<String>,

    /// Working directory for backend calls
    pub working_dir: PathBuf,

    /// Iteration budget
    pub limit: IterationLimit,

    /// Optional model hint passed through to the backend
    pub model: Option<String>,
}

impl ExecutionRequest {
    /// Create a request with defaults: subprocess backend, current directory,
    /// a 10-iteration budget.
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            id: generate_execution_id(),
            instruction: instruction.into(),
            backend: BackendKind::Subprocess,
            subagent: None,
            working_dir: PathBuf::from("."),
            limit: IterationLimit::Bounded(10),
            model: None,
        }
    }

    /// Select the backend kind.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Set the iteration budget.
    pub fn with_limit(mut self, limit: IterationLimit) -> Self {
        self.limit = limit;
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
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

    /// Validate the request before running it.
    pub fn validate(&self) -> Result<(), String> {
        if self.instruction.trim().is_empty() {
            return Err("instruction cannot be empty".to_string());
        }
        if self.limit == IterationLimit::Bounded(0) {
            return Err("iteration cap must be > 0".to_string());
        }
        Ok(())
    }
}
