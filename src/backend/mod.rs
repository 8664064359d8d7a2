//! Backend abstraction: the contract every execution backend implements,
//! its error taxonomy, and the concrete subprocess/protocol backends.

pub mod protocol;
pub mod selector;
pub mod subprocess;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ToolCallRequest, ToolCallResult};
use crate::progress::ProgressSubscription;

pub use protocol::{HttpTransport, ProtocolBackend, ProtocolConfig, ProtocolTransport};
pub use selector::{BackendFactory, BackendSelector, DefaultBackendFactory};
pub use subprocess::{SubprocessBackend, SubprocessConfig};

/// Errors a backend can produce during selection or execution
#[derive(Debug, Error)]
pub enum BackendError {
    /// Backend cannot serve requests (selection-time)
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The per-call timeout elapsed
    #[error("call timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    /// A provider rate limit was detected; reset time in epoch seconds if known
    #[error("rate limited (reset_at: {reset_at:?})")]
    RateLimited { reset_at: Option<i64> },

    /// Transport-level protocol failure
    #[error("protocol error: {message}")]
    Protocol {
        message: String,
        /// HTTP status when the failure came from a response; `None` for
        /// connection-level failures
        status: Option<u16>,
    },

    /// Output could not be interpreted as the expected shape
    #[error("malformed output: {0}")]
    MalformedOutput(String),

    /// The child process exited with a failure and no structured error record
    #[error("process exited with code {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    /// Explicit fatal signal, e.g. authentication failure
    #[error("unrecoverable backend failure: {0}")]
    Unrecoverable(String),

    /// The backend process could not be spawned
    #[error("failed to spawn backend process: {0}")]
    Spawn(#[from] std::io::Error),
}

impl BackendError {
    /// Whether this error is a rate-limit signal.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, BackendError::RateLimited { .. })
    }

    /// Whether the engine may keep iterating after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            BackendError::Timeout { .. } => true,
            BackendError::RateLimited { .. } => true,
            BackendError::Protocol { .. } => true,
            BackendError::MalformedOutput(_) => true,
            BackendError::Exited { .. } => true,
            BackendError::Unavailable(_) => false,
            BackendError::Unrecoverable(_) => false,
            BackendError::Spawn(_) => false,
        }
    }

    /// Stable category name for statistics.
    pub fn category(&self) -> &'static str {
        match self {
            BackendError::Unavailable(_) => "unavailable",
            BackendError::Timeout { .. } => "timeout",
            BackendError::RateLimited { .. } => "rate_limited",
            BackendError::Protocol { .. } => "protocol",
            BackendError::MalformedOutput(_) => "malformed_output",
            BackendError::Exited { .. } => "exited",
            BackendError::Unrecoverable(_) => "unrecoverable",
            BackendError::Spawn(_) => "spawn",
        }
    }
}

/// How the engine should react to a per-iteration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Count the failure and continue to the next iteration
    Recoverable,
    /// End the run with status `failed`
    Unrecoverable,
    /// Hand off to the rate-limit state machine
    RateLimit,
}

/// Pluggable classification of backend errors.
///
/// The default derives severity from the error taxonomy; callers with
/// backend-specific knowledge can substitute their own rule.
pub type ErrorClassifier = Arc<dyn Fn(&BackendError) -> Severity + Send + Sync>;

/// The default classifier: taxonomy-driven, no string sniffing.
pub fn default_classifier() -> ErrorClassifier {
    Arc::new(|err| {
        if err.is_rate_limit() {
            Severity::RateLimit
        } else if err.is_recoverable() {
            Severity::Recoverable
        } else {
            Severity::Unrecoverable
        }
    })
}

/// Contract implemented by every execution backend.
///
/// Lifecycle: `initialize` once, `execute` per iteration, `cleanup` once.
/// `cleanup` must be safe to call even if `initialize` partially failed, and
/// `is_available` must not mutate state.
#[async_trait]
pub trait Backend: Send + Sync {
    /// One-time setup (process discovery, connection handshake).
    async fn initialize(&self) -> Result<(), BackendError>;

    /// Run exactly one unit of work.
    async fn execute(&self, request: ToolCallRequest) -> Result<ToolCallResult, BackendError>;

    /// Release resources. Idempotent.
    async fn cleanup(&self) -> Result<(), BackendError>;

    /// Cheap health probe without mutating state.
    async fn is_available(&self) -> bool;

    /// Register a progress listener. Multiple concurrent subscribers are
    /// supported; dropping the subscription unsubscribes.
    fn on_progress(&self) -> ProgressSubscription;
}
