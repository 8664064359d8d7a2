//! Error types for agentloop
//!
//! Centralized error handling using thiserror. Backend-level failures have
//! their own taxonomy in [`crate::backend::BackendError`]; this type is the
//! crate-wide umbrella.

use thiserror::Error;

use crate::backend::BackendError;

/// All error types that can occur in agentloop
#[derive(Debug, Error)]
pub enum AgentLoopError {
    /// Backend selection or execution error that escaped the iteration loop
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Invalid configuration or request
    #[error("Config error: {0}")]
    Config(String),

    /// Session recorder error
    #[error("Session error: {0}")]
    Session(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for agentloop operations
pub type Result<T> = std::result::Result<T, AgentLoopError>;
