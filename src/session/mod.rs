//! Session recorder collaborator interface.
//!
//! The engine notifies a recorder about history entries, tool calls and run
//! completion. Notifications are fire-and-forget: the engine invokes them
//! inline and never awaits persistence, so implementations must not block.

pub mod jsonl;

pub use jsonl::JsonlSessionRecorder;

use crate::domain::ExecutionResult;

/// Side-effecting run/history notifications.
pub trait SessionRecorder: Send + Sync {
    /// Append a free-form history entry.
    fn add_history_entry(&self, entry: &str);

    /// Record one backend call's timing and outcome.
    fn record_tool_call(&self, name: &str, duration_ms: u64, success: bool);

    /// Record the terminal result of a run.
    fn complete_session(&self, result: &ExecutionResult);
}

/// Recorder that drops every notification. Useful in tests and when history
/// is disabled.
pub struct NullSessionRecorder;

impl SessionRecorder for NullSessionRecorder {
    fn add_history_entry(&self, _entry: &str) {}

    fn record_tool_call(&self, _name: &str, _duration_ms: u64, _success: bool) {}

    fn complete_session(&self, _result: &ExecutionResult) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionStatistics, ExecutionStatus};

    #[test]
    fn test_null_recorder_accepts_everything() {
        let recorder = NullSessionRecorder;
        recorder.add_history_entry("iteration 1 started");
        recorder.record_tool_call("execute", 120, true);
        recorder.complete_session(&ExecutionResult {
            status: ExecutionStatus::Completed,
            iterations: Vec::new(),
            statistics: ExecutionStatistics::default(),
        });
    }

    #[test]
    fn test_recorder_is_object_safe() {
        let recorder: Box<dyn SessionRecorder> = Box::new(NullSessionRecorder);
        recorder.add_history_entry("via trait object");
    }
}
