//! Iteration records, run statistics and the terminal execution result.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::call::ToolCallResult;

/// State of an execution run.
///
/// `Pending` and `Running` are the engine's pre-terminal states; everything
/// else is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created but not started
    Pending,
    /// Actively iterating
    Running,
    /// Backend declared the task done, or the iteration budget was spent
    Completed,
    /// Unrecoverable failure ended the run
    Failed,
    /// External cancellation honored at an iteration boundary
    Cancelled,
    /// Run-level timeout elapsed
    Timeout,
    /// Rate limit hit under the `raise` policy
    RateLimited,
}

impl ExecutionStatus {
    /// Whether this status ends the run.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

/// One completed iteration attempt, appended in strict ordinal order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based ordinal of the iteration
    pub iteration: u32,

    /// Whether the attempt succeeded
    pub success: bool,

    /// Wall-clock duration of the backend call in milliseconds
    pub duration_ms: u64,

    /// The backend's result payload, when the call returned one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolCallResult>,

    /// Error cause when the attempt failed without a result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IterationRecord {
    /// Record for an iteration whose backend call returned a result.
    pub fn from_result(iteration: u32, duration_ms: u64, result: ToolCallResult) -> Self {
        Self {
            iteration,
            success: result.success,
            duration_ms,
            error: result.error.clone(),
            result: Some(result),
        }
    }

    /// Record for an iteration that failed with a backend error.
    pub fn from_error(iteration: u32, duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            iteration,
            success: false,
            duration_ms,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Mutable accumulator owned by the engine for the lifetime of one run.
///
/// Single writer: the engine updates it after every iteration and nothing
/// reads it concurrently with an update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatistics {
    pub total_iterations: u32,
    pub successful_iterations: u32,
    pub failed_iterations: u32,

    /// Running average of iteration duration in milliseconds
    pub average_iteration_ms: f64,

    /// Tool invocations observed across all iterations
    pub total_tool_calls: u64,

    /// How many times a rate limit was encountered
    pub rate_limit_encounters: u32,

    /// Cumulative time spent waiting out rate limits, in milliseconds
    pub rate_limit_wait_ms: u64,

    /// Occurrence count per error category
    pub errors_by_category: BTreeMap<String, u32>,
}

impl ExecutionStatistics {
    /// Fold one iteration record into the counters.
    ///
    /// Maintains `total_iterations == successful_iterations + failed_iterations`.
    pub fn record_iteration(&mut self, record: &IterationRecord) {
        self.total_iterations += 1;
        if record.success {
            self.successful_iterations += 1;
        } else {
            self.failed_iterations += 1;
        }

        let n = self.total_iterations as f64;
        self.average_iteration_ms += (record.duration_ms as f64 - self.average_iteration_ms) / n;

        if let Some(result) = &record.result {
            self.total_tool_calls += u64::from(result.metadata.tool_calls);
        }

        debug_assert_eq!(
            self.total_iterations,
            self.successful_iterations + self.failed_iterations
        );
    }

    /// Count a failure under its error category.
    pub fn record_error_category(&mut self, category: &str) {
        *self.errors_by_category.entry(category.to_string()).or_insert(0) += 1;
    }

    /// Count one rate-limit encounter and the time spent waiting it out.
    pub fn record_rate_limit(&mut self, waited: Duration) {
        self.rate_limit_encounters += 1;
        self.rate_limit_wait_ms += waited.as_millis() as u64;
    }
}

/// Terminal value produced once the loop exits. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Final status of the run
    pub status: ExecutionStatus,

    /// Ordered iteration records
    pub iterations: Vec<IterationRecord>,

    /// Final statistics snapshot
    pub statistics: ExecutionStatistics,
}

impl ExecutionResult {
    /// Whether the run finished with `Completed`.
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    /// The last iteration's result content, if any.
    pub fn final_content(&self) -> Option<&str> {
        self.iterations
            .iter()
            .rev()
            .find_map(|record| record.result.as_ref())
            .map(|result| result.content.as_str())
    }
}
