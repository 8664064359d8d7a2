//! The execution engine: drives the iteration loop against the selected
//! backend.
//!
//! Each iteration: emit `iteration_start`, invoke the backend, fold the
//! outcome into the statistics, emit `iteration_complete`. Per-iteration
//! errors are converted into records and never escape the loop; only
//! selection failures propagate to the caller. Backend teardown runs on
//! every exit path, exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BackendError, BackendFactory, BackendSelector, DefaultBackendFactory, ErrorClassifier,
    Severity, default_classifier,
};
use crate::config::ExecutionConfig;
use crate::domain::{
    ExecutionRequest, ExecutionResult, ExecutionStatistics, ExecutionStatus, IterationRecord,
    ProgressEvent, ToolCallRequest, ToolCallResult,
};
use crate::engine::rate_limit::{RateLimitPolicy, RateLimitState};
use crate::error::{AgentLoopError, Result};
use crate::progress::{ProgressBus, ProgressSubscription};
use crate::session::SessionRecorder;

/// Handle for requesting cancellation of a running engine.
///
/// Cancellation is honored at the next iteration boundary; the in-flight
/// call is allowed to finish or time out first.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// The iteration scheduler. One engine instance drives one request at a time.
pub struct ExecutionEngine {
    selector: Mutex<BackendSelector>,
    recorder: Arc<dyn SessionRecorder>,
    config: ExecutionConfig,
    classifier: ErrorClassifier,
    bus: ProgressBus,
    cancel: CancelHandle,
}

impl ExecutionEngine {
    /// Create an engine wired to the production backends.
    pub fn new(config: ExecutionConfig, recorder: Arc<dyn SessionRecorder>) -> Self {
        let factory = Arc::new(DefaultBackendFactory::new(config.clone()));
        Self::with_factory(config, recorder, factory)
    }

    /// Create an engine with a custom backend factory.
    pub fn with_factory(
        config: ExecutionConfig,
        recorder: Arc<dyn SessionRecorder>,
        factory: Arc<dyn BackendFactory>,
    ) -> Self {
        Self {
            selector: Mutex::new(BackendSelector::new(factory)),
            recorder,
            config,
            classifier: default_classifier(),
            bus: ProgressBus::new(),
            cancel: CancelHandle::default(),
        }
    }

    /// Substitute the error-severity classification rule.
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Handle external subscribers use to request cancellation.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Subscribe to the merged progress stream (engine lifecycle events plus
    /// forwarded backend events).
    pub fn on_progress(&self) -> ProgressSubscription {
        self.bus.subscribe()
    }

    /// Run the request to a terminal status.
    pub async fn run(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        request.validate().map_err(AgentLoopError::Config)?;

        let backend = {
            let mut selector = self.selector.lock().await;
            selector.select(request.backend).await?
        };

        // Forward backend events into the engine stream in production order.
        let mut backend_events = backend.on_progress();
        let bus = self.bus.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = backend_events.recv().await {
                bus.emit(event);
            }
        });

        info!(request_id = %request.id, backend = %request.backend, limit = %request.limit, "execution started");
        self.recorder
            .add_history_entry(&format!("run {} started ({})", request.id, request.backend));

        let (status, iterations, statistics) = self.run_loop(&backend, &request).await;

        // Teardown happens on every exit path, before the result is built.
        {
            let mut selector = self.selector.lock().await;
            selector.cleanup().await;
        }

        // Let the forwarder drain whatever the backend emitted.
        drop(backend);
        let _ = forwarder.await;

        let result = ExecutionResult {
            status,
            iterations,
            statistics,
        };

        info!(request_id = %request.id, status = ?result.status, iterations = result.iterations.len(), "execution finished");
        self.recorder.complete_session(&result);
        Ok(result)
    }

    async fn run_loop(
        &self,
        backend: &Arc<dyn Backend>,
        request: &ExecutionRequest,
    ) -> (ExecutionStatus, Vec<IterationRecord>, ExecutionStatistics) {
        let mut statistics = ExecutionStatistics::default();
        let mut records: Vec<IterationRecord> = Vec::new();
        let mut rate_limit = RateLimitState::new();
        let mut completed: u32 = 0;
        let run_started = Instant::now();

        let status = loop {
            if self.cancel.is_cancelled() {
                debug!("cancellation honored at iteration boundary");
                break ExecutionStatus::Cancelled;
            }

            if let Some(limit_ms) = self.config.run_timeout_ms
                && run_started.elapsed() >= Duration::from_millis(limit_ms)
            {
                warn!(run_timeout_ms = limit_ms, "run timeout elapsed");
                break ExecutionStatus::Timeout;
            }

            if request.limit.is_reached(completed) {
                // The cap was spent as a step budget.
                break ExecutionStatus::Completed;
            }

            let ordinal = completed + 1;
            self.bus.emit(ProgressEvent::iteration_start(ordinal));
            self.recorder
                .add_history_entry(&format!("iteration {} started", ordinal));

            let mut call = ToolCallRequest::new(
                &request.instruction,
                &request.working_dir,
                self.config.call_timeout_ms,
            );
            if let Some(model) = &request.model {
                call = call.with_model(model.clone());
            }
            if let Some(subagent) = &request.subagent {
                call = call.with_subagent(subagent.clone());
            }

            let started = Instant::now();
            match backend.execute(call).await {
                Ok(result) => {
                    rate_limit.clear();
                    let duration_ms = started.elapsed().as_millis() as u64;
                    self.recorder.record_tool_call("execute", duration_ms, result.success);

                    let task_complete = result.success && self.is_task_complete(&result);
                    let record = IterationRecord::from_result(ordinal, duration_ms, result);
                    statistics.record_iteration(&record);
                    if !record.success {
                        statistics.record_error_category("result_error");
                    }
                    self.bus
                        .emit(ProgressEvent::iteration_complete(ordinal, record.success, duration_ms));
                    records.push(record);
                    completed += 1;

                    if task_complete {
                        break ExecutionStatus::Completed;
                    }
                }
                Err(err) => match (self.classifier)(&err) {
                    Severity::RateLimit => {
                        let reset_at = match &err {
                            BackendError::RateLimited { reset_at } => *reset_at,
                            _ => None,
                        };
                        self.bus.emit(ProgressEvent::rate_limit(reset_at));

                        match self.config.rate_limit_policy {
                            RateLimitPolicy::Raise => {
                                statistics.record_rate_limit(Duration::ZERO);
                                break ExecutionStatus::RateLimited;
                            }
                            RateLimitPolicy::Wait => {
                                let wait = rate_limit.record_hit(
                                    reset_at,
                                    Duration::from_millis(self.config.rate_limit_backoff_ms),
                                );
                                statistics.record_rate_limit(wait);
                                tokio::time::sleep(wait).await;
                                // The suspended attempt consumed no budget;
                                // the same ordinal runs again. The hit counter
                                // survives so repeated limits escalate.
                            }
                        }
                    }
                    severity => {
                        let duration_ms = started.elapsed().as_millis() as u64;
                        self.recorder.record_tool_call("execute", duration_ms, false);

                        let record = IterationRecord::from_error(ordinal, duration_ms, err.to_string());
                        statistics.record_iteration(&record);
                        statistics.record_error_category(err.category());
                        self.bus.emit(ProgressEvent::error(err.to_string()));
                        self.bus
                            .emit(ProgressEvent::iteration_complete(ordinal, false, duration_ms));
                        records.push(record);
                        completed += 1;

                        if severity == Severity::Unrecoverable {
                            break ExecutionStatus::Failed;
                        }
                    }
                },
            }
        };

        (status, records, statistics)
    }

    /// Whether a successful result ends the run early.
    fn is_task_complete(&self, result: &ToolCallResult) -> bool {
        result.metadata.task_complete
            || self
                .config
                .completion_marker
                .as_ref()
                .is_some_and(|marker| result.content.contains(marker))
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("policy", &self.config.rate_limit_policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use crate::domain::{BackendKind, IterationLimit, ResultMetadata};
    use crate::session::NullSessionRecorder;

    type Scripted = VecDeque<std::result::Result<ToolCallResult, BackendError>>;

    struct MockBackend {
        script: StdMutex<Scripted>,
        cleanups: Arc<AtomicU32>,
        bus: ProgressBus,
        cancel_on_first_call: Option<CancelHandle>,
    }

    #[async_trait]
    impl Backend for MockBackend {
        async fn initialize(&self) -> std::result::Result<(), BackendError> {
            Ok(())
        }

        async fn execute(
            &self,
            _request: ToolCallRequest,
        ) -> std::result::Result<ToolCallResult, BackendError> {
            if let Some(handle) = &self.cancel_on_first_call {
                handle.cancel();
            }
            self.bus.emit(ProgressEvent::thinking("working"));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ToolCallResult::success("default")))
        }

        async fn cleanup(&self) -> std::result::Result<(), BackendError> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn on_progress(&self) -> ProgressSubscription {
            self.bus.subscribe()
        }
    }

    struct MockFactory {
        script: StdMutex<Option<Scripted>>,
        cleanups: Arc<AtomicU32>,
        cancel_on_first_call: StdMutex<Option<CancelHandle>>,
    }

    impl MockFactory {
        fn new(script: Vec<std::result::Result<ToolCallResult, BackendError>>) -> (Arc<Self>, Arc<AtomicU32>) {
            let cleanups = Arc::new(AtomicU32::new(0));
            let factory = Arc::new(Self {
                script: StdMutex::new(Some(script.into())),
                cleanups: cleanups.clone(),
                cancel_on_first_call: StdMutex::new(None),
            });
            (factory, cleanups)
        }
    }

    impl BackendFactory for MockFactory {
        fn create(
            &self,
            _kind: BackendKind,
        ) -> std::result::Result<Arc<dyn Backend>, BackendError> {
            let script = self.script.lock().unwrap().take().unwrap_or_default();
            Ok(Arc::new(MockBackend {
                script: StdMutex::new(script),
                cleanups: self.cleanups.clone(),
                bus: ProgressBus::new(),
                cancel_on_first_call: self.cancel_on_first_call.lock().unwrap().take(),
            }))
        }
    }

    fn engine_with(
        script: Vec<std::result::Result<ToolCallResult, BackendError>>,
        config: ExecutionConfig,
    ) -> (ExecutionEngine, Arc<AtomicU32>) {
        let (factory, cleanups) = MockFactory::new(script);
        let engine = ExecutionEngine::with_factory(config, Arc::new(NullSessionRecorder), factory);
        (engine, cleanups)
    }

    fn completing_result() -> ToolCallResult {
        ToolCallResult::success("all done").with_metadata(ResultMetadata {
            task_complete: true,
            ..ResultMetadata::default()
        })
    }

    fn test_config() -> ExecutionConfig {
        ExecutionConfig {
            call_timeout_ms: 5_000,
            rate_limit_backoff_ms: 10,
            ..ExecutionConfig::default()
        }
    }

    fn request(limit: IterationLimit) -> ExecutionRequest {
        ExecutionRequest::new("do the thing").with_limit(limit)
    }

    #[tokio::test]
    async fn test_early_completion_stops_before_cap() {
        let (engine, _) = engine_with(
            vec![
                Ok(ToolCallResult::success("step one")),
                Ok(completing_result()),
            ],
            test_config(),
        );

        let result = engine.run(request(IterationLimit::Bounded(10))).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.iterations.len(), 2);
    }

    #[tokio::test]
    async fn test_cap_exhaustion_completes_with_exactly_n_records() {
        let (engine, _) = engine_with(Vec::new(), test_config());

        let result = engine.run(request(IterationLimit::Bounded(3))).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.iterations.len(), 3);
        assert_eq!(result.statistics.total_iterations, 3);
    }

    #[tokio::test]
    async fn test_recoverable_errors_count_and_continue() {
        let (engine, _) = engine_with(
            vec![
                Err(BackendError::Timeout { limit_ms: 5_000 }),
                Ok(completing_result()),
            ],
            test_config(),
        );

        let result = engine.run(request(IterationLimit::Bounded(5))).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.iterations.len(), 2);
        assert!(!result.iterations[0].success);
        assert_eq!(result.statistics.failed_iterations, 1);
        assert_eq!(result.statistics.errors_by_category.get("timeout"), Some(&1));
    }

    #[tokio::test]
    async fn test_unrecoverable_error_fails_the_run() {
        let (engine, _) = engine_with(
            vec![Err(BackendError::Unrecoverable("auth failure".to_string()))],
            test_config(),
        );

        let result = engine.run(request(IterationLimit::Bounded(5))).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.iterations.len(), 1);
        assert_eq!(
            result.statistics.errors_by_category.get("unrecoverable"),
            Some(&1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_wait_policy_does_not_consume_budget() {
        let config = ExecutionConfig {
            rate_limit_policy: RateLimitPolicy::Wait,
            rate_limit_backoff_ms: 10,
            ..test_config()
        };
        let (engine, _) = engine_with(
            vec![
                Err(BackendError::RateLimited { reset_at: None }),
                Ok(completing_result()),
            ],
            config,
        );

        let result = engine.run(request(IterationLimit::Bounded(1))).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        // The suspended attempt produced no record; the retried ordinal did.
        assert_eq!(result.iterations.len(), 1);
        assert_eq!(result.iterations[0].iteration, 1);
        assert_eq!(result.statistics.rate_limit_encounters, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_raise_policy_ends_run_immediately() {
        let config = ExecutionConfig {
            rate_limit_policy: RateLimitPolicy::Raise,
            ..test_config()
        };
        let (engine, _) = engine_with(
            vec![Err(BackendError::RateLimited { reset_at: Some(1) })],
            config,
        );

        let result = engine.run(request(IterationLimit::Bounded(5))).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::RateLimited);
        assert!(result.iterations.is_empty());
        assert_eq!(result.statistics.rate_limit_encounters, 1);
    }

    #[tokio::test]
    async fn test_cancellation_honored_at_iteration_boundary() {
        let (factory, _) = MockFactory::new(Vec::new());
        let engine = ExecutionEngine::with_factory(
            test_config(),
            Arc::new(NullSessionRecorder),
            factory.clone(),
        );
        *factory.cancel_on_first_call.lock().unwrap() = Some(engine.cancel_handle());

        let result = engine.run(request(IterationLimit::Bounded(100))).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        // The in-flight iteration finished before cancellation took effect.
        assert_eq!(result.iterations.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_runs_once_on_every_exit_path() {
        // success
        let (engine, cleanups) = engine_with(vec![Ok(completing_result())], test_config());
        engine.run(request(IterationLimit::Bounded(5))).await.unwrap();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        // failure
        let (engine, cleanups) = engine_with(
            vec![Err(BackendError::Unrecoverable("fatal".to_string()))],
            test_config(),
        );
        engine.run(request(IterationLimit::Bounded(5))).await.unwrap();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        // rate-limited abort
        let config = ExecutionConfig {
            rate_limit_policy: RateLimitPolicy::Raise,
            ..test_config()
        };
        let (engine, cleanups) =
            engine_with(vec![Err(BackendError::RateLimited { reset_at: None })], config);
        engine.run(request(IterationLimit::Bounded(5))).await.unwrap();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let (engine, _) = engine_with(Vec::new(), test_config());
        let err = engine
            .run(request(IterationLimit::Bounded(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentLoopError::Config(_)));
    }

    #[tokio::test]
    async fn test_completion_marker_in_content() {
        let config = ExecutionConfig {
            completion_marker: Some("DONE!".to_string()),
            ..test_config()
        };
        let (engine, _) = engine_with(
            vec![Ok(ToolCallResult::success("everything is DONE! now"))],
            config,
        );

        let result = engine.run(request(IterationLimit::Bounded(10))).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.iterations.len(), 1);
    }

    #[tokio::test]
    async fn test_progress_stream_carries_lifecycle_and_backend_events() {
        let (engine, _) = engine_with(vec![Ok(completing_result())], test_config());
        let mut sub = engine.on_progress();

        engine.run(request(IterationLimit::Bounded(1))).await.unwrap();

        let kinds: Vec<&str> = sub.drain().iter().map(|e| e.kind()).collect();
        assert!(kinds.contains(&"iteration_start"));
        assert!(kinds.contains(&"thinking"));
        assert!(kinds.contains(&"iteration_complete"));
    }

    #[tokio::test]
    async fn test_custom_classifier_changes_loop_behavior() {
        // Treat timeouts as fatal.
        let classifier: ErrorClassifier = Arc::new(|err| match err {
            BackendError::Timeout { .. } => Severity::Unrecoverable,
            other if other.is_rate_limit() => Severity::RateLimit,
            _ => Severity::Recoverable,
        });
        let (factory, _) = MockFactory::new(vec![Err(BackendError::Timeout { limit_ms: 1 })]);
        let engine =
            ExecutionEngine::with_factory(test_config(), Arc::new(NullSessionRecorder), factory)
                .with_classifier(classifier);

        let result = engine.run(request(IterationLimit::Bounded(5))).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.iterations.len(), 1);
    }
}
