//! Protocol backend: executes iterations against a remote service over a
//! negotiated request/response protocol.
//!
//! The transport is a trait so the backend's retry/reconnect behavior is
//! testable without a live service; [`HttpTransport`] is the production
//! implementation (session handshake on connect, JSON POST per request).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::{Backend, BackendError};
use crate::domain::{ProgressEvent, ResultMetadata, ToolCallRequest, ToolCallResult};
use crate::progress::{ProgressBus, ProgressSubscription};

/// Configuration for the protocol backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Base URL of the service
    pub endpoint: String,

    /// Connection establishment timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Transient-failure retries per call
    pub retries: u32,

    /// Base backoff between retries; grows linearly with the attempt number
    pub retry_backoff_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8787".to_string(),
            connect_timeout_ms: 10_000,
            retries: 2,
            retry_backoff_ms: 500,
        }
    }
}

/// Connection used by the protocol backend.
///
/// `connect` is called once during backend initialization (and at most once
/// more per call, to recover a dropped connection); `disconnect` during
/// cleanup.
#[async_trait]
pub trait ProtocolTransport: Send + Sync {
    async fn connect(&self) -> Result<(), BackendError>;
    async fn request(&self, payload: Value) -> Result<Value, BackendError>;
    async fn disconnect(&self) -> Result<(), BackendError>;
    async fn is_connected(&self) -> bool;
}

/// HTTP implementation of the transport: a session handshake on connect and
/// one JSON POST per request.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    session: Mutex<Option<String>>,
}

impl HttpTransport {
    pub fn new(config: &ProtocolConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms.max(1)))
            .build()
            .map_err(|err| BackendError::Protocol {
                message: format!("failed to build http client: {}", err),
                status: None,
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            session: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    fn transport_error(context: &str, err: reqwest::Error) -> BackendError {
        BackendError::Protocol {
            message: format!("{}: {}", context, err),
            status: err.status().map(|s| s.as_u16()),
        }
    }

    /// Map an HTTP response to JSON, translating provider failures into the
    /// backend error taxonomy.
    async fn into_json(response: reqwest::Response) -> Result<Value, BackendError> {
        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<i64>().ok());
            let reset_at = retry_after.map(|secs| chrono::Utc::now().timestamp() + secs);
            return Err(BackendError::RateLimited { reset_at });
        }

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(BackendError::Unrecoverable(format!(
                "service rejected credentials ({})",
                status
            )));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Protocol {
                message: format!("service returned {}: {}", status, body),
                status: Some(status.as_u16()),
            });
        }

        response
            .json()
            .await
            .map_err(|err| BackendError::MalformedOutput(format!("invalid response body: {}", err)))
    }
}

#[async_trait]
impl ProtocolTransport for HttpTransport {
    async fn connect(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url("v1/session"))
            .json(&json!({}))
            .send()
            .await
            .map_err(|err| Self::transport_error("connect failed", err))?;

        let body = Self::into_json(response).await?;
        let session_id = body
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BackendError::MalformedOutput("handshake response missing session_id".to_string())
            })?
            .to_string();

        debug!(session_id = %session_id, "protocol session established");
        *self.session.lock().await = Some(session_id);
        Ok(())
    }

    async fn request(&self, payload: Value) -> Result<Value, BackendError> {
        let session_id = self.session.lock().await.clone().ok_or_else(|| {
            BackendError::Protocol {
                message: "no active session".to_string(),
                status: None,
            }
        })?;

        let mut body = payload;
        body["session_id"] = json!(session_id);

        let response = self
            .client
            .post(self.url("v1/execute"))
            .json(&body)
            .send()
            .await
            .map_err(|err| Self::transport_error("request failed", err))?;

        Self::into_json(response).await
    }

    async fn disconnect(&self) -> Result<(), BackendError> {
        let Some(session_id) = self.session.lock().await.take() else {
            return Ok(());
        };

        self.client
            .delete(self.url(&format!("v1/session/{}", session_id)))
            .send()
            .await
            .map_err(|err| Self::transport_error("disconnect failed", err))?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }
}

/// Whether an error looks like a dropped connection rather than a service
/// response. Transport failures carry no HTTP status.
fn is_connection_error(err: &BackendError) -> bool {
    matches!(err, BackendError::Protocol { status: None, .. })
}

/// Parse a service response into a call result.
fn parse_response(value: Value) -> Result<ToolCallResult, BackendError> {
    let content = value
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::MalformedOutput("response missing content".to_string()))?
        .to_string();

    let is_error = value.get("is_error").and_then(Value::as_bool).unwrap_or(false);
    let metadata = ResultMetadata {
        structured_output: true,
        raw_output: None,
        task_complete: value.get("complete").and_then(Value::as_bool).unwrap_or(false),
        tool_calls: value.get("tool_calls").and_then(Value::as_u64).unwrap_or(0) as u32,
        usage: value
            .get("usage")
            .and_then(|u| serde_json::from_value(u.clone()).ok()),
    };

    if is_error {
        let error = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("backend reported an error")
            .to_string();
        Ok(ToolCallResult::failure(content, error).with_metadata(metadata))
    } else {
        Ok(ToolCallResult::success(content).with_metadata(metadata))
    }
}

/// Backend that reuses one transport connection across calls.
pub struct ProtocolBackend<T: ProtocolTransport> {
    transport: T,
    config: ProtocolConfig,
    bus: ProgressBus,
}

impl<T: ProtocolTransport> ProtocolBackend<T> {
    pub fn new(transport: T, config: ProtocolConfig) -> Self {
        Self {
            transport,
            config,
            bus: ProgressBus::new(),
        }
    }

    fn build_payload(&self, request: &ToolCallRequest) -> Value {
        json!({
            "instruction": request.instruction,
            "arguments": request.arguments,
            "model": request.model,
            "subagent": request.subagent,
            "working_dir": request.working_dir,
            "priority": request.priority,
        })
    }
}

#[async_trait]
impl<T: ProtocolTransport> Backend for ProtocolBackend<T> {
    async fn initialize(&self) -> Result<(), BackendError> {
        self.transport.connect().await
    }

    async fn execute(&self, request: ToolCallRequest) -> Result<ToolCallResult, BackendError> {
        let payload = self.build_payload(&request);
        let max_attempts = self.config.retries + 1;
        let mut attempt: u32 = 0;
        let mut reconnected = false;
        let mut last_err: Option<BackendError> = None;

        while attempt < max_attempts {
            attempt += 1;

            let outcome =
                tokio::time::timeout(request.timeout(), self.transport.request(payload.clone()))
                    .await;

            match outcome {
                // The configured timeout ends the call; the engine decides
                // whether the run continues.
                Err(_) => {
                    return Err(BackendError::Timeout {
                        limit_ms: request.timeout_ms,
                    });
                }
                Ok(Ok(response)) => {
                    let result = parse_response(response)?;
                    if !result.content.is_empty() {
                        self.bus.emit(ProgressEvent::thinking(result.content.clone()));
                    }
                    return Ok(result);
                }
                Ok(Err(err)) => {
                    if err.is_rate_limit() || matches!(err, BackendError::Unrecoverable(_)) {
                        return Err(err);
                    }

                    let connection_failure = is_connection_error(&err);
                    warn!(attempt, max_attempts, error = %err, "protocol call failed");
                    last_err = Some(err);

                    // At most one reconnect per call; a successful reconnect
                    // re-runs the attempt without consuming the retry budget.
                    if connection_failure && !reconnected {
                        reconnected = true;
                        match self.transport.connect().await {
                            Ok(()) => {
                                self.bus.emit(ProgressEvent::info("reconnected to service"));
                                attempt -= 1;
                                continue;
                            }
                            Err(connect_err) => {
                                warn!(error = %connect_err, "reconnect failed");
                                last_err = Some(connect_err);
                            }
                        }
                    }
                }
            }

            if attempt < max_attempts {
                let backoff =
                    Duration::from_millis(self.config.retry_backoff_ms * u64::from(attempt));
                self.bus.emit(ProgressEvent::info(format!(
                    "retrying in {}ms (attempt {}/{})",
                    backoff.as_millis(),
                    attempt + 1,
                    max_attempts
                )));
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_err.unwrap_or_else(|| BackendError::Protocol {
            message: "retries exhausted".to_string(),
            status: None,
        }))
    }

    async fn cleanup(&self) -> Result<(), BackendError> {
        self.transport.disconnect().await
    }

    async fn is_available(&self) -> bool {
        self.transport.is_connected().await
    }

    fn on_progress(&self) -> ProgressSubscription {
        self.bus.subscribe()
    }
}

impl<T: ProtocolTransport> std::fmt::Debug for ProtocolBackend<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolBackend")
            .field("endpoint", &self.config.endpoint)
            .field("retries", &self.config.retries)
            .finish()
    }
}
