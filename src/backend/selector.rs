//! Backend selection and lifecycle ownership.
//!
//! The selector holds at most one live backend. It owns the full lifecycle
//! (construct via a factory, initialize, probe availability, tear down);
//! the engine only ever touches the [`Backend`] contract.

use std::sync::Arc;

use tracing::warn;

use crate::backend::protocol::{HttpTransport, ProtocolBackend};
use crate::backend::subprocess::SubprocessBackend;
use crate::backend::{Backend, BackendError};
use crate::config::ExecutionConfig;
use crate::domain::BackendKind;

/// Constructs backends on demand. Tests substitute their own factory.
pub trait BackendFactory: Send + Sync {
    fn create(&self, kind: BackendKind) -> Result<Arc<dyn Backend>, BackendError>;
}

/// Factory that builds the two production backends from configuration.
pub struct DefaultBackendFactory {
    config: ExecutionConfig,
}

impl DefaultBackendFactory {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }
}

impl BackendFactory for DefaultBackendFactory {
    fn create(&self, kind: BackendKind) -> Result<Arc<dyn Backend>, BackendError> {
        match kind {
            BackendKind::Subprocess => Ok(Arc::new(SubprocessBackend::new(
                self.config.subprocess.clone(),
            ))),
            BackendKind::Protocol => {
                let transport = HttpTransport::new(&self.config.protocol)?;
                Ok(Arc::new(ProtocolBackend::new(
                    transport,
                    self.config.protocol.clone(),
                )))
            }
        }
    }
}

/// Owns the single active backend instance.
pub struct BackendSelector {
    factory: Arc<dyn BackendFactory>,
    active: Option<(BackendKind, Arc<dyn Backend>)>,
}

impl BackendSelector {
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            factory,
            active: None,
        }
    }

    /// Select a backend, reusing the active one when the kind matches.
    ///
    /// Switching kinds tears down the previous backend first (teardown
    /// errors are logged, not propagated). A candidate that fails its
    /// availability probe is cleaned up and nothing is left active.
    pub async fn select(&mut self, kind: BackendKind) -> Result<Arc<dyn Backend>, BackendError> {
        if let Some((active_kind, backend)) = &self.active
            && *active_kind == kind
        {
            return Ok(backend.clone());
        }

        if let Some((old_kind, old)) = self.active.take()
            && let Err(err) = old.cleanup().await
        {
            warn!(backend = %old_kind, error = %err, "cleanup of previous backend failed");
        }

        let backend = self.factory.create(kind)?;

        if let Err(err) = backend.initialize().await {
            // cleanup is safe after a partial initialize
            if let Err(cleanup_err) = backend.cleanup().await {
                warn!(backend = %kind, error = %cleanup_err, "cleanup after failed init also failed");
            }
            return Err(err);
        }

        if !backend.is_available().await {
            if let Err(cleanup_err) = backend.cleanup().await {
                warn!(backend = %kind, error = %cleanup_err, "cleanup of unavailable backend failed");
            }
            return Err(BackendError::Unavailable(format!(
                "{} backend failed its availability probe",
                kind
            )));
        }

        self.active = Some((kind, backend.clone()));
        Ok(backend)
    }

    /// The currently active backend, if any.
    pub fn active(&self) -> Option<Arc<dyn Backend>> {
        self.active.as_ref().map(|(_, backend)| backend.clone())
    }

    /// Tear down the active backend. Errors are logged and swallowed so they
    /// never mask the run's real result; the `Option::take` makes a second
    /// call a no-op.
    pub async fn cleanup(&mut self) {
        if let Some((kind, backend)) = self.active.take()
            && let Err(err) = backend.cleanup().await
        {
            warn!(backend = %kind, error = %err, "backend cleanup failed");
        }
    }
}
