//! Sandbox facade: validate, select a backend, execute

use crate::backend::{Backend, BackendSelector};
use crate::config::{self, SandboxConfig};
use crate::isolation::Capabilities;
use crate::request::{ExecutionRequest, ExecutionRequestBuilder, Isolation};
use crate::result::ExecutionResult;
use crate::Result;
use once_cell::sync::OnceCell;
use std::sync::Arc;

static DEFAULT_SANDBOX: OnceCell<Sandbox> = OnceCell::new();

/// Entry point for running untrusted code.
///
/// Holds no per-execution state: one `Sandbox` can serve concurrent
/// `execute` calls from any number of threads.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: Arc<SandboxConfig>,
    backends: Arc<BackendSelector>,
}

impl Sandbox {
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        let config = Arc::new(config);
        Self {
            backends: Arc::new(BackendSelector::new(Arc::clone(&config))),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Request builder seeded with this sandbox's defaults
    #[must_use]
    pub fn request(&self, code: impl Into<String>) -> ExecutionRequestBuilder {
        ExecutionRequest::from_config(code, &self.config)
    }

    #[must_use]
    pub fn backend(&self, isolation: Isolation) -> &dyn Backend {
        self.backends.select(isolation)
    }

    /// Capability report for one backend
    #[must_use]
    pub fn probe(&self, isolation: Isolation) -> Capabilities {
        self.backend(isolation).probe()
    }

    /// Run one request to completion.
    ///
    /// Returns `Err` only for a malformed request; every outcome of running
    /// the code, including machinery failures, is an [`ExecutionResult`].
    pub fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        request.validate()?;
        tracing::debug!(
            backend = ?request.isolation,
            code_len = request.code.len(),
            timeout_ms = request.timeout.as_millis() as u64,
            "executing request"
        );
        Ok(self.backend(request.isolation).execute(request))
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

/// Execute with a sandbox built from the process-wide config
pub fn execute(request: &ExecutionRequest) -> Result<ExecutionResult> {
    DEFAULT_SANDBOX
        .get_or_init(|| Sandbox::new(config::global().clone()))
        .execute(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StockadeError;
    use std::time::Duration;

    #[test]
    fn invalid_request_is_err_and_spawns_nothing() {
        let config = SandboxConfig::builder()
            .python_path("/nonexistent/python-for-stockade")
            .build();
        let sandbox = Sandbox::new(config);
        let request = ExecutionRequest::builder("print(1)")
            .timeout(Duration::ZERO)
            .build();

        assert!(matches!(
            sandbox.execute(&request),
            Err(StockadeError::InvalidRequest(_))
        ));
    }

    #[test]
    fn process_wide_execute_validates_first() {
        let request = ExecutionRequest::builder("print(1)").env("", "x").build();
        assert!(matches!(
            execute(&request),
            Err(StockadeError::InvalidRequest(_))
        ));
    }

    #[test]
    fn request_builder_uses_sandbox_defaults() {
        let sandbox = Sandbox::new(SandboxConfig::builder().timeout_secs(3).build());
        let request = sandbox.request("pass").build();
        assert_eq!(request.timeout, Duration::from_secs(3));
        assert!(request.import_allowlist.contains("math"));
    }

    #[test]
    fn backend_follows_declared_isolation() {
        let sandbox = Sandbox::default();
        assert_eq!(sandbox.backend(Isolation::Container).kind(), Isolation::Container);
    }
}
