//! Execution request types

use crate::config::SandboxConfig;
use crate::{Result, StockadeError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Callback receiving every output line as it arrives: `(line, is_stderr)`
pub type StreamConsumer = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Best-effort resource ceilings applied to the child process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Address space ceiling in bytes (RLIMIT_AS)
    pub max_address_space_bytes: Option<u64>,
    /// CPU time ceiling in seconds (RLIMIT_CPU)
    pub max_cpu_seconds: Option<u64>,
    /// Largest file the child may write, in bytes (RLIMIT_FSIZE)
    pub max_file_size_bytes: Option<u64>,
}

/// Isolation strength a caller requires
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Bare child process on this host
    #[default]
    Process,
    /// Disposable, network-disabled container
    Container,
}

/// A single piece of untrusted code to run
#[derive(Clone)]
pub struct ExecutionRequest {
    /// Script body
    pub code: String,
    /// Wall-clock ceiling
    pub timeout: Duration,
    pub resource_limits: ResourceLimits,
    /// Top-level modules the code may import
    pub import_allowlist: BTreeSet<String>,
    /// Child working directory; the scratch directory when unset
    pub working_directory: Option<PathBuf>,
    /// Merged over the inherited environment
    pub environment: BTreeMap<String, String>,
    pub stream_consumer: Option<StreamConsumer>,
    pub isolation: Isolation,
}

impl fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("code_len", &self.code.len())
            .field("timeout", &self.timeout)
            .field("resource_limits", &self.resource_limits)
            .field("import_allowlist", &self.import_allowlist)
            .field("working_directory", &self.working_directory)
            .field("environment", &self.environment.keys().collect::<Vec<_>>())
            .field("stream_consumer", &self.stream_consumer.is_some())
            .field("isolation", &self.isolation)
            .finish()
    }
}

impl ExecutionRequest {
    /// Request with a 10 second timeout, no limits and an empty allowlist
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            timeout: Duration::from_secs(10),
            resource_limits: ResourceLimits::default(),
            import_allowlist: BTreeSet::new(),
            working_directory: None,
            environment: BTreeMap::new(),
            stream_consumer: None,
            isolation: Isolation::Process,
        }
    }

    #[must_use]
    pub fn builder(code: impl Into<String>) -> ExecutionRequestBuilder {
        ExecutionRequestBuilder {
            request: Self::new(code),
        }
    }

    /// Builder seeded with a config's default timeout, limits and allowlist
    #[must_use]
    pub fn from_config(code: impl Into<String>, config: &SandboxConfig) -> ExecutionRequestBuilder {
        let mut builder = Self::builder(code)
            .timeout(config.default_timeout())
            .limits(config.default_limits);
        for module in &config.default_allowlist {
            builder = builder.allow(module.clone());
        }
        builder
    }

    /// Check the request before anything is spawned
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(StockadeError::invalid("timeout must be greater than zero"));
        }

        for module in &self.import_allowlist {
            if !is_module_name(module) {
                return Err(StockadeError::invalid(format!(
                    "allowlist entry {module:?} is not a module name"
                )));
            }
        }

        for (key, value) in &self.environment {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(StockadeError::invalid(format!(
                    "environment key {key:?} is not valid"
                )));
            }
            if value.contains('\0') {
                return Err(StockadeError::invalid(format!(
                    "environment value for {key} contains a NUL byte"
                )));
            }
        }

        if let Some(dir) = &self.working_directory {
            if !dir.is_dir() {
                return Err(StockadeError::invalid(format!(
                    "working directory {} does not exist",
                    dir.display()
                )));
            }
        }

        let limits = &self.resource_limits;
        if [
            limits.max_address_space_bytes,
            limits.max_cpu_seconds,
            limits.max_file_size_bytes,
        ]
        .contains(&Some(0))
        {
            return Err(StockadeError::invalid("resource limits must be non-zero"));
        }

        Ok(())
    }

    /// Forward a line to the consumer, swallowing any panic it raises
    pub(crate) fn emit(&self, line: &str, is_stderr: bool) {
        if let Some(consumer) = &self.stream_consumer {
            emit_to(consumer, line, is_stderr);
        }
    }
}

pub(crate) fn emit_to(consumer: &StreamConsumer, line: &str, is_stderr: bool) {
    let call = std::panic::AssertUnwindSafe(|| consumer(line, is_stderr));
    if std::panic::catch_unwind(call).is_err() {
        tracing::debug!("stream consumer panicked, line dropped");
    }
}

/// `pkg` or `pkg.sub.mod`, each part a Python identifier
fn is_module_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c == '_' || c.is_alphabetic())
                && chars.all(|c| c == '_' || c.is_alphanumeric())
        })
}

/// Builder for ExecutionRequest
#[derive(Debug)]
pub struct ExecutionRequestBuilder {
    request: ExecutionRequest,
}

impl ExecutionRequestBuilder {
    #[must_use]
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.request.timeout = duration;
        self
    }

    #[must_use]
    pub fn timeout_secs(self, secs: u64) -> Self {
        self.timeout(Duration::from_secs(secs))
    }

    #[must_use]
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.request.resource_limits = limits;
        self
    }

    #[must_use]
    pub fn memory_limit_mb(mut self, mb: u64) -> Self {
        self.request.resource_limits.max_address_space_bytes =
            Some(mb.saturating_mul(1024 * 1024));
        self
    }

    #[must_use]
    pub fn cpu_limit_secs(mut self, secs: u64) -> Self {
        self.request.resource_limits.max_cpu_seconds = Some(secs);
        self
    }

    #[must_use]
    pub fn file_size_limit(mut self, bytes: u64) -> Self {
        self.request.resource_limits.max_file_size_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub fn allow(mut self, module: impl Into<String>) -> Self {
        self.request.import_allowlist.insert(module.into());
        self
    }

    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.request.working_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.environment.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn stream_consumer<F>(mut self, consumer: F) -> Self
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.request.stream_consumer = Some(Arc::new(consumer));
        self
    }

    #[must_use]
    pub fn isolation(mut self, isolation: Isolation) -> Self {
        self.request.isolation = isolation;
        self
    }

    #[must_use]
    pub fn build(self) -> ExecutionRequest {
        self.request
    }
}
