//! Sandbox configuration

use crate::request::ResourceLimits;
use crate::{Result, StockadeError};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Modules user code may import when nothing else is configured.
pub const DEFAULT_ALLOWLIST: &[&str] = &["math", "random", "statistics"];

static GLOBAL: OnceCell<SandboxConfig> = OnceCell::new();

/// Configuration shared by every execution of a [`crate::Sandbox`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Path to Python interpreter used by the local backend
    pub python_path: PathBuf,

    /// Wall-clock ceiling in seconds for requests built from this config
    pub default_timeout_secs: u64,

    /// Resource limits for requests built from this config
    pub default_limits: ResourceLimits,

    /// Import allowlist for requests built from this config
    pub default_allowlist: Vec<String>,

    /// Deny IPv4/IPv6 socket creation in the child (Linux only)
    pub deny_network: bool,

    /// Milliseconds to wait for the output readers after the child exits
    pub reader_grace_ms: u64,

    /// Parent directory for scratch directories (system temp dir if unset)
    pub scratch_root: Option<PathBuf>,

    /// Settings for the container backend
    pub container: ContainerConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python_path: default_python_path(),
            default_timeout_secs: 10,
            default_limits: ResourceLimits::default(),
            default_allowlist: DEFAULT_ALLOWLIST.iter().map(|m| (*m).to_string()).collect(),
            deny_network: true,
            reader_grace_ms: 1000,
            scratch_root: None,
            container: ContainerConfig::default(),
        }
    }
}

/// Settings for running artifacts inside a disposable container
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container runtime binary (`docker`, `podman`, ...)
    pub runtime: PathBuf,
    /// Image providing the interpreter
    pub image: String,
    /// Interpreter inside the image
    pub python: String,
    /// Maximum number of processes inside the container
    pub pids_limit: u32,
    /// Extra arguments inserted before the image name
    pub extra_args: Vec<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: default_container_runtime(),
            image: "python:3.12-slim".into(),
            python: "python".into(),
            pids_limit: 64,
            extra_args: Vec::new(),
        }
    }
}

impl SandboxConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Load a JSON config file; absent fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            StockadeError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            StockadeError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    #[must_use]
    pub const fn reader_grace(&self) -> Duration {
        Duration::from_millis(self.reader_grace_ms)
    }

    /// Reject values no execution could run with
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_secs == 0 {
            return Err(StockadeError::Config("default_timeout_secs must be non-zero".into()));
        }
        if self.python_path.as_os_str().is_empty() {
            return Err(StockadeError::Config("python_path must not be empty".into()));
        }
        if self.container.image.is_empty() {
            return Err(StockadeError::Config("container.image must not be empty".into()));
        }
        Ok(())
    }
}

/// Builder for SandboxConfig
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    #[must_use]
    pub fn python_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.python_path = path.into();
        self
    }

    #[must_use]
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.default_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.config.default_limits = limits;
        self
    }

    #[must_use]
    pub fn allow(mut self, module: impl Into<String>) -> Self {
        self.config.default_allowlist.push(module.into());
        self
    }

    #[must_use]
    pub fn clear_allowlist(mut self) -> Self {
        self.config.default_allowlist.clear();
        self
    }

    #[must_use]
    pub fn deny_network(mut self, deny: bool) -> Self {
        self.config.deny_network = deny;
        self
    }

    #[must_use]
    pub fn reader_grace_ms(mut self, ms: u64) -> Self {
        self.config.reader_grace_ms = ms;
        self
    }

    #[must_use]
    pub fn scratch_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.scratch_root = Some(path.into());
        self
    }

    #[must_use]
    pub fn container(mut self, container: ContainerConfig) -> Self {
        self.config.container = container;
        self
    }

    #[must_use]
    pub fn build(self) -> SandboxConfig {
        self.config
    }
}

/// Install the process-wide default config.
///
/// Fails if a config was already installed or [`global`] was already read.
pub fn install(config: SandboxConfig) -> Result<()> {
    config.validate()?;
    GLOBAL
        .set(config)
        .map_err(|_| StockadeError::Config("global sandbox config already initialized".into()))
}

/// The process-wide default config, read-only once initialized
pub fn global() -> &'static SandboxConfig {
    GLOBAL.get_or_init(SandboxConfig::default)
}

/// Get interpreter path from STOCKADE_PYTHON env var or `python3`
pub fn default_python_path() -> PathBuf {
    std::env::var_os("STOCKADE_PYTHON")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("python3"))
}

/// Get container runtime from STOCKADE_CONTAINER_RUNTIME env var or `docker`
pub fn default_container_runtime() -> PathBuf {
    std::env::var_os("STOCKADE_CONTAINER_RUNTIME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("docker"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SandboxConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.deny_network);
        assert_eq!(config.default_allowlist, vec!["math", "random", "statistics"]);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = SandboxConfig::builder()
            .python_path("/opt/python/bin/python3")
            .timeout_secs(3)
            .clear_allowlist()
            .allow("json")
            .deny_network(false)
            .build();

        assert_eq!(config.python_path, PathBuf::from("/opt/python/bin/python3"));
        assert_eq!(config.default_timeout(), Duration::from_secs(3));
        assert_eq!(config.default_allowlist, vec!["json"]);
        assert!(!config.deny_network);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = SandboxConfig::builder().timeout_secs(0).build();
        assert!(matches!(config.validate(), Err(StockadeError::Config(_))));
    }

    #[test]
    fn partial_json_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stockade.json");
        std::fs::write(
            &path,
            r#"{"python_path": "/usr/bin/python3.12", "default_allowlist": ["json"]}"#,
        )
        .unwrap();

        let config = SandboxConfig::from_file(&path).unwrap();
        assert_eq!(config.python_path, PathBuf::from("/usr/bin/python3.12"));
        assert_eq!(config.default_allowlist, vec!["json"]);
        assert_eq!(config.default_timeout(), Duration::from_secs(10));
        assert_eq!(config.container.image, "python:3.12-slim");
    }

    #[test]
    fn durations_are_plain_integers_in_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stockade.json");
        std::fs::write(&path, r#"{"default_timeout_secs": 30, "reader_grace_ms": 250}"#).unwrap();

        let config = SandboxConfig::from_file(&path).unwrap();
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.reader_grace(), Duration::from_millis(250));

        let json = serde_json::to_value(SandboxConfig::default()).unwrap();
        assert_eq!(json["default_timeout_secs"], 10);
        assert_eq!(json["reader_grace_ms"], 1000);
    }

    #[test]
    fn malformed_json_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            SandboxConfig::from_file(&path),
            Err(StockadeError::Config(_))
        ));
    }
}
