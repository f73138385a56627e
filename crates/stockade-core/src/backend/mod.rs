//! Backend Selector: isolation strategies behind one execution contract
//!
//! - `local` - guarded artifact in a bare child process on this host
//! - `container` - guarded artifact in a disposable, network-less container

pub mod container;
pub mod local;

pub use self::container::ContainerBackend;
pub use self::local::LocalBackend;

use crate::config::SandboxConfig;
use crate::isolation::Capabilities;
use crate::request::{ExecutionRequest, Isolation};
use crate::result::ExecutionResult;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use wait_timeout::ChildExt;

/// How long a probe may wait for `--version`-style commands
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// An isolation strategy.
///
/// Every backend returns exactly one result per request and never fails:
/// machinery failures are reported as `SupervisorError` results.
pub trait Backend: Send + Sync {
    fn kind(&self) -> Isolation;

    /// Report what this backend can enforce on this host
    fn probe(&self) -> Capabilities;

    /// Run one already-validated request to completion
    fn execute(&self, request: &ExecutionRequest) -> ExecutionResult;
}

/// Owns one backend per isolation level
pub struct BackendSelector {
    local: LocalBackend,
    container: ContainerBackend,
}

impl BackendSelector {
    #[must_use]
    pub fn new(config: Arc<SandboxConfig>) -> Self {
        Self {
            local: LocalBackend::new(Arc::clone(&config)),
            container: ContainerBackend::new(config),
        }
    }

    /// Backend matching a request's declared isolation requirement
    #[must_use]
    pub fn select(&self, isolation: Isolation) -> &dyn Backend {
        match isolation {
            Isolation::Process => &self.local,
            Isolation::Container => &self.container,
        }
    }
}

impl std::fmt::Debug for BackendSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSelector").finish_non_exhaustive()
    }
}

/// Run a short command and report whether it exited successfully in time
fn command_succeeds(mut command: Command) -> bool {
    let program = command.get_program().to_string_lossy().into_owned();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::debug!(program, error = %e, "probe command failed to start");
            return false;
        }
    };

    match child.wait_timeout(PROBE_TIMEOUT) {
        Ok(Some(status)) => status.success(),
        Ok(None) => {
            tracing::warn!(program, "probe command timed out");
            let _ = child.kill();
            let _ = child.wait();
            false
        }
        Err(e) => {
            tracing::debug!(program, error = %e, "probe command wait failed");
            false
        }
    }
}
