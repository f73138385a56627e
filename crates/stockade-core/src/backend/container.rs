//! Container backend: one disposable, network-less container per request

use super::{command_succeeds, Backend};
use crate::config::{ContainerConfig, SandboxConfig};
use crate::guard::{self, GuardBuilder, VerdictChannel};
use crate::isolation::{Capabilities, ScratchDir};
use crate::request::{ExecutionRequest, Isolation};
use crate::result::ExecutionResult;
use crate::supervisor::{self, Launch, Terminator, VerdictSource};
use crate::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Mount point of the request's working directory inside the container
const WORKSPACE: &str = "/workspace";

/// Runs guarded artifacts through a container runtime (`docker`, `podman`)
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    config: Arc<SandboxConfig>,
}

impl ContainerBackend {
    #[must_use]
    pub const fn new(config: Arc<SandboxConfig>) -> Self {
        Self { config }
    }

    fn prepare(&self, request: &ExecutionRequest) -> Result<Launch> {
        let execution_id = guard::nonce()?;
        let name = format!("stockade-{execution_id}");
        let container = &self.config.container;

        // The artifact travels on stdin; the scratch directory only backs the
        // workspace mount when the caller did not pick one.
        let scratch = match &request.working_directory {
            Some(_) => None,
            None => Some(ScratchDir::create(self.config.scratch_root.as_deref())?),
        };
        let workdir = match (&request.working_directory, &scratch) {
            (Some(dir), _) => dir.clone(),
            (None, Some(scratch)) => scratch.path().to_path_buf(),
            (None, None) => std::env::temp_dir(),
        };

        let artifact = GuardBuilder::new(
            &request.code,
            &request.import_allowlist,
            VerdictChannel::marker(&execution_id),
        )
        .build()?;

        let mut command = Command::new(&container.runtime);
        command.args(run_args(&name, container, request, &workdir));

        tracing::debug!(
            execution_id = %execution_id,
            runtime = %container.runtime.display(),
            image = %container.image,
            container = %name,
            "container launch prepared"
        );

        Ok(Launch {
            execution_id: execution_id.clone(),
            backend: Isolation::Container,
            command,
            stdin_payload: Some(artifact.source.into_bytes()),
            verdict: VerdictSource::Marker(guard::verdict_marker(&execution_id)),
            terminator: Some(kill_container(container.runtime.clone(), name)),
            scratch,
            warnings: Vec::new(),
        })
    }
}

impl Backend for ContainerBackend {
    fn kind(&self) -> Isolation {
        Isolation::Container
    }

    fn probe(&self) -> Capabilities {
        let mut version = Command::new(&self.config.container.runtime);
        version.arg("version");
        let available = command_succeeds(version);

        Capabilities {
            available,
            address_space_limit: available,
            cpu_time_limit: available,
            file_size_limit: available,
            network_denial: available,
            dedicated_verdict_channel: false,
        }
    }

    fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        match self.prepare(request) {
            Ok(launch) => supervisor::supervise(launch, request, self.config.reader_grace()),
            Err(e) => {
                tracing::error!(error = %e, "failed to prepare container execution");
                ExecutionResult::supervisor_error(
                    Isolation::Container,
                    format!("failed to prepare execution: {e}"),
                )
            }
        }
    }
}

/// Arguments for `<runtime> run`, image and interpreter included
fn run_args(
    name: &str,
    container: &ContainerConfig,
    request: &ExecutionRequest,
    workdir: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "run",
        "--rm",
        "-i",
        "--network=none",
        "--cap-drop=ALL",
        "--security-opt=no-new-privileges",
    ]
    .iter()
    .map(OsString::from)
    .collect();

    args.push("--name".into());
    args.push(name.into());
    args.push(format!("--pids-limit={}", container.pids_limit).into());

    let limits = &request.resource_limits;
    if let Some(bytes) = limits.max_address_space_bytes {
        args.push(format!("--memory={bytes}").into());
    }
    if let Some(secs) = limits.max_cpu_seconds {
        args.push("--ulimit".into());
        args.push(format!("cpu={secs}:{}", secs.saturating_add(1)).into());
    }
    if let Some(bytes) = limits.max_file_size_bytes {
        args.push("--ulimit".into());
        args.push(format!("fsize={bytes}").into());
    }
    args.push("--ulimit".into());
    args.push("core=0".into());

    for (key, value) in [
        ("PYTHONUNBUFFERED", "1"),
        ("PYTHONDONTWRITEBYTECODE", "1"),
        ("PYTHONIOENCODING", "utf-8"),
    ] {
        args.push("-e".into());
        args.push(format!("{key}={value}").into());
    }
    for (key, value) in &request.environment {
        args.push("-e".into());
        args.push(format!("{key}={value}").into());
    }

    let mut mount = OsString::from(workdir.as_os_str());
    mount.push(":");
    mount.push(WORKSPACE);
    args.push("-v".into());
    args.push(mount);
    args.push("-w".into());
    args.push(WORKSPACE.into());

    args.extend(container.extra_args.iter().map(OsString::from));

    args.push(container.image.as_str().into());
    args.push(container.python.as_str().into());
    args.extend(["-u", "-B", "-"].iter().map(OsString::from));
    args
}

/// Terminator removing the container when the supervisor kills the client
fn kill_container(runtime: PathBuf, name: String) -> Terminator {
    Box::new(move || {
        let status = Command::new(&runtime)
            .arg("kill")
            .arg(&name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => {
                tracing::info!(container = %name, "container killed");
            }
            Ok(status) => tracing::debug!(container = %name, %status, "container kill reported failure"),
            Err(e) => tracing::warn!(container = %name, error = %e, "failed to run container kill"),
        }
    })
}
