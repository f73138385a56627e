//! Local-process backend

use super::{command_succeeds, Backend};
use crate::config::SandboxConfig;
use crate::guard::{self, GuardBuilder, VerdictChannel};
use crate::isolation::{self, Capabilities, LimitKind, LimitPlan, ScratchDir};
use crate::request::{ExecutionRequest, Isolation};
use crate::result::ExecutionResult;
use crate::supervisor::{self, Launch, VerdictSource};
use crate::Result;
use std::os::unix::io::RawFd;
use std::process::Command;
use std::sync::Arc;

#[cfg(target_os = "linux")]
use crate::isolation::{channel::VerdictSink, seccomp::NetworkFilter};

/// Runs guarded artifacts as direct children of this process
#[derive(Debug, Clone)]
pub struct LocalBackend {
    config: Arc<SandboxConfig>,
}

impl LocalBackend {
    #[must_use]
    pub const fn new(config: Arc<SandboxConfig>) -> Self {
        Self { config }
    }

    fn prepare(&self, request: &ExecutionRequest) -> Result<Launch> {
        let execution_id = guard::nonce()?;
        let mut warnings = Vec::new();

        // Step 1: Request-scoped scratch directory
        let scratch = ScratchDir::create(self.config.scratch_root.as_deref())?;

        // Step 2: Verdict channel, then the guarded artifact that writes to it
        let (channel, verdict, verdict_fd) = verdict_channel(&execution_id, &mut warnings);
        let artifact = GuardBuilder::new(&request.code, &request.import_allowlist, channel).build()?;
        let script = scratch.write_artifact(&artifact)?;

        // Step 3: Everything the child applies before exec, prepared here
        let plan = LimitPlan::negotiate(&request.resource_limits);
        warnings.extend(plan.warnings.iter().cloned());
        let hooks = ChildHooks {
            plan,
            verdict_fd,
            #[cfg(target_os = "linux")]
            network: self.network_filter(&mut warnings),
        };
        #[cfg(not(target_os = "linux"))]
        if self.config.deny_network {
            warnings.push("network denial is not supported on this platform".to_string());
        }

        let cwd = request
            .working_directory
            .clone()
            .unwrap_or_else(|| scratch.path().to_path_buf());

        let mut command = Command::new(&self.config.python_path);
        command
            .arg("-u")
            .arg("-B")
            .arg(&script)
            .current_dir(&cwd)
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .envs(&request.environment);
        hooks.install(&mut command);

        tracing::debug!(
            execution_id = %execution_id,
            python = %self.config.python_path.display(),
            cwd = %cwd.display(),
            "local launch prepared"
        );

        Ok(Launch {
            execution_id,
            backend: Isolation::Process,
            command,
            stdin_payload: None,
            verdict,
            terminator: None,
            scratch: Some(scratch),
            warnings,
        })
    }

    #[cfg(target_os = "linux")]
    fn network_filter(&self, warnings: &mut Vec<String>) -> Option<NetworkFilter> {
        if !self.config.deny_network {
            return None;
        }
        match NetworkFilter::compile() {
            Ok(filter) => Some(filter),
            Err(e) => {
                tracing::warn!(error = %e, "network denial unavailable");
                warnings.push(format!("network denial unavailable: {e}"));
                None
            }
        }
    }
}

impl Backend for LocalBackend {
    fn kind(&self) -> Isolation {
        Isolation::Process
    }

    fn probe(&self) -> Capabilities {
        let mut version = Command::new(&self.config.python_path);
        version.arg("--version");

        Capabilities {
            available: command_succeeds(version),
            address_space_limit: LimitKind::AddressSpace.supported(),
            cpu_time_limit: LimitKind::CpuTime.supported(),
            file_size_limit: LimitKind::FileSize.supported(),
            network_denial: self.config.deny_network && isolation::network_filter_supported(),
            dedicated_verdict_channel: isolation::verdict_channel_supported(),
        }
    }

    fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        match self.prepare(request) {
            Ok(launch) => supervisor::supervise(launch, request, self.config.reader_grace()),
            Err(e) => {
                tracing::error!(error = %e, "failed to prepare local execution");
                ExecutionResult::supervisor_error(
                    Isolation::Process,
                    format!("failed to prepare execution: {e}"),
                )
            }
        }
    }
}

/// Memfd verdict channel where available, stdout marker otherwise
fn verdict_channel(
    execution_id: &str,
    warnings: &mut Vec<String>,
) -> (VerdictChannel, VerdictSource, Option<RawFd>) {
    #[cfg(target_os = "linux")]
    match VerdictSink::create(execution_id) {
        Ok(sink) => {
            let fd = sink.as_raw_fd();
            return (
                VerdictChannel::fd(guard::VERDICT_FD, execution_id),
                VerdictSource::Sink {
                    sink,
                    fallback: guard::verdict_marker(execution_id),
                },
                Some(fd),
            );
        }
        Err(e) => {
            tracing::warn!(error = %e, "falling back to stdout verdict marker");
            warnings.push(format!("dedicated verdict channel unavailable: {e}"));
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = &warnings;

    let channel = VerdictChannel::marker(execution_id);
    let marker = guard::verdict_marker(execution_id);
    (channel, VerdictSource::Marker(marker), None)
}

/// State moved into the child's `pre_exec` hook
struct ChildHooks {
    plan: LimitPlan,
    verdict_fd: Option<RawFd>,
    #[cfg(target_os = "linux")]
    network: Option<NetworkFilter>,
}

impl ChildHooks {
    #[allow(unsafe_code)]
    fn install(self, command: &mut Command) {
        use std::os::unix::process::CommandExt;

        let Self {
            plan,
            verdict_fd,
            #[cfg(target_os = "linux")]
            network,
        } = self;

        // SAFETY: the hook only issues setrlimit, dup2/fcntl and seccomp
        // syscalls on state prepared before fork; it neither allocates nor
        // takes locks.
        unsafe {
            command.pre_exec(move || {
                plan.apply()?;
                #[cfg(target_os = "linux")]
                if let Some(fd) = verdict_fd {
                    VerdictSink::install(fd)?;
                }
                #[cfg(not(target_os = "linux"))]
                let _ = verdict_fd;
                #[cfg(target_os = "linux")]
                if let Some(filter) = &network {
                    filter.apply()?;
                }
                Ok(())
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_channel_matches_platform() {
        let mut warnings = Vec::new();
        let (channel, source, fd) = verdict_channel("unit", &mut warnings);

        if cfg!(target_os = "linux") && warnings.is_empty() {
            assert_eq!(channel, VerdictChannel::fd(guard::VERDICT_FD, "unit"));
            #[cfg(target_os = "linux")]
            {
                let VerdictSource::Sink { fallback, .. } = &source else {
                    panic!("expected the memfd source");
                };
                assert_eq!(fallback, "@@stockade-verdict:unit@@");
            }
            assert!(fd.is_some());
        } else {
            assert_eq!(channel, VerdictChannel::marker("unit"));
            assert!(matches!(source, VerdictSource::Marker(_)));
            assert!(fd.is_none());
        }
    }

    #[test]
    fn missing_interpreter_is_supervisor_error() {
        let config = SandboxConfig::builder()
            .python_path("/nonexistent/python-for-stockade")
            .build();
        let backend = LocalBackend::new(Arc::new(config));

        assert!(!backend.probe().available);
        let result = backend.execute(&ExecutionRequest::new("print(1)"));
        assert_eq!(result.status, crate::ExecutionStatus::SupervisorError);
        assert_eq!(result.backend, Isolation::Process);
    }
}
