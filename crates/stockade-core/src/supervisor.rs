//! Process Supervisor: owns one child from spawn to cleanup

use crate::codec::{self, RawOutput, RecordSource};
use crate::isolation::ScratchDir;
use crate::relay::{Captured, StreamRelay};
use crate::request::{ExecutionRequest, Isolation};
use crate::result::{ExecutionResult, ExecutionStatus};
use crate::StockadeError;
use std::io::Write;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

/// Appended to stderr when the child is killed on timeout
pub const TIMEOUT_NOTICE: &str = "[Process killed due to timeout]";

/// Extra cleanup run when the child is forcibly terminated
pub type Terminator = Box<dyn FnOnce() + Send>;

/// How the supervisor retrieves the verdict after the child exits
#[derive(Debug)]
pub enum VerdictSource {
    /// Memfd inherited by the child as its verdict descriptor, with the
    /// stdout marker the guard uses when the memfd refuses the record
    #[cfg(target_os = "linux")]
    Sink {
        sink: crate::isolation::channel::VerdictSink,
        fallback: String,
    },
    /// Marker-tagged last line of stdout
    Marker(String),
}

/// A fully prepared child plus everything needed to supervise it
pub struct Launch {
    pub execution_id: String,
    pub backend: Isolation,
    /// Program, arguments, cwd, env and pre-exec hooks already applied
    pub command: Command,
    /// Written to the child's stdin, which is otherwise null
    pub stdin_payload: Option<Vec<u8>>,
    pub verdict: VerdictSource,
    pub terminator: Option<Terminator>,
    /// Released after the child is gone, on every path
    pub scratch: Option<ScratchDir>,
    /// Degradations noticed while preparing the launch
    pub warnings: Vec<String>,
}

/// Run a prepared child to a terminal result.
///
/// Never fails: spawn and supervision errors become `SupervisorError`.
pub fn supervise(mut launch: Launch, request: &ExecutionRequest, grace: Duration) -> ExecutionResult {
    let scratch = launch.scratch.take();
    let started = Instant::now();

    let mut result = run(&mut launch, request, grace);

    result.duration = started.elapsed();
    result.backend = launch.backend;
    let mut warnings = std::mem::take(&mut launch.warnings);
    warnings.append(&mut result.warnings);
    result.warnings = warnings;

    if let Some(scratch) = scratch {
        let path = scratch.path().display().to_string();
        if let Err(e) = scratch.release() {
            tracing::warn!(execution_id = %launch.execution_id, error = %e, "scratch cleanup failed");
            result.warnings.push(format!("failed to remove scratch directory {path}: {e}"));
        }
    }

    tracing::info!(
        execution_id = %launch.execution_id,
        status = %result.status,
        exit_code = ?result.exit_code,
        duration_ms = result.duration.as_millis() as u64,
        "execution finished"
    );
    result
}

fn run(launch: &mut Launch, request: &ExecutionRequest, grace: Duration) -> ExecutionResult {
    let backend = launch.backend;
    let program = launch.command.get_program().to_string_lossy().into_owned();

    launch
        .command
        .stdin(if launch.stdin_payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        launch.command.process_group(0);
    }

    let mut child = match launch.command.spawn() {
        Ok(child) => child,
        Err(source) => {
            let err = StockadeError::Spawn { program, source };
            tracing::error!(execution_id = %launch.execution_id, error = %err, "spawn failed");
            return ExecutionResult::supervisor_error(backend, err.to_string());
        }
    };
    let pid = child.id();
    tracing::info!(
        execution_id = %launch.execution_id,
        pid,
        backend = ?backend,
        timeout_ms = request.timeout.as_millis() as u64,
        "child spawned"
    );

    if let (Some(payload), Some(stdin)) = (launch.stdin_payload.take(), child.stdin.take()) {
        feed_stdin(stdin, payload);
    }

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        terminate(&mut child, launch.terminator.take());
        return ExecutionResult::supervisor_error(backend, "child output pipes were not created");
    };

    let relay = match StreamRelay::start(stdout, stderr, request.stream_consumer.clone()) {
        Ok(relay) => relay,
        Err(e) => {
            terminate(&mut child, launch.terminator.take());
            return ExecutionResult::supervisor_error(
                backend,
                format!("failed to start output relay: {e}"),
            );
        }
    };

    match child.wait_timeout(request.timeout) {
        Ok(Some(status)) => {
            kill_group(pid);
            let (captured, drained) = relay.finish(grace);
            let mut warnings = Vec::new();
            if !drained {
                warnings.push(format!(
                    "output readers did not finish within {grace:?}; output may be truncated"
                ));
            }
            let source = record_source(&launch.verdict, &mut warnings);
            let mut result = codec::decode(
                RawOutput {
                    process_exit_code: Some(exit_code(status)),
                    captured,
                    source,
                },
                backend,
            );
            result.warnings.extend(warnings);
            result
        }
        Ok(None) => {
            tracing::warn!(
                execution_id = %launch.execution_id,
                pid,
                "wall-clock limit exceeded, killing child"
            );
            terminate(&mut child, launch.terminator.take());
            let (captured, _) = relay.finish(grace);
            request.emit(TIMEOUT_NOTICE, true);
            timed_out(captured, request.timeout, backend)
        }
        Err(e) => {
            tracing::error!(execution_id = %launch.execution_id, pid, error = %e, "wait failed");
            terminate(&mut child, launch.terminator.take());
            let (captured, _) = relay.finish(grace);
            ExecutionResult {
                stdout: captured.stdout.join("\n"),
                stderr: captured.stderr.join("\n"),
                ..ExecutionResult::supervisor_error(backend, format!("failed to wait for child: {e}"))
            }
        }
    }
}

#[cfg_attr(not(target_os = "linux"), allow(unused_variables))]
fn record_source(verdict: &VerdictSource, warnings: &mut Vec<String>) -> RecordSource {
    match verdict {
        #[cfg(target_os = "linux")]
        VerdictSource::Sink { sink, fallback } => {
            let text = sink.read_record().unwrap_or_else(|e| {
                warnings.push(format!("failed to read verdict channel: {e}"));
                None
            });
            RecordSource::Channel {
                text,
                fallback: fallback.clone(),
            }
        }
        VerdictSource::Marker(marker) => RecordSource::Marker(marker.clone()),
    }
}

fn timed_out(captured: Captured, timeout: Duration, backend: Isolation) -> ExecutionResult {
    let mut stderr = captured.stderr.join("\n");
    if !stderr.is_empty() {
        stderr.push('\n');
    }
    stderr.push_str(TIMEOUT_NOTICE);

    ExecutionResult {
        status: ExecutionStatus::Timeout,
        stdout: captured.stdout.join("\n"),
        stderr,
        diagnostic: Some(format!(
            "process forcibly terminated after exceeding the {timeout:?} wall-clock limit"
        )),
        ..ExecutionResult::supervisor_error(backend, String::new())
    }
}

/// Write the payload from a helper thread so a child that never reads
/// stdin cannot wedge the supervisor.
fn feed_stdin(mut stdin: ChildStdin, payload: Vec<u8>) {
    let spawned = std::thread::Builder::new()
        .name("stockade-stdin".into())
        .spawn(move || {
            if let Err(e) = stdin.write_all(&payload) {
                tracing::debug!(error = %e, "child closed stdin early");
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "failed to start stdin writer");
    }
}

/// Kill the child's whole process group, run the backend's terminator, reap.
fn terminate(child: &mut Child, terminator: Option<Terminator>) {
    kill_group(child.id());
    if let Some(terminator) = terminator {
        terminator();
    }
    let _ = child.kill();
    if let Err(e) = child.wait() {
        tracing::warn!(pid = child.id(), error = %e, "failed to reap child");
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else { return };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH | Errno::EPERM) => {}
        Err(e) => tracing::debug!(pid, error = %e, "killpg failed"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}
