//! Execution result types

use crate::request::Isolation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Terminal status of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The code ran to completion
    Success,
    /// The code raised, failed to compile, or touched a blocked capability
    ScriptException,
    /// The wall-clock ceiling was hit and the child was killed
    Timeout,
    /// The sandbox machinery itself failed
    SupervisorError,
}

impl ExecutionStatus {
    /// Whether revising the code could change the outcome
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::ScriptException | Self::Timeout)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::ScriptException => "script_exception",
            Self::Timeout => "timeout",
            Self::SupervisorError => "supervisor_error",
        };
        f.write_str(name)
    }
}

/// A disallowed operation attempted by the sandboxed code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Violation {
    /// Import of a module outside the allowlist
    Import(String),
    /// Call of a denied capability such as `open()` or `os.system`
    Capability(String),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Import(module) => write!(f, "import of {module} blocked"),
            Self::Capability(name) => write!(f, "{name} blocked"),
        }
    }
}

/// Result of a sandboxed code execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,

    /// Exit code reported by the guard; absent on timeout and supervisor errors
    pub exit_code: Option<i32>,

    /// Raw exit code of the child process (`128 + signal` for signal deaths)
    pub process_exit_code: Option<i32>,

    /// Standard output, lines joined with `\n`
    pub stdout: String,

    /// Standard error, lines joined with `\n`
    pub stderr: String,

    /// Traceback or other failure detail
    pub diagnostic: Option<String>,

    /// Set when a blocked import or capability ended the run
    pub blocked: Option<Violation>,

    /// Guarantees that could not be provided for this run
    pub warnings: Vec<String>,

    /// Wall-clock time spent supervising the child
    pub duration: Duration,

    /// Backend that produced the result
    pub backend: Isolation,
}

impl ExecutionResult {
    pub(crate) fn supervisor_error(backend: Isolation, diagnostic: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::SupervisorError,
            exit_code: None,
            process_exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            diagnostic: Some(diagnostic.into()),
            blocked: None,
            warnings: Vec::new(),
            duration: Duration::ZERO,
            backend,
        }
    }

    /// Check if execution was successful
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    #[must_use]
    pub const fn timed_out(&self) -> bool {
        matches!(self.status, ExecutionStatus::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(ExecutionStatus::ScriptException.is_retryable());
        assert!(ExecutionStatus::Timeout.is_retryable());
        assert!(!ExecutionStatus::SupervisorError.is_retryable());
        assert!(!ExecutionStatus::Success.is_retryable());
    }

    #[test]
    fn violation_serializes_with_kind_tag() {
        let json = serde_json::to_string(&Violation::Import("socket".into())).unwrap();
        assert_eq!(json, r#"{"kind":"import","name":"socket"}"#);

        let parsed: Violation =
            serde_json::from_str(r#"{"kind":"capability","name":"os.system"}"#).unwrap();
        assert_eq!(parsed, Violation::Capability("os.system".into()));
    }

    #[test]
    fn supervisor_error_has_no_exit_code() {
        let result = ExecutionResult::supervisor_error(Isolation::Process, "spawn failed");
        assert_eq!(result.status, ExecutionStatus::SupervisorError);
        assert!(result.exit_code.is_none());
        assert_eq!(result.diagnostic.as_deref(), Some("spawn failed"));
        assert_eq!(result.status.to_string(), "supervisor_error");
    }
}
