//! Bounded re-execution with caller-supplied code revision

use crate::request::ExecutionRequest;
use crate::result::{ExecutionResult, ExecutionStatus};
use crate::sandbox::Sandbox;
use crate::Result;

/// Anything that turns a request into a result
pub trait Executor {
    fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult>;
}

impl Executor for Sandbox {
    fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        Self::execute(self, request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total executions allowed, the first one included
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// One execution and the code it ran
#[derive(Debug, Clone)]
pub struct Attempt {
    pub code: String,
    pub result: ExecutionResult,
}

/// Every attempt, in order
#[derive(Debug, Clone, Default)]
pub struct RetryOutcome {
    pub attempts: Vec<Attempt>,
}

impl RetryOutcome {
    /// Result of the last attempt
    #[must_use]
    pub fn last(&self) -> Option<&ExecutionResult> {
        self.attempts.last().map(|attempt| &attempt.result)
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.last().is_some_and(ExecutionResult::is_success)
    }
}

/// Run `request`, revising its code after each retryable failure.
///
/// `revise(result, attempt)` receives the failed result and the 1-based
/// attempt number and returns replacement code, or `None` to stop.
/// `SupervisorError` stops immediately since new code cannot fix it.
pub fn execute_with_retry<E, F>(
    executor: &E,
    request: &ExecutionRequest,
    policy: RetryPolicy,
    mut revise: F,
) -> Result<RetryOutcome>
where
    E: Executor + ?Sized,
    F: FnMut(&ExecutionResult, u32) -> Option<String>,
{
    let mut outcome = RetryOutcome::default();
    let mut current = request.clone();

    for attempt in 1..=policy.max_attempts.max(1) {
        let result = executor.execute(&current)?;
        let status = result.status;
        tracing::debug!(attempt, status = %status, "attempt finished");

        let next = if status == ExecutionStatus::Success || !status.is_retryable() {
            None
        } else if attempt < policy.max_attempts {
            revise(&result, attempt)
        } else {
            None
        };

        outcome.attempts.push(Attempt {
            code: std::mem::take(&mut current.code),
            result,
        });

        match next {
            Some(code) => current.code = code,
            None => break,
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Isolation;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Returns scripted statuses in order and records the code it saw
    struct Scripted {
        statuses: Mutex<Vec<ExecutionStatus>>,
        seen: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(statuses: &[ExecutionStatus]) -> Self {
            let mut statuses = statuses.to_vec();
            statuses.reverse();
            Self {
                statuses: Mutex::new(statuses),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl Executor for Scripted {
        fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
            self.seen.lock().push(request.code.clone());
            let status = self.statuses.lock().pop().unwrap_or(ExecutionStatus::Success);
            Ok(ExecutionResult {
                status,
                exit_code: None,
                process_exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                diagnostic: None,
                blocked: None,
                warnings: Vec::new(),
                duration: Duration::ZERO,
                backend: Isolation::Process,
            })
        }
    }

    #[test]
    fn revises_until_success() {
        let executor = Scripted::new(&[
            ExecutionStatus::ScriptException,
            ExecutionStatus::Timeout,
            ExecutionStatus::Success,
        ]);
        let outcome = execute_with_retry(
            &executor,
            &ExecutionRequest::new("v1"),
            RetryPolicy { max_attempts: 5 },
            |_, attempt| Some(format!("v{}", attempt + 1)),
        )
        .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(*executor.seen.lock(), vec!["v1", "v2", "v3"]);
        let codes: Vec<_> = outcome.attempts.iter().map(|a| a.code.as_str()).collect();
        assert_eq!(codes, vec!["v1", "v2", "v3"]);
    }

    #[test]
    fn supervisor_error_stops_immediately() {
        let executor = Scripted::new(&[ExecutionStatus::SupervisorError]);
        let mut revisions = 0;
        let outcome = execute_with_retry(
            &executor,
            &ExecutionRequest::new("v1"),
            RetryPolicy { max_attempts: 5 },
            |_, _| {
                revisions += 1;
                Some("v2".into())
            },
        )
        .unwrap();

        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(revisions, 0);
    }

    #[test]
    fn attempts_are_bounded_by_policy() {
        let executor = Scripted::new(&[ExecutionStatus::ScriptException; 10]);
        let outcome = execute_with_retry(
            &executor,
            &ExecutionRequest::new("v"),
            RetryPolicy { max_attempts: 3 },
            |_, _| Some("again".into()),
        )
        .unwrap();

        assert_eq!(outcome.attempts.len(), 3);
        assert!(!outcome.succeeded());
    }

    #[test]
    fn revise_returning_none_stops() {
        let executor = Scripted::new(&[ExecutionStatus::Timeout, ExecutionStatus::Success]);
        let outcome = execute_with_retry(
            &executor,
            &ExecutionRequest::new("v"),
            RetryPolicy::default(),
            |result, _| {
                assert!(result.timed_out());
                None
            },
        )
        .unwrap();

        assert_eq!(outcome.attempts.len(), 1);
    }
}
