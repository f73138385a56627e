//! Result Codec: turns raw child output into one [`ExecutionResult`]
//!
//! The guard's record is authoritative for the script-level outcome; the raw
//! process exit code is always kept alongside it. A child that produced no
//! parseable record is a `SupervisorError` carrying whatever output exists.

use crate::relay::Captured;
use crate::request::Isolation;
use crate::result::{ExecutionResult, ExecutionStatus, Violation};
use serde::Deserialize;
use std::time::Duration;

/// Status values the guard writes into its record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Success,
    Exception,
    Blocked,
}

/// The canonical record written by a guarded artifact
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VerdictRecord {
    pub status: RecordStatus,
    pub returncode: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub traceback: Option<String>,
    #[serde(default)]
    pub violation: Option<Violation>,
}

impl VerdictRecord {
    /// Parse one record line
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }
}

/// Where to look for the record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSource {
    /// Contents of a dedicated verdict channel (`None` if nothing was written),
    /// then the last stdout line behind `fallback` if the channel has no record
    Channel {
        text: Option<String>,
        fallback: String,
    },
    /// Last stdout line starting with this marker
    Marker(String),
}

/// Everything the supervisor collected from a child that exited on its own
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub process_exit_code: Option<i32>,
    pub captured: Captured,
    pub source: RecordSource,
}

/// Produce the final result
#[must_use]
pub fn decode(raw: RawOutput, backend: Isolation) -> ExecutionResult {
    let RawOutput {
        process_exit_code,
        mut captured,
        source,
    } = raw;

    let record = match source {
        RecordSource::Channel { text, fallback } => text
            .as_deref()
            .and_then(last_record)
            .or_else(|| take_marked_record(&mut captured.stdout, &fallback)),
        RecordSource::Marker(marker) => take_marked_record(&mut captured.stdout, &marker),
    };

    let Some(record) = record else {
        return unparseable(process_exit_code, &captured, backend);
    };

    let (status, blocked) = match record.status {
        RecordStatus::Success => (ExecutionStatus::Success, None),
        RecordStatus::Exception => (ExecutionStatus::ScriptException, None),
        RecordStatus::Blocked => (ExecutionStatus::ScriptException, record.violation),
    };
    let exit_code = record.returncode.unwrap_or(match status {
        ExecutionStatus::Success => 0,
        _ => 1,
    });

    ExecutionResult {
        status,
        exit_code: Some(exit_code),
        process_exit_code,
        stdout: pick_text(&captured.stdout, &record.stdout),
        stderr: pick_text(&captured.stderr, &record.stderr),
        diagnostic: record.traceback,
        blocked,
        warnings: Vec::new(),
        duration: Duration::ZERO,
        backend,
    }
}

/// Last well-formed record in a channel's contents
fn last_record(text: &str) -> Option<VerdictRecord> {
    text.lines()
        .rev()
        .filter(|line| !line.trim().is_empty())
        .find_map(VerdictRecord::parse)
}

/// Find the last marked line that parses, remove it from stdout and return it
fn take_marked_record(stdout: &mut Vec<String>, marker: &str) -> Option<VerdictRecord> {
    let (index, record) = stdout.iter().enumerate().rev().find_map(|(index, line)| {
        line.strip_prefix(marker)
            .and_then(VerdictRecord::parse)
            .map(|record| (index, record))
    })?;
    stdout.remove(index);
    Some(record)
}

/// Relay lines win; the record's copy fills in a stream the relay missed
fn pick_text(relayed: &[String], recorded: &str) -> String {
    if relayed.is_empty() && !recorded.is_empty() {
        return recorded.lines().collect::<Vec<_>>().join("\n");
    }
    relayed.join("\n")
}

fn unparseable(
    process_exit_code: Option<i32>,
    captured: &Captured,
    backend: Isolation,
) -> ExecutionResult {
    let stdout = captured.stdout.join("\n");
    let stderr = captured.stderr.join("\n");
    let code = process_exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
    let diagnostic = format!(
        "guarded artifact produced no verdict record (process exit code {code})\n\
         --- stdout ---\n{stdout}\n--- stderr ---\n{stderr}"
    );
    tracing::warn!(exit_code = ?process_exit_code, "no verdict record from child");

    ExecutionResult {
        process_exit_code,
        stdout,
        stderr,
        ..ExecutionResult::supervisor_error(backend, diagnostic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &[&str]) -> Vec<String> {
        text.iter().map(|l| (*l).to_string()).collect()
    }

    fn captured(stdout: &[&str], stderr: &[&str]) -> Captured {
        Captured {
            stdout: lines(stdout),
            stderr: lines(stderr),
        }
    }

    const FALLBACK: &str = "@@stockade-verdict:f00d@@";

    fn channel(text: Option<String>) -> RecordSource {
        RecordSource::Channel {
            text,
            fallback: FALLBACK.into(),
        }
    }

    const SUCCESS: &str =
        r#"{"status":"success","returncode":0,"stdout":"2\n","stderr":"","traceback":null,"violation":null}"#;

    #[test]
    fn channel_record_yields_success() {
        let result = decode(
            RawOutput {
                process_exit_code: Some(0),
                captured: captured(&["2"], &[]),
                source: channel(Some(SUCCESS.into())),
            },
            Isolation::Process,
        );

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "2");
        assert!(result.diagnostic.is_none());
    }

    #[test]
    fn record_overrides_raw_exit_code() {
        let record = r#"{"status":"exception","returncode":1,"traceback":"Traceback...\nValueError: bad\n"}"#;
        let result = decode(
            RawOutput {
                process_exit_code: Some(0),
                captured: captured(&[], &[]),
                source: channel(Some(record.into())),
            },
            Isolation::Process,
        );

        assert_eq!(result.status, ExecutionStatus::ScriptException);
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.process_exit_code, Some(0));
        assert!(result.diagnostic.unwrap().contains("ValueError: bad"));
    }

    #[test]
    fn blocked_record_carries_violation() {
        let record = r#"{"status":"blocked","returncode":1,"traceback":"ImportError: Import blocked in sandbox: os","violation":{"kind":"import","name":"os"}}"#;
        let result = decode(
            RawOutput {
                process_exit_code: Some(0),
                captured: Captured::default(),
                source: channel(Some(record.into())),
            },
            Isolation::Process,
        );

        assert_eq!(result.status, ExecutionStatus::ScriptException);
        assert_eq!(result.blocked, Some(Violation::Import("os".into())));
    }

    #[test]
    fn marker_line_is_parsed_and_stripped() {
        let marker = "@@stockade-verdict:feed@@";
        let marked = format!("{marker}{SUCCESS}");
        let result = decode(
            RawOutput {
                process_exit_code: Some(0),
                captured: captured(&["hello", "world", marked.as_str()], &[]),
                source: RecordSource::Marker(marker.into()),
            },
            Isolation::Container,
        );

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout, "hello\nworld");
        assert_eq!(result.backend, Isolation::Container);
    }

    #[test]
    fn lookalike_record_without_marker_is_ignored() {
        let result = decode(
            RawOutput {
                process_exit_code: Some(0),
                captured: captured(&[SUCCESS], &[]),
                source: RecordSource::Marker("@@stockade-verdict:real@@".into()),
            },
            Isolation::Container,
        );

        assert_eq!(result.status, ExecutionStatus::SupervisorError);
        assert_eq!(result.stdout, SUCCESS);
    }

    #[test]
    fn missing_record_is_supervisor_error_with_raw_output() {
        let result = decode(
            RawOutput {
                process_exit_code: Some(139),
                captured: captured(&["partial"], &["Fatal Python error"]),
                source: channel(None),
            },
            Isolation::Process,
        );

        assert_eq!(result.status, ExecutionStatus::SupervisorError);
        assert!(result.exit_code.is_none());
        assert_eq!(result.process_exit_code, Some(139));
        let diagnostic = result.diagnostic.unwrap();
        assert!(diagnostic.contains("exit code 139"));
        assert!(diagnostic.contains("partial"));
        assert!(diagnostic.contains("Fatal Python error"));
    }

    #[test]
    fn malformed_record_is_supervisor_error() {
        let result = decode(
            RawOutput {
                process_exit_code: Some(0),
                captured: Captured::default(),
                source: channel(Some("{\"status\": \"succ".into())),
            },
            Isolation::Process,
        );
        assert_eq!(result.status, ExecutionStatus::SupervisorError);
    }

    #[test]
    fn record_text_fills_empty_relay_stream() {
        let record = r#"{"status":"success","returncode":0,"stdout":"a\nb\n","stderr":""}"#;
        let result = decode(
            RawOutput {
                process_exit_code: Some(0),
                captured: Captured::default(),
                source: channel(Some(record.into())),
            },
            Isolation::Process,
        );
        assert_eq!(result.stdout, "a\nb");
        assert_eq!(result.stderr, "");
    }

    #[test]
    fn refused_channel_write_falls_back_to_marker_line() {
        let marked = format!(
            r#"{FALLBACK}{{"status":"exception","returncode":1,"traceback":"ValueError: big"}}"#
        );
        let result = decode(
            RawOutput {
                process_exit_code: Some(0),
                captured: captured(&["out", marked.as_str()], &[]),
                source: channel(None),
            },
            Isolation::Process,
        );

        assert_eq!(result.status, ExecutionStatus::ScriptException);
        assert_eq!(result.stdout, "out");
        assert!(result.diagnostic.unwrap().contains("ValueError: big"));
    }

    #[test]
    fn channel_record_wins_over_marker_line() {
        let marked = format!(r#"{FALLBACK}{{"status":"exception","returncode":1}}"#);
        let result = decode(
            RawOutput {
                process_exit_code: Some(0),
                captured: captured(&[marked.as_str()], &[]),
                source: channel(Some(SUCCESS.into())),
            },
            Isolation::Process,
        );

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout, marked);
    }
}
