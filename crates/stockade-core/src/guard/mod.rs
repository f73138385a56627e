//! Guard Builder: turns untrusted code into a guarded artifact
//!
//! The artifact is a self-contained Python program that:
//! - binds every entry of [`capabilities::DENIED`] to a stub that raises and
//!   records the violation, on the real builtins and modules
//! - installs an audit hook that refuses process spawning, writable opens and
//!   reads outside the interpreter's own trees, whichever route reaches them
//! - resolves imports made by the user's code through an allowlist check
//! - turns `SIGXCPU` into a catchable exception so CPU ceilings are diagnosable
//! - runs the code in its own namespace, teeing stdout/stderr into buffers
//! - writes exactly one JSON verdict record to its [`VerdictChannel`]

pub mod capabilities;

use crate::{Result, StockadeError};
use serde::Serialize;
use std::collections::BTreeSet;

const PRELUDE: &str = include_str!("prelude.py");
const CONFIG_TOKEN: &str = "__STOCKADE_CONFIG__";

/// File descriptor the local backend hands to the child for the verdict
pub const VERDICT_FD: i32 = 3;

/// Modules the interpreter imports on the user's behalf from native code
pub const IMPLICIT_IMPORTS: &[&str] = &["encodings", "_strptime"];

/// Where the artifact writes its verdict record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictChannel {
    /// A dedicated file descriptor, separate from the script's stdout.
    ///
    /// The record carries no copy of the output. If the descriptor refuses
    /// the write, the record goes to stdout behind the `fallback` marker.
    Fd { fd: i32, fallback: String },
    /// The last stdout line, tagged with a per-execution marker
    Marker(String),
}

impl VerdictChannel {
    /// Marker channel keyed by an execution nonce
    #[must_use]
    pub fn marker(nonce: &str) -> Self {
        Self::Marker(verdict_marker(nonce))
    }

    /// Descriptor channel falling back to the marker for `nonce`
    #[must_use]
    pub fn fd(fd: i32, nonce: &str) -> Self {
        Self::Fd {
            fd,
            fallback: verdict_marker(nonce),
        }
    }
}

/// Prefix of the stdout line carrying the verdict for execution `nonce`
#[must_use]
pub fn verdict_marker(nonce: &str) -> String {
    format!("@@stockade-verdict:{nonce}@@")
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ChannelSpec<'a> {
    Fd { fd: i32, fallback: &'a str },
    Marker { marker: &'a str },
}

#[derive(Serialize)]
struct GuardConfig<'a> {
    code: &'a str,
    allowlist: &'a BTreeSet<String>,
    implicit: &'a [&'a str],
    denied: Vec<capabilities::DeniedEntry>,
    channel: ChannelSpec<'a>,
}

/// Executable form of a request's code
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Python source of the guarded entry script
    pub source: String,
}

/// Builds guarded artifacts
#[derive(Debug, Clone)]
pub struct GuardBuilder<'a> {
    code: &'a str,
    allowlist: &'a BTreeSet<String>,
    denied: &'a [capabilities::Capability],
    channel: VerdictChannel,
}

impl<'a> GuardBuilder<'a> {
    #[must_use]
    pub fn new(code: &'a str, allowlist: &'a BTreeSet<String>, channel: VerdictChannel) -> Self {
        Self {
            code,
            allowlist,
            denied: capabilities::DENIED,
            channel,
        }
    }

    /// Replace the denied capability table
    #[must_use]
    pub const fn denied(mut self, table: &'a [capabilities::Capability]) -> Self {
        self.denied = table;
        self
    }

    pub fn build(self) -> Result<Artifact> {
        let channel = match &self.channel {
            VerdictChannel::Fd { fd, fallback } => ChannelSpec::Fd { fd: *fd, fallback },
            VerdictChannel::Marker(marker) => ChannelSpec::Marker { marker },
        };
        let config = GuardConfig {
            code: self.code,
            allowlist: self.allowlist,
            implicit: IMPLICIT_IMPORTS,
            denied: capabilities::render(self.denied),
            channel,
        };

        // A JSON string literal is also a valid Python string literal.
        let json = serde_json::to_string(&config)?;
        let literal = serde_json::to_string(&json)?;
        let source = PRELUDE.replacen(CONFIG_TOKEN, &literal, 1);

        tracing::debug!(
            code_len = self.code.len(),
            artifact_len = source.len(),
            allowlist = self.allowlist.len(),
            "guarded artifact built"
        );

        Ok(Artifact { source })
    }
}

/// Random hex identifier for one execution
pub fn nonce() -> Result<String> {
    let mut bytes = [0u8; 12];
    getrandom::fill(&mut bytes)
        .map_err(|e| StockadeError::Channel(format!("failed to generate nonce: {e}")))?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(modules: &[&str]) -> BTreeSet<String> {
        modules.iter().map(|m| (*m).to_string()).collect()
    }

    fn embedded_config(source: &str) -> serde_json::Value {
        let line = source
            .lines()
            .find(|line| line.starts_with("_CONFIG = _json.loads("))
            .unwrap();
        let literal = line
            .trim_start_matches("_CONFIG = _json.loads(")
            .trim_end_matches(')');
        let json: String = serde_json::from_str(literal).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn config_token_is_replaced_once() {
        let allowlist = allow(&[]);
        let channel = VerdictChannel::fd(VERDICT_FD, "abc");
        let artifact = GuardBuilder::new("print(1)", &allowlist, channel)
            .build()
            .unwrap();
        assert!(!artifact.source.contains(CONFIG_TOKEN));

        let config = embedded_config(&artifact.source);
        assert_eq!(config["channel"]["kind"], "fd");
        assert_eq!(config["channel"]["fd"], 3);
        assert_eq!(config["channel"]["fallback"], "@@stockade-verdict:abc@@");
    }

    #[test]
    fn user_code_survives_embedding() {
        let code = "s = \"quote ' and \\\\ backslash\"\nprint('''tri''', '__STOCKADE_CONFIG__', 'é')\n";
        let allowlist = allow(&["math"]);
        let artifact = GuardBuilder::new(code, &allowlist, VerdictChannel::marker("abc"))
            .build()
            .unwrap();

        let config = embedded_config(&artifact.source);
        assert_eq!(config["code"], code);
        assert_eq!(config["allowlist"], serde_json::json!(["math"]));
        assert_eq!(config["channel"]["kind"], "marker");
        assert_eq!(config["channel"]["marker"], "@@stockade-verdict:abc@@");
    }

    #[test]
    fn denied_table_is_embedded() {
        let allowlist = allow(&[]);
        let channel = VerdictChannel::fd(VERDICT_FD, "abc");
        let artifact = GuardBuilder::new("pass", &allowlist, channel)
            .build()
            .unwrap();
        let config = embedded_config(&artifact.source);
        let denied = config["denied"].as_array().unwrap();
        assert_eq!(denied.len(), capabilities::DENIED.len());
        assert!(denied.iter().any(|entry| entry["name"] == "os.system"));
        assert!(denied.iter().any(|entry| entry["name"] == "posix.system"));
    }

    #[test]
    fn implicit_imports_stay_out_of_the_allowlist() {
        let allowlist = allow(&["math"]);
        let artifact = GuardBuilder::new("pass", &allowlist, VerdictChannel::marker("abc"))
            .build()
            .unwrap();
        let config = embedded_config(&artifact.source);
        assert_eq!(config["allowlist"], serde_json::json!(["math"]));
        assert_eq!(config["implicit"], serde_json::json!(["encodings", "_strptime"]));
    }

    #[test]
    fn prelude_patches_the_real_builtins_module() {
        for needle in [
            "_builtins.__import__ = guarded_import",
            "setattr(_builtins, entry[\"attr\"], stub)",
            "delattr(_builtins, hidden)",
            "_sys.addaudithook(",
        ] {
            assert!(PRELUDE.contains(needle), "{needle} missing from prelude");
        }
    }

    #[test]
    fn custom_denied_table() {
        let allowlist = allow(&[]);
        let channel = VerdictChannel::fd(VERDICT_FD, "abc");
        let artifact = GuardBuilder::new("pass", &allowlist, channel)
            .denied(&capabilities::DENIED[..2])
            .build()
            .unwrap();
        let config = embedded_config(&artifact.source);
        assert_eq!(config["denied"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn nonces_are_unique_hex() {
        let a = nonce().unwrap();
        let b = nonce().unwrap();
        assert_eq!(a.len(), 24);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
