//! # stockade-core
//!
//! Sandboxed execution engine for untrusted Python snippets.
//!
//! Each request runs as a guarded artifact in its own child process:
//! - the guard denies input, file opening and process spawning, and checks
//!   every import against an allowlist
//! - rlimits and (on Linux) a seccomp network filter are applied before exec
//! - stdout/stderr are relayed line by line while the supervisor enforces a
//!   wall-clock ceiling
//! - the guard's verdict record is decoded into one [`ExecutionResult`]
//!
//! ```no_run
//! use stockade_core::{ExecutionRequest, Sandbox};
//!
//! let sandbox = Sandbox::default();
//! let request = ExecutionRequest::builder("print(1 + 1)").timeout_secs(5).build();
//! let result = sandbox.execute(&request)?;
//! assert_eq!(result.stdout, "2");
//! # Ok::<(), stockade_core::StockadeError>(())
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod guard;
pub mod isolation;
pub mod relay;
pub mod request;
pub mod result;
pub mod retry;
pub mod sandbox;
pub mod supervisor;

pub use backend::{Backend, BackendSelector, ContainerBackend, LocalBackend};
pub use config::{ContainerConfig, SandboxConfig};
pub use error::StockadeError;
pub use isolation::Capabilities;
pub use request::{ExecutionRequest, ExecutionRequestBuilder, Isolation, ResourceLimits, StreamConsumer};
pub use result::{ExecutionResult, ExecutionStatus, Violation};
pub use retry::{execute_with_retry, Attempt, Executor, RetryOutcome, RetryPolicy};
pub use sandbox::{execute, Sandbox};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, StockadeError>;
