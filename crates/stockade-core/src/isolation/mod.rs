//! Host-side isolation primitives
//!
//! - `scratch` - request-scoped working directories
//! - `rlimit` - resource ceilings negotiated against the host
//! - `seccomp` - syscall filter denying network sockets (Linux)
//! - `channel` - memfd-backed verdict channel (Linux)

#[cfg(target_os = "linux")]
pub mod channel;
pub mod rlimit;
pub mod scratch;
#[cfg(target_os = "linux")]
pub mod seccomp;

pub use self::rlimit::{LimitKind, LimitPlan};
pub use self::scratch::ScratchDir;

use serde::{Deserialize, Serialize};

/// What a backend can actually enforce on this host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// The backend's executable (interpreter or container runtime) responds
    pub available: bool,
    pub address_space_limit: bool,
    pub cpu_time_limit: bool,
    pub file_size_limit: bool,
    pub network_denial: bool,
    /// Verdict travels on a channel separate from the script's stdout
    pub dedicated_verdict_channel: bool,
}

/// Network denial is possible when the seccomp filter compiles here
#[must_use]
pub fn network_filter_supported() -> bool {
    #[cfg(target_os = "linux")]
    {
        seccomp::NetworkFilter::compile().is_ok()
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// The memfd verdict channel can be created here
#[must_use]
pub fn verdict_channel_supported() -> bool {
    #[cfg(target_os = "linux")]
    {
        channel::VerdictSink::create("probe").is_ok()
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}
