//! Seccomp-BPF filter denying IPv4/IPv6 socket creation

use crate::{Result, StockadeError};
use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};
use std::collections::BTreeMap;

/// Compiled filter, built in the parent and installed in the child
#[derive(Debug, Clone)]
pub struct NetworkFilter {
    program: BpfProgram,
}

impl NetworkFilter {
    /// Compile the filter for the host architecture.
    ///
    /// `socket(AF_INET | AF_INET6, ...)` fails with `EACCES`; every other
    /// syscall, including Unix-domain sockets, is allowed.
    pub fn compile() -> Result<Self> {
        let arch = TryInto::<TargetArch>::try_into(std::env::consts::ARCH)
            .map_err(|e| StockadeError::Seccomp(format!("unsupported architecture: {e:?}")))?;

        let family_is = |family: libc::c_int| -> Result<SeccompRule> {
            let condition = SeccompCondition::new(
                0,
                SeccompCmpArgLen::Dword,
                SeccompCmpOp::Eq,
                family as u64,
            )
            .map_err(|e| StockadeError::Seccomp(e.to_string()))?;
            SeccompRule::new(vec![condition]).map_err(|e| StockadeError::Seccomp(e.to_string()))
        };

        let mut rules = BTreeMap::new();
        rules.insert(
            libc::SYS_socket,
            vec![family_is(libc::AF_INET)?, family_is(libc::AF_INET6)?],
        );

        let filter = SeccompFilter::new(
            rules,
            SeccompAction::Allow,
            SeccompAction::Errno(libc::EACCES as u32),
            arch,
        )
        .map_err(|e| StockadeError::Seccomp(e.to_string()))?;

        let program = TryInto::<BpfProgram>::try_into(filter)
            .map_err(|e| StockadeError::Seccomp(e.to_string()))?;

        tracing::debug!(instructions = program.len(), "network filter compiled");
        Ok(Self { program })
    }

    /// Install the filter on the calling thread.
    ///
    /// Runs between fork and exec: no allocation, no logging.
    pub fn apply(&self) -> std::io::Result<()> {
        seccompiler::apply_filter(&self.program)
            .map_err(|_| std::io::Error::from_raw_os_error(libc::EPERM))
    }
}
