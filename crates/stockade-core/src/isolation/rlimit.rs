//! setrlimit-based resource ceilings, negotiated against the host
//!
//! Limits are planned in the parent (where allocation and logging are fine)
//! and applied in the child's `pre_exec` hook, which only makes syscalls.

use crate::request::ResourceLimits;

/// Which ceiling a plan entry sets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    AddressSpace,
    CpuTime,
    FileSize,
    CoreDump,
}

impl LimitKind {
    const fn label(self) -> &'static str {
        match self {
            Self::AddressSpace => "address space",
            Self::CpuTime => "cpu time",
            Self::FileSize => "file size",
            Self::CoreDump => "core dump",
        }
    }

    /// Whether the host can enforce this ceiling
    #[must_use]
    pub const fn supported(self) -> bool {
        match self {
            Self::AddressSpace => cfg!(any(target_os = "linux", target_os = "android")),
            Self::CpuTime | Self::FileSize | Self::CoreDump => cfg!(unix),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedLimit {
    pub kind: LimitKind,
    pub soft: u64,
    pub hard: u64,
}

/// Ceilings the child will run under plus what could not be honored
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitPlan {
    pub limits: Vec<PlannedLimit>,
    pub warnings: Vec<String>,
}

impl LimitPlan {
    /// Negotiate `requested` against platform support and current hard limits
    #[must_use]
    pub fn negotiate(requested: &ResourceLimits) -> Self {
        let mut plan = Self::default();

        let wanted = [
            (LimitKind::AddressSpace, requested.max_address_space_bytes),
            (LimitKind::CpuTime, requested.max_cpu_seconds),
            (LimitKind::FileSize, requested.max_file_size_bytes),
        ];

        for (kind, value) in wanted {
            let Some(value) = value else { continue };
            if !kind.supported() {
                plan.warn(format!(
                    "{} limit is not supported on this platform; running unlimited",
                    kind.label()
                ));
                continue;
            }
            let ceiling = current_hard_limit(kind);
            // CPU keeps one second of headroom so SIGXCPU arrives before SIGKILL.
            let hard = if kind == LimitKind::CpuTime {
                value.saturating_add(1)
            } else {
                value
            };
            let hard = hard.min(ceiling);
            let soft = value.min(hard);
            if soft < value {
                plan.warn(format!(
                    "{} limit {value} exceeds the host hard limit; clamped to {soft}",
                    kind.label()
                ));
            }
            plan.limits.push(PlannedLimit { kind, soft, hard });
        }

        if LimitKind::CoreDump.supported() {
            plan.limits.push(PlannedLimit {
                kind: LimitKind::CoreDump,
                soft: 0,
                hard: 0,
            });
        }

        plan
    }

    fn warn(&mut self, message: String) {
        tracing::warn!("{message}");
        self.warnings.push(message);
    }

    /// Apply every planned limit to the calling process.
    ///
    /// Runs between fork and exec: no allocation, no logging.
    #[cfg(unix)]
    pub fn apply(&self) -> std::io::Result<()> {
        use nix::sys::resource::setrlimit;

        for limit in &self.limits {
            let Some(resource) = resource_for(limit.kind) else {
                continue;
            };
            setrlimit(resource, limit.soft as libc::rlim_t, limit.hard as libc::rlim_t)
                .map_err(std::io::Error::from)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
const fn resource_for(kind: LimitKind) -> Option<nix::sys::resource::Resource> {
    use nix::sys::resource::Resource;

    match kind {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        LimitKind::AddressSpace => Some(Resource::RLIMIT_AS),
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        LimitKind::AddressSpace => None,
        LimitKind::CpuTime => Some(Resource::RLIMIT_CPU),
        LimitKind::FileSize => Some(Resource::RLIMIT_FSIZE),
        LimitKind::CoreDump => Some(Resource::RLIMIT_CORE),
    }
}

#[cfg(unix)]
fn current_hard_limit(kind: LimitKind) -> u64 {
    resource_for(kind)
        .and_then(|resource| nix::sys::resource::getrlimit(resource).ok())
        .map_or(u64::MAX, |(_, hard)| hard as u64)
}

#[cfg(not(unix))]
fn current_hard_limit(_kind: LimitKind) -> u64 {
    u64::MAX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_request_only_disables_core_dumps() {
        let plan = LimitPlan::negotiate(&ResourceLimits::default());
        assert!(plan.warnings.is_empty());
        assert!(plan.limits.iter().all(|l| l.kind == LimitKind::CoreDump));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_supports_every_limit() {
        let plan = LimitPlan::negotiate(&ResourceLimits {
            max_address_space_bytes: Some(512 * 1024 * 1024),
            max_cpu_seconds: Some(2),
            max_file_size_bytes: Some(1024 * 1024),
        });
        assert!(plan.warnings.is_empty(), "{:?}", plan.warnings);

        let cpu = plan
            .limits
            .iter()
            .find(|l| l.kind == LimitKind::CpuTime)
            .unwrap();
        assert_eq!(cpu.soft, 2);
        assert!(cpu.hard >= cpu.soft);

        let fsize = plan
            .limits
            .iter()
            .find(|l| l.kind == LimitKind::FileSize)
            .unwrap();
        assert_eq!(fsize.soft, 1024 * 1024);
    }

    #[cfg(unix)]
    #[test]
    fn limits_above_host_ceiling_are_clamped() {
        let (_, hard) = nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_CPU).unwrap();
        let hard = hard as u64;
        if hard == u64::MAX || hard == libc::RLIM_INFINITY as u64 {
            return;
        }
        let plan = LimitPlan::negotiate(&ResourceLimits {
            max_cpu_seconds: Some(hard + 100),
            ..ResourceLimits::default()
        });
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.warnings[0].contains("clamped"));
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    #[test]
    fn address_space_is_reported_unsupported() {
        let plan = LimitPlan::negotiate(&ResourceLimits {
            max_address_space_bytes: Some(1 << 30),
            ..ResourceLimits::default()
        });
        assert!(plan.warnings[0].contains("not supported"));
    }
}
