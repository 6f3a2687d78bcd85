//! Kernel resource limits for the child
//!
//! The plan is derived in the parent; the child only walks a fixed array.

use crate::config::LimitSpec;
use nix::errno::Errno;

/// Upper bound on the number of limits in a plan
const MAX_LIMITS: usize = 4;

/// One `setrlimit` call, soft and hard set to the same value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    pub resource: libc::__rlimit_resource_t,
    pub value: u64,
}

/// Fixed-capacity list of limits applied in order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RlimitPlan {
    limits: [Option<Rlimit>; MAX_LIMITS],
    len: usize,
}

impl RlimitPlan {
    /// Derive the limit set for a request.
    ///
    /// A CPU limit always installs `RLIMIT_CPU` one second above the limit
    /// rounded up, so the kernel stops a runaway process that slips between
    /// polls. The classic set is added only when `rlimit_enabled` is set.
    #[must_use]
    pub fn from_limits(limits: &LimitSpec) -> Self {
        let mut plan = Self::default();

        if limits.limit_proc_time > 0 {
            let secs = limits.limit_proc_time.div_ceil(1000).saturating_add(1);
            plan.push(libc::RLIMIT_CPU, secs);
        }
        if limits.rlimit_enabled {
            plan.push(libc::RLIMIT_CORE, limits.rlimit_core);
            plan.push(libc::RLIMIT_NPROC, limits.rlimit_nproc);
            plan.push(libc::RLIMIT_NOFILE, limits.rlimit_nofile);
        }
        plan
    }

    fn push(&mut self, resource: libc::__rlimit_resource_t, value: u64) {
        if self.len < MAX_LIMITS {
            self.limits[self.len] = Some(Rlimit { resource, value });
            self.len += 1;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rlimit> {
        self.limits[..self.len].iter().flatten()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Apply every limit. Runs in the child, no allocation.
    pub fn apply(&self) -> Result<(), Errno> {
        for limit in self.iter() {
            set_rlimit(limit.resource, limit.value)?;
        }
        Ok(())
    }
}

#[inline]
fn set_rlimit(resource: libc::__rlimit_resource_t, limit: u64) -> Result<(), Errno> {
    let rlim = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    // SAFETY: rlim is valid, resource is a valid constant.
    Errno::result(unsafe { libc::setrlimit(resource, &rlim) }).map(drop)
}
