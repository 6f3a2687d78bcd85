//! Seccomp-BPF deny-list filtering
//!
//! The policy is a static, versioned table. Syscalls that are not listed are
//! allowed; a listed syscall kills the whole process with `SIGSYS`. The table
//! has two tiers:
//!
//! | Tier   | Enabled by          | Classes                                        |
//! |--------|---------------------|------------------------------------------------|
//! | escape | `scmp_enabled`      | namespaces, modules, raw I/O, tracing, mounts, host admin, kernel objects |
//! | common | `scmp_deny_common`  | process creation, privilege changes, rlimits, prctl, timers, filesystem changes |
//!
//! The filter is compiled in the parent and only installed in the child, so
//! the child never allocates.

use crate::config::GuardSpec;
use crate::{CorralError, Result};
use nix::errno::Errno;
use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};
use std::collections::BTreeMap;
use std::fmt;

/// Bumped whenever an entry is added to or removed from the table
pub const POLICY_VERSION: u32 = 1;

/// Which guard flag activates a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    /// `scmp_enabled`
    Escape,
    /// `scmp_deny_common`
    Common,
}

impl Tier {
    #[must_use]
    pub const fn flag(self) -> &'static str {
        match self {
            Self::Escape => "scmp_enabled",
            Self::Common => "scmp_deny_common",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyscallClass {
    Namespace,
    ModuleLoading,
    RawDevice,
    Tracing,
    Mount,
    HostAdmin,
    KernelObjects,
    ProcessCreation,
    Privilege,
    ResourceLimit,
    ProcessControl,
    Timer,
    FilesystemChange,
}

impl SyscallClass {
    #[must_use]
    pub const fn tier(self) -> Tier {
        match self {
            Self::Namespace
            | Self::ModuleLoading
            | Self::RawDevice
            | Self::Tracing
            | Self::Mount
            | Self::HostAdmin
            | Self::KernelObjects => Tier::Escape,
            Self::ProcessCreation
            | Self::Privilege
            | Self::ResourceLimit
            | Self::ProcessControl
            | Self::Timer
            | Self::FilesystemChange => Tier::Common,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Namespace => "namespace",
            Self::ModuleLoading => "module-loading",
            Self::RawDevice => "raw-device",
            Self::Tracing => "tracing",
            Self::Mount => "mount",
            Self::HostAdmin => "host-admin",
            Self::KernelObjects => "kernel-objects",
            Self::ProcessCreation => "process-creation",
            Self::Privilege => "privilege",
            Self::ResourceLimit => "resource-limit",
            Self::ProcessControl => "process-control",
            Self::Timer => "timer",
            Self::FilesystemChange => "filesystem-change",
        }
    }
}

impl fmt::Display for SyscallClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a listed syscall is denied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    Always,
    /// Only when the given argument is non-zero
    ArgNonZero(u8),
}

/// One entry of the policy table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeniedSyscall {
    pub name: &'static str,
    pub nr: i64,
    pub class: SyscallClass,
    pub denial: Denial,
}

const fn deny(name: &'static str, nr: libc::c_long, class: SyscallClass) -> DeniedSyscall {
    DeniedSyscall {
        name,
        nr: nr as i64,
        class,
        denial: Denial::Always,
    }
}

const fn deny_if_set(
    name: &'static str,
    nr: libc::c_long,
    class: SyscallClass,
    arg: u8,
) -> DeniedSyscall {
    DeniedSyscall {
        name,
        nr: nr as i64,
        class,
        denial: Denial::ArgNonZero(arg),
    }
}

use SyscallClass::{
    FilesystemChange, HostAdmin, KernelObjects, ModuleLoading, Mount, Namespace, Privilege,
    ProcessControl, ProcessCreation, RawDevice, ResourceLimit, Timer, Tracing,
};

static POLICY: &[DeniedSyscall] = &[
    // escape
    deny("setns", libc::SYS_setns, Namespace),
    deny("unshare", libc::SYS_unshare, Namespace),
    deny("init_module", libc::SYS_init_module, ModuleLoading),
    deny("finit_module", libc::SYS_finit_module, ModuleLoading),
    deny("delete_module", libc::SYS_delete_module, ModuleLoading),
    #[cfg(target_arch = "x86_64")]
    deny("iopl", libc::SYS_iopl, RawDevice),
    #[cfg(target_arch = "x86_64")]
    deny("ioperm", libc::SYS_ioperm, RawDevice),
    deny("ptrace", libc::SYS_ptrace, Tracing),
    deny("process_vm_readv", libc::SYS_process_vm_readv, Tracing),
    deny("process_vm_writev", libc::SYS_process_vm_writev, Tracing),
    deny("mount", libc::SYS_mount, Mount),
    deny("umount2", libc::SYS_umount2, Mount),
    deny("pivot_root", libc::SYS_pivot_root, Mount),
    deny("chroot", libc::SYS_chroot, Mount),
    deny("open_tree", libc::SYS_open_tree, Mount),
    deny("move_mount", libc::SYS_move_mount, Mount),
    deny("fsopen", libc::SYS_fsopen, Mount),
    deny("fsmount", libc::SYS_fsmount, Mount),
    deny("reboot", libc::SYS_reboot, HostAdmin),
    deny("kexec_load", libc::SYS_kexec_load, HostAdmin),
    #[cfg(target_arch = "x86_64")]
    deny("kexec_file_load", libc::SYS_kexec_file_load, HostAdmin),
    deny("swapon", libc::SYS_swapon, HostAdmin),
    deny("swapoff", libc::SYS_swapoff, HostAdmin),
    deny("settimeofday", libc::SYS_settimeofday, HostAdmin),
    deny("clock_settime", libc::SYS_clock_settime, HostAdmin),
    deny("clock_adjtime", libc::SYS_clock_adjtime, HostAdmin),
    deny("adjtimex", libc::SYS_adjtimex, HostAdmin),
    deny("sethostname", libc::SYS_sethostname, HostAdmin),
    deny("setdomainname", libc::SYS_setdomainname, HostAdmin),
    deny("bpf", libc::SYS_bpf, KernelObjects),
    deny("perf_event_open", libc::SYS_perf_event_open, KernelObjects),
    deny("keyctl", libc::SYS_keyctl, KernelObjects),
    deny("add_key", libc::SYS_add_key, KernelObjects),
    deny("request_key", libc::SYS_request_key, KernelObjects),
    deny("open_by_handle_at", libc::SYS_open_by_handle_at, KernelObjects),
    deny("userfaultfd", libc::SYS_userfaultfd, KernelObjects),
    // common
    #[cfg(target_arch = "x86_64")]
    deny("fork", libc::SYS_fork, ProcessCreation),
    #[cfg(target_arch = "x86_64")]
    deny("vfork", libc::SYS_vfork, ProcessCreation),
    deny("clone", libc::SYS_clone, ProcessCreation),
    deny("clone3", libc::SYS_clone3, ProcessCreation),
    deny("setuid", libc::SYS_setuid, Privilege),
    deny("setgid", libc::SYS_setgid, Privilege),
    deny("setreuid", libc::SYS_setreuid, Privilege),
    deny("setregid", libc::SYS_setregid, Privilege),
    deny("setresuid", libc::SYS_setresuid, Privilege),
    deny("setresgid", libc::SYS_setresgid, Privilege),
    deny("setfsuid", libc::SYS_setfsuid, Privilege),
    deny("setfsgid", libc::SYS_setfsgid, Privilege),
    deny("setgroups", libc::SYS_setgroups, Privilege),
    deny("capset", libc::SYS_capset, Privilege),
    deny("setrlimit", libc::SYS_setrlimit, ResourceLimit),
    // glibc reads limits through prlimit64 with a null new limit
    deny_if_set("prlimit64", libc::SYS_prlimit64, ResourceLimit, 2),
    deny("prctl", libc::SYS_prctl, ProcessControl),
    deny("timer_create", libc::SYS_timer_create, Timer),
    deny("timer_settime", libc::SYS_timer_settime, Timer),
    deny("timer_delete", libc::SYS_timer_delete, Timer),
    deny("timerfd_create", libc::SYS_timerfd_create, Timer),
    deny("timerfd_settime", libc::SYS_timerfd_settime, Timer),
    deny("chdir", libc::SYS_chdir, FilesystemChange),
    deny("fchdir", libc::SYS_fchdir, FilesystemChange),
    #[cfg(target_arch = "x86_64")]
    deny("chmod", libc::SYS_chmod, FilesystemChange),
    deny("fchmod", libc::SYS_fchmod, FilesystemChange),
    deny("fchmodat", libc::SYS_fchmodat, FilesystemChange),
    #[cfg(target_arch = "x86_64")]
    deny("chown", libc::SYS_chown, FilesystemChange),
    #[cfg(target_arch = "x86_64")]
    deny("lchown", libc::SYS_lchown, FilesystemChange),
    deny("fchown", libc::SYS_fchown, FilesystemChange),
    deny("fchownat", libc::SYS_fchownat, FilesystemChange),
];

/// The full policy table for this architecture
#[must_use]
pub fn policy() -> &'static [DeniedSyscall] {
    POLICY
}

/// Configuration for seccomp filtering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompConfig {
    pub enabled: bool,
    pub deny_common: bool,
}

impl From<&GuardSpec> for SeccompConfig {
    fn from(guard: &GuardSpec) -> Self {
        Self {
            enabled: guard.scmp_enabled,
            deny_common: guard.scmp_enabled && guard.scmp_deny_common,
        }
    }
}

impl SeccompConfig {
    /// Table entries active under this configuration
    pub fn denied(&self) -> impl Iterator<Item = &'static DeniedSyscall> + '_ {
        POLICY.iter().filter(move |entry| match entry.class.tier() {
            Tier::Escape => self.enabled,
            Tier::Common => self.enabled && self.deny_common,
        })
    }

    /// Compile the filter for the running architecture.
    ///
    /// Returns `None` when filtering is disabled.
    pub fn compile(&self) -> Result<Option<SeccompProgram>> {
        if !self.enabled {
            return Ok(None);
        }

        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
        for entry in self.denied() {
            let chain = match entry.denial {
                // an empty chain matches unconditionally
                Denial::Always => Vec::new(),
                Denial::ArgNonZero(arg) => {
                    let condition =
                        SeccompCondition::new(arg, SeccompCmpArgLen::Qword, SeccompCmpOp::Ne, 0)
                            .map_err(|e| {
                                CorralError::Seccomp(format!("condition for {}: {e:?}", entry.name))
                            })?;
                    vec![SeccompRule::new(vec![condition]).map_err(|e| {
                        CorralError::Seccomp(format!("rule for {}: {e:?}", entry.name))
                    })?]
                }
            };
            rules.insert(entry.nr, chain);
        }

        let arch: TargetArch = std::env::consts::ARCH
            .try_into()
            .map_err(|e| CorralError::Seccomp(format!("unsupported architecture: {e:?}")))?;

        let filter = SeccompFilter::new(
            rules,
            SeccompAction::Allow,
            SeccompAction::KillProcess,
            arch,
        )
        .map_err(|e| CorralError::Seccomp(format!("failed to build filter: {e:?}")))?;

        let program: BpfProgram = filter
            .try_into()
            .map_err(|e| CorralError::Seccomp(format!("failed to compile filter: {e:?}")))?;

        tracing::debug!(
            version = POLICY_VERSION,
            syscalls = self.denied().count(),
            instructions = program.len(),
            deny_common = self.deny_common,
            "compiled seccomp filter"
        );

        Ok(Some(SeccompProgram(program)))
    }
}

/// A compiled filter, ready to install
#[derive(Debug, Clone)]
pub struct SeccompProgram(BpfProgram);

impl SeccompProgram {
    /// Number of BPF instructions
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Install on the calling thread. Sets `no_new_privs` first.
    ///
    /// Runs in the child, no allocation.
    pub fn install(&self) -> std::result::Result<(), Errno> {
        seccompiler::apply_filter(&self.0).map_err(|_| match Errno::last() {
            Errno::UnknownErrno => Errno::EINVAL,
            errno => errno,
        })
    }
}
