//! Linux isolation primitives
//!
//! This module contains the child-side setup pipeline and its pieces:
//! - `clone3` - process creation, with namespaces when requested
//! - `cgroups` - the per-run cgroup v2 leaf
//! - `namespace` - mount/PID/UTS/IPC/cgroup and network namespaces
//! - `stdio` - stream redirection and descriptor hygiene
//! - `rlimits` - kernel resource limits
//! - `identity` - user resolution and privilege drop
//! - `seccomp` - deny-list syscall filtering
//!
//! Everything the child needs is prepared by the parent. Between clone and
//! exec the child only makes raw syscalls: no allocation, no locks, no
//! logging.

pub mod cgroups;
pub mod clone3;
pub mod identity;
pub mod namespace;
pub mod rlimits;
pub mod seccomp;
pub mod stdio;

pub use self::cgroups::Cgroup;
pub use self::identity::{Identity, PrivilegeDrop};
pub use self::namespace::NamespaceConfig;
pub use self::rlimits::RlimitPlan;
pub use self::seccomp::{SeccompConfig, SeccompProgram};
pub use self::stdio::{StdioFiles, StdioPlan};

use crate::error::SetupStage;
use crate::pipe::report_failure;
use nix::errno::Errno;
use std::ffi::CStr;
use std::os::unix::io::RawFd;

type StepResult = Result<(), (SetupStage, Errno)>;

/// Everything the child needs between clone and exec, borrowed from
/// parent-owned storage
#[derive(Debug)]
pub struct ChildPlan<'a> {
    pub program: &'a CStr,
    /// Null-terminated `argv`
    pub argv: &'a [*const libc::c_char],
    pub working_dir: Option<&'a CStr>,
    pub namespaces: NamespaceConfig,
    /// Expected parent, or 0 inside a new PID namespace
    pub parent_pid: libc::pid_t,
    pub stdio: StdioPlan,
    pub rlimits: RlimitPlan,
    pub privileges: Option<PrivilegeDrop>,
    /// `cgroup.procs` of the run's cgroup, if one was created
    pub cgroup_fd: Option<RawFd>,
    pub seccomp: Option<&'a SeccompProgram>,
    /// Write end of the handshake pipe
    pub report_fd: RawFd,
}

impl ChildPlan<'_> {
    /// Run the setup pipeline and exec. Never returns.
    pub fn run(&self) -> ! {
        let (stage, errno) = match self.setup() {
            Ok(()) => {
                // SAFETY: program and argv point into parent-built CStrings
                unsafe { libc::execv(self.program.as_ptr(), self.argv.as_ptr()) };
                (SetupStage::Exec, Errno::last())
            }
            Err(failure) => failure,
        };
        report_failure(self.report_fd, stage, errno);
        // SAFETY: terminate without running atexit handlers or destructors
        unsafe { libc::_exit(127) }
    }

    fn setup(&self) -> StepResult {
        step(SetupStage::ParentDeath, self.tie_to_parent())?;
        step(SetupStage::ProcessGroup, own_process_group())?;
        if let Some(fd) = self.cgroup_fd {
            // the parent checks membership and falls back to /proc tracking
            let _ = cgroups::join(fd);
        }
        // after the join, so the namespace root is the run's own cgroup
        step(SetupStage::Cgroup, self.namespaces.enter_cgroup())?;
        step(SetupStage::Network, self.namespaces.enter_network())?;
        step(SetupStage::Mounts, self.namespaces.isolate_mounts())?;
        step(SetupStage::WorkingDir, self.change_dir())?;
        step(SetupStage::Stdio, self.stdio.apply())?;
        step(SetupStage::Descriptors, stdio::mark_cloexec_from(3))?;
        step(SetupStage::ResourceLimits, self.rlimits.apply())?;
        if let Some(privileges) = &self.privileges {
            step(SetupStage::Identity, privileges.apply())?;
            // a credential change clears the parent-death signal
            step(SetupStage::Identity, parent_death_signal())?;
        }
        if let Some(program) = self.seccomp {
            step(SetupStage::Seccomp, program.install())?;
        }
        Ok(())
    }

    /// Parent-death SIGKILL plus a clean signal state for the program
    fn tie_to_parent(&self) -> Result<(), Errno> {
        // SAFETY: signal and prctl calls on the calling process only
        unsafe {
            let mut empty: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut empty);
            Errno::result(libc::sigprocmask(
                libc::SIG_SETMASK,
                &empty,
                std::ptr::null_mut(),
            ))?;
            // the Rust runtime ignores SIGPIPE and exec would keep that
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);

            parent_death_signal()?;
            if self.parent_pid != 0 && libc::getppid() != self.parent_pid {
                return Err(Errno::ESRCH);
            }
        }
        Ok(())
    }

    fn change_dir(&self) -> Result<(), Errno> {
        match self.working_dir {
            // SAFETY: NUL-terminated path
            Some(dir) => Errno::result(unsafe { libc::chdir(dir.as_ptr()) }).map(drop),
            None => Ok(()),
        }
    }
}

fn parent_death_signal() -> Result<(), Errno> {
    let zero: libc::c_ulong = 0;
    // SAFETY: prctl on the calling process
    let ret = unsafe {
        libc::prctl(
            libc::PR_SET_PDEATHSIG,
            libc::SIGKILL as libc::c_ulong,
            zero,
            zero,
            zero,
        )
    };
    Errno::result(ret).map(drop)
}

fn own_process_group() -> Result<(), Errno> {
    // SAFETY: moves the calling process into a new group
    Errno::result(unsafe { libc::setpgid(0, 0) }).map(drop)
}

#[inline]
fn step(stage: SetupStage, result: Result<(), Errno>) -> StepResult {
    result.map_err(|errno| (stage, errno))
}
