//! Child creation: `fork`, or `clone3` when namespaces are requested

use crate::{CorralError, Result};
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::unistd::Pid;

/// clone3 clone_args structure (from linux/sched.h)
#[repr(C)]
#[derive(Debug, Default)]
pub struct CloneArgs {
    /// Flags for the new process
    pub flags: u64,
    /// File descriptor for pidfd
    pub pidfd: u64,
    /// Pointer to the child TID in the child's memory
    pub child_tid: u64,
    /// Pointer to the child TID in the parent's memory
    pub parent_tid: u64,
    /// Signal to deliver on child termination
    pub exit_signal: u64,
    /// Stack pointer (0 = copy parent stack)
    pub stack: u64,
    /// Stack size (0 if using parent stack)
    pub stack_size: u64,
    /// TLS pointer
    pub tls: u64,
}

/// How the child was created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMethod {
    Fork,
    Clone3,
    /// Legacy `clone`, used where `clone3` is filtered (e.g. default Docker profile)
    Clone,
}

/// Wrapper around the clone3 syscall
///
/// # Safety
/// Duplicates the calling process. In a multithreaded parent the child may
/// only use async-signal-safe operations until it execs.
pub unsafe fn clone3(args: &CloneArgs) -> std::result::Result<libc::pid_t, Errno> {
    // SAFETY: args outlives the call and size matches the struct
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            std::ptr::from_ref(args),
            std::mem::size_of::<CloneArgs>(),
        )
    };
    Errno::result(ret).map(|pid| pid as libc::pid_t)
}

/// Legacy clone with fork semantics (no new stack, no shared VM)
unsafe fn clone_legacy(flags: u64) -> std::result::Result<libc::pid_t, Errno> {
    let flags = flags | libc::SIGCHLD as u64;
    // SAFETY: zero stack and tid pointers give fork-like behaviour
    let ret = unsafe { libc::syscall(libc::SYS_clone, flags, 0usize, 0usize, 0usize, 0usize) };
    Errno::result(ret).map(|pid| pid as libc::pid_t)
}

/// Create the child and run `child_fn` in it.
///
/// `child_fn` is expected to exec or `_exit`; should it return, the child
/// exits with 127. In the parent the new PID is returned with the method
/// that created it.
pub fn spawn_child<F>(namespaces: CloneFlags, child_fn: F) -> Result<(Pid, SpawnMethod)>
where
    F: FnOnce(),
{
    let (ret, method) = if namespaces.is_empty() {
        // SAFETY: the child only runs child_fn, which is allocation-free
        let ret = Errno::result(unsafe { libc::fork() });
        (ret, SpawnMethod::Fork)
    } else {
        let flags = namespaces.bits() as u64;
        let args = CloneArgs {
            flags,
            exit_signal: libc::SIGCHLD as u64,
            ..Default::default()
        };
        // SAFETY: as above
        match unsafe { clone3(&args) } {
            Err(Errno::ENOSYS) => {
                // SAFETY: as above
                (unsafe { clone_legacy(flags) }, SpawnMethod::Clone)
            }
            other => (other, SpawnMethod::Clone3),
        }
    };

    match ret {
        Ok(0) => {
            child_fn();
            // SAFETY: leave the child without unwinding into parent state
            unsafe { libc::_exit(127) }
        }
        Ok(pid) => Ok((Pid::from_raw(pid), method)),
        Err(errno) => Err(CorralError::Spawn(format!(
            "{method:?} failed: {}",
            std::io::Error::from(errno)
        ))),
    }
}
