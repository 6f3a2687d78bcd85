//! Linux namespace isolation

use crate::config::GuardSpec;
use nix::errno::Errno;
use nix::sched::CloneFlags;

/// Which namespaces the child gets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Fresh mount, PID, UTS, IPC and cgroup namespaces. All but the cgroup
    /// namespace are created at clone time.
    pub common: bool,
    /// Fresh network namespace, unshared by the child itself
    pub net: bool,
}

impl From<&GuardSpec> for NamespaceConfig {
    fn from(guard: &GuardSpec) -> Self {
        Self {
            common: guard.unshare_common,
            net: guard.unshare_network,
        }
    }
}

impl NamespaceConfig {
    /// Flags passed to clone. Empty when no general isolation is requested.
    #[must_use]
    pub fn to_clone_flags(&self) -> CloneFlags {
        if !self.common {
            return CloneFlags::empty();
        }
        CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC
    }

    /// Whether the child is PID 1 of its own PID namespace
    #[must_use]
    pub const fn new_pid_namespace(&self) -> bool {
        self.common
    }

    /// Enter a network namespace with only a down loopback. Runs in the child.
    pub fn enter_network(&self) -> Result<(), Errno> {
        if !self.net {
            return Ok(());
        }
        // SAFETY: unshare affects only the calling process
        Errno::result(unsafe { libc::unshare(libc::CLONE_NEWNET) }).map(drop)
    }

    /// Enter a cgroup namespace rooted at the current cgroup. Runs in the
    /// child once it has joined its cgroup.
    pub fn enter_cgroup(&self) -> Result<(), Errno> {
        if !self.common {
            return Ok(());
        }
        // SAFETY: unshare affects only the calling process
        Errno::result(unsafe { libc::unshare(libc::CLONE_NEWCGROUP) }).map(drop)
    }

    /// Stop mount propagation to the host and remount `/proc` for the new
    /// PID namespace. Runs in the child.
    pub fn isolate_mounts(&self) -> Result<(), Errno> {
        if !self.common {
            return Ok(());
        }
        make_private(c"/")?;
        mount_proc(c"/proc")
    }
}

fn make_private(path: &std::ffi::CStr) -> Result<(), Errno> {
    // SAFETY: propagation change on an existing mount point
    let ret = unsafe {
        libc::mount(
            std::ptr::null(),
            path.as_ptr(),
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        )
    };
    Errno::result(ret).map(drop)
}

fn mount_proc(target: &std::ffi::CStr) -> Result<(), Errno> {
    // SAFETY: mounting procfs onto an existing directory
    let ret = unsafe {
        libc::mount(
            c"proc".as_ptr(),
            target.as_ptr(),
            c"proc".as_ptr(),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            std::ptr::null(),
        )
    };
    Errno::result(ret).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_isolation_means_plain_fork() {
        let config = NamespaceConfig::from(&GuardSpec::default());
        assert!(config.to_clone_flags().is_empty());
        assert!(!config.new_pid_namespace());
    }

    #[test]
    fn common_flags_exclude_network_and_user() {
        let config = NamespaceConfig::from(&GuardSpec::default().unshare(true, false));
        let flags = config.to_clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS));
        // unshared by the child after it joins its cgroup
        assert!(!flags.contains(CloneFlags::CLONE_NEWCGROUP));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn network_is_independent_of_common() {
        let config = NamespaceConfig::from(&GuardSpec::default().unshare(false, true));
        assert!(config.net);
        assert!(config.to_clone_flags().is_empty());
    }
}
