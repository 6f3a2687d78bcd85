//! Per-run cgroup v2 leaf
//!
//! The parent creates `<root>/run-<pid>-<n>` and opens its `cgroup.procs`.
//! The child writes `0` to that descriptor before exec, which moves itself
//! in. Everything it forks later lands in the same leaf, whatever session or
//! process group it escapes to, so teardown can reach all of it.

use crate::{CorralError, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::statfs::{CGROUP2_SUPER_MAGIC, statfs};
use nix::unistd::Pid;
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_LEAF: AtomicU64 = AtomicU64::new(0);

/// How often removal is retried while the leaf drains
const REMOVE_ATTEMPTS: u32 = 100;
const REMOVE_BACKOFF: Duration = Duration::from_millis(2);

/// A cgroup owned by one invocation, killed and removed on drop
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
    procs: Option<File>,
}

impl Cgroup {
    /// Create a fresh leaf under `root`.
    ///
    /// Fails when `root` is not on a cgroup v2 hierarchy or cannot be
    /// written, which is the normal case for unprivileged engines.
    pub fn create(root: &Path) -> Result<Self> {
        if !on_cgroup2(root) {
            return Err(CorralError::Cgroup(format!(
                "{} is not on a cgroup2 mount",
                root.display()
            )));
        }
        fs::create_dir_all(root)
            .map_err(|e| CorralError::Cgroup(format!("cannot create {}: {e}", root.display())))?;

        let leaf = format!(
            "run-{}-{}",
            std::process::id(),
            NEXT_LEAF.fetch_add(1, Ordering::Relaxed)
        );
        let path = root.join(leaf);
        fs::create_dir(&path)
            .map_err(|e| CorralError::Cgroup(format!("cannot create {}: {e}", path.display())))?;

        let procs = match OpenOptions::new().write(true).open(path.join("cgroup.procs")) {
            Ok(file) => file,
            Err(e) => {
                let _ = fs::remove_dir(&path);
                return Err(CorralError::Cgroup(format!(
                    "cannot open {}/cgroup.procs: {e}",
                    path.display()
                )));
            }
        };

        tracing::debug!(cgroup = %path.display(), "cgroup created");
        Ok(Self {
            path,
            procs: Some(procs),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Descriptor the child passes to [`join`]. Close-on-exec.
    #[must_use]
    pub fn procs_fd(&self) -> Option<RawFd> {
        self.procs.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Processes currently in the leaf
    pub fn pids(&self) -> std::io::Result<Vec<Pid>> {
        let contents = fs::read_to_string(self.path.join("cgroup.procs"))?;
        Ok(contents
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .map(Pid::from_raw)
            .collect())
    }

    /// Whether any live process is left, from `cgroup.events`
    pub fn populated(&self) -> std::io::Result<bool> {
        let events = fs::read_to_string(self.path.join("cgroup.events"))?;
        Ok(events.lines().any(|line| line.trim() == "populated 1"))
    }

    /// SIGKILL every process in the leaf.
    ///
    /// Uses `cgroup.kill` where the kernel has it (5.14+), otherwise signals
    /// each listed process.
    pub fn kill(&self) {
        if fs::write(self.path.join("cgroup.kill"), "1").is_ok() {
            return;
        }
        match self.pids() {
            Ok(pids) => {
                for pid in pids {
                    if let Err(e) = kill(pid, Signal::SIGKILL) {
                        if e != Errno::ESRCH {
                            tracing::debug!(pid = %pid, error = %e, "kill failed");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!(cgroup = %self.path.display(), error = %e, "cannot list cgroup");
            }
        }
    }
}

impl Drop for Cgroup {
    fn drop(&mut self) {
        drop(self.procs.take());
        for _ in 0..REMOVE_ATTEMPTS {
            self.kill();
            match fs::remove_dir(&self.path) {
                Ok(()) => {
                    tracing::debug!(cgroup = %self.path.display(), "cgroup removed");
                    return;
                }
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    std::thread::sleep(REMOVE_BACKOFF);
                }
                Err(e) => {
                    tracing::warn!(cgroup = %self.path.display(), error = %e, "failed to remove cgroup");
                    return;
                }
            }
        }
        tracing::warn!(cgroup = %self.path.display(), "cgroup still populated, left in place");
    }
}

/// Move the calling process into the cgroup behind `procs_fd`.
///
/// Runs in the child: one `write(2)`, no allocation.
pub fn join(procs_fd: RawFd) -> std::result::Result<(), Errno> {
    let pid = b"0";
    // SAFETY: writes a one-byte buffer that outlives the call
    let written = unsafe { libc::write(procs_fd, pid.as_ptr().cast(), pid.len()) };
    Errno::result(written).map(drop)
}

/// Whether the nearest existing ancestor of `path` is a cgroup2 mount
fn on_cgroup2(path: &Path) -> bool {
    path.ancestors()
        .find(|dir| dir.exists())
        .and_then(|dir| statfs(dir).ok())
        .is_some_and(|mount| mount.filesystem_type() == CGROUP2_SUPER_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_directories_are_not_cgroups() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("corral");
        let err = Cgroup::create(&root).unwrap_err();
        assert!(matches!(err, CorralError::Cgroup(_)));
        assert!(!root.exists(), "nothing is created off a cgroup2 mount");
    }

    #[test]
    fn leaf_is_created_and_removed() {
        let root = Path::new(crate::config::DEFAULT_CGROUP_ROOT);
        // only meaningful with a writable cgroup2 hierarchy
        let Ok(cgroup) = Cgroup::create(root) else {
            return;
        };
        let path = cgroup.path().to_path_buf();
        assert!(path.join("cgroup.procs").exists());
        assert!(cgroup.procs_fd().is_some());
        assert!(cgroup.pids().unwrap().is_empty());
        assert!(!cgroup.populated().unwrap());

        drop(cgroup);
        assert!(!path.exists());
    }

    #[test]
    fn leaf_names_are_unique() {
        let root = Path::new(crate::config::DEFAULT_CGROUP_ROOT);
        let (Ok(a), Ok(b)) = (Cgroup::create(root), Cgroup::create(root)) else {
            return;
        };
        assert_ne!(a.path(), b.path());
    }
}
