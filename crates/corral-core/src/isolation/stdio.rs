//! Standard stream redirection and descriptor hygiene

use crate::normalize::{StderrTarget, StdioRequest};
use crate::{CorralError, Result};
use nix::errno::Errno;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// `close_range` flag: mark instead of close (Linux 5.11+)
const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

/// Upper bound for the `fcntl` fallback walk
const FALLBACK_FD_LIMIT: RawFd = 1 << 16;

/// Redirection files opened by the parent.
///
/// Every descriptor is close-on-exec and numbered 3 or above, so the child's
/// `dup2` onto 0-2 never clobbers a source it still needs.
#[derive(Debug, Default)]
pub struct StdioFiles {
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
    stderr_to_stdout: bool,
}

impl StdioFiles {
    pub fn open(request: &StdioRequest) -> Result<Self> {
        let stdin = request
            .stdin
            .as_deref()
            .map(|path| open_checked(path, OpenOptions::new().read(true)))
            .transpose()?;
        let stdout = request.stdout.as_deref().map(open_output).transpose()?;
        let (stderr, stderr_to_stdout) = match &request.stderr {
            StderrTarget::Inherit => (None, false),
            StderrTarget::File(path) => (Some(open_output(path)?), false),
            StderrTarget::Stdout => (None, true),
        };

        Ok(Self {
            stdin,
            stdout,
            stderr,
            stderr_to_stdout,
        })
    }

    /// Raw view for the child. Valid while `self` is alive.
    #[must_use]
    pub fn plan(&self) -> StdioPlan {
        let raw = |fd: &Option<OwnedFd>| fd.as_ref().map_or(-1, AsRawFd::as_raw_fd);
        StdioPlan {
            stdin: raw(&self.stdin),
            stdout: raw(&self.stdout),
            stderr: raw(&self.stderr),
            stderr_to_stdout: self.stderr_to_stdout,
        }
    }
}

fn open_output(path: &Path) -> Result<OwnedFd> {
    open_checked(
        path,
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644),
    )
}

fn open_checked(path: &Path, options: &mut OpenOptions) -> Result<OwnedFd> {
    let file = options
        .custom_flags(libc::O_CLOEXEC)
        .open(path)
        .map_err(|e| CorralError::Stdio(format!("cannot open {}: {e}", path.display())))?;
    above_stdio(file.into())
}

/// Move a descriptor to 3 or above if it landed on 0-2
fn above_stdio(fd: OwnedFd) -> Result<OwnedFd> {
    if fd.as_raw_fd() > 2 {
        return Ok(fd);
    }
    // SAFETY: fd is valid, F_DUPFD_CLOEXEC returns a new descriptor we own
    let dup = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 3) };
    if dup < 0 {
        return Err(CorralError::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: dup is a freshly created descriptor
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Raw descriptors the child installs on 0, 1 and 2. `-1` means inherit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdioPlan {
    stdin: RawFd,
    stdout: RawFd,
    stderr: RawFd,
    stderr_to_stdout: bool,
}

impl StdioPlan {
    pub const INHERIT: Self = Self {
        stdin: -1,
        stdout: -1,
        stderr: -1,
        stderr_to_stdout: false,
    };

    /// Runs in the child, no allocation
    pub fn apply(&self) -> std::result::Result<(), Errno> {
        install(self.stdin, libc::STDIN_FILENO)?;
        install(self.stdout, libc::STDOUT_FILENO)?;
        if self.stderr_to_stdout {
            install(libc::STDOUT_FILENO, libc::STDERR_FILENO)?;
        } else {
            install(self.stderr, libc::STDERR_FILENO)?;
        }
        Ok(())
    }
}

fn install(src: RawFd, dst: RawFd) -> std::result::Result<(), Errno> {
    if src < 0 {
        return Ok(());
    }
    // SAFETY: dup2 on descriptors owned by this process
    unsafe {
        if src == dst {
            // dup2 onto itself keeps the flags, clear close-on-exec by hand
            let flags = Errno::result(libc::fcntl(src, libc::F_GETFD))?;
            Errno::result(libc::fcntl(src, libc::F_SETFD, flags & !libc::FD_CLOEXEC))?;
        } else {
            Errno::result(libc::dup2(src, dst))?;
        }
    }
    Ok(())
}

/// Mark every descriptor from `first` upward close-on-exec.
///
/// Runs in the child, no allocation. Falls back to an `fcntl` walk on
/// kernels without `CLOSE_RANGE_CLOEXEC`.
pub fn mark_cloexec_from(first: RawFd) -> std::result::Result<(), Errno> {
    let Ok(first_u) = libc::c_uint::try_from(first) else {
        return Err(Errno::EINVAL);
    };
    // SAFETY: close_range only changes descriptor flags here
    let ret = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            first_u,
            libc::c_uint::MAX,
            CLOSE_RANGE_CLOEXEC,
        )
    };
    if ret == 0 {
        return Ok(());
    }

    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: rlim is a valid out pointer
    let limit = if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } == 0 {
        RawFd::try_from(rlim.rlim_cur).unwrap_or(FALLBACK_FD_LIMIT).min(FALLBACK_FD_LIMIT)
    } else {
        FALLBACK_FD_LIMIT
    };

    for fd in first..limit {
        // SAFETY: fcntl on a possibly closed descriptor only returns EBADF
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags >= 0 && flags & libc::FD_CLOEXEC == 0 {
                Errno::result(libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opened_files_sit_above_stdio_and_close_on_exec() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        std::fs::write(&input, "hello").unwrap();

        let request = StdioRequest {
            stdin: Some(input),
            stdout: Some(dir.path().join("out.txt")),
            stderr: StderrTarget::Stdout,
        };
        let files = StdioFiles::open(&request).unwrap();
        let plan = files.plan();

        for fd in [plan.stdin, plan.stdout] {
            assert!(fd > 2);
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }
        assert_eq!(plan.stderr, -1);
        assert!(plan.stderr_to_stdout);
        assert!(dir.path().join("out.txt").exists());
    }

    #[test]
    fn output_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        std::fs::write(&out, "stale contents").unwrap();

        let request = StdioRequest {
            stdin: None,
            stdout: Some(out.clone()),
            stderr: StderrTarget::Inherit,
        };
        drop(StdioFiles::open(&request).unwrap());
        assert_eq!(std::fs::read(&out).unwrap().len(), 0);
    }

    #[test]
    fn missing_stdin_fails_to_open() {
        let request = StdioRequest {
            stdin: Some("/nonexistent/corral-in".into()),
            stdout: None,
            stderr: StderrTarget::Inherit,
        };
        assert!(matches!(
            StdioFiles::open(&request),
            Err(CorralError::Stdio(_))
        ));
    }
}
