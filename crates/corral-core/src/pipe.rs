//! Launch handshake between the engine and its child
//!
//! The child holds the close-on-exec write end. A successful exec closes it,
//! so the parent reads EOF. A failed setup step writes one 8-byte report
//! (`stage: u32`, `errno: i32`, native endian) and exits.

use crate::error::SetupStage;
use crate::{CorralError, Result};
use nix::errno::Errno;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::{Duration, Instant};

/// Size of a failure report
pub const REPORT_LEN: usize = 8;

/// What the parent learned from the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// The program image loaded
    Launched,
    /// A setup step failed in the child
    Failed { stage: SetupStage, errno: Errno },
    /// Neither EOF nor a report arrived in time
    TimedOut,
}

/// Both ends of a fresh handshake pipe
#[derive(Debug)]
pub struct LaunchPipe {
    read: File,
    write: File,
}

impl LaunchPipe {
    pub fn new() -> Result<Self> {
        let (read, write) = create_pipe()?;
        Ok(Self { read, write })
    }

    /// Descriptor the child reports on
    #[must_use]
    pub fn child_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Close the parent's copy of the write end
    #[must_use]
    pub fn into_parent(self) -> ParentPipe {
        drop(self.write);
        ParentPipe { read: self.read }
    }
}

/// Read end held by the parent after the child exists
#[derive(Debug)]
pub struct ParentPipe {
    read: File,
}

impl ParentPipe {
    /// Wait for EOF or a failure report, bounded by `timeout`
    pub fn wait(mut self, timeout: Duration) -> Result<Handshake> {
        let deadline = Instant::now() + timeout;
        let mut report = [0u8; REPORT_LEN];
        let mut filled = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Handshake::TimedOut);
            }
            if !self.poll_readable(remaining)? {
                continue;
            }

            match self.read.read(&mut report[filled..]) {
                Ok(0) if filled == 0 => return Ok(Handshake::Launched),
                Ok(0) => {
                    return Err(CorralError::Spawn(format!(
                        "truncated launch report ({filled} bytes)"
                    )));
                }
                Ok(n) => {
                    filled += n;
                    if filled == REPORT_LEN {
                        return Ok(decode_report(report));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(CorralError::Io(e)),
            }
        }
    }

    fn poll_readable(&self, timeout: Duration) -> Result<bool> {
        let mut fds = libc::pollfd {
            fd: self.read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = libc::c_int::try_from(timeout.as_millis().max(1)).unwrap_or(libc::c_int::MAX);
        // SAFETY: one valid pollfd
        match unsafe { libc::poll(&mut fds, 1, ms) } {
            -1 if Errno::last() == Errno::EINTR => Ok(false),
            -1 => Err(CorralError::Io(std::io::Error::last_os_error())),
            0 => Ok(false),
            _ => Ok(true),
        }
    }
}

fn decode_report(report: [u8; REPORT_LEN]) -> Handshake {
    let stage = u32::from_ne_bytes([report[0], report[1], report[2], report[3]]);
    let errno = i32::from_ne_bytes([report[4], report[5], report[6], report[7]]);
    Handshake::Failed {
        stage: SetupStage::from_code(stage).unwrap_or(SetupStage::Exec),
        errno: Errno::from_raw(errno),
    }
}

/// Report a failed setup step. Runs in the child, no allocation.
pub fn report_failure(fd: RawFd, stage: SetupStage, errno: Errno) {
    let mut report = [0u8; REPORT_LEN];
    report[..4].copy_from_slice(&(stage as u32).to_ne_bytes());
    report[4..].copy_from_slice(&(errno as i32).to_ne_bytes());
    // SAFETY: writing a stack buffer; a short write only loses the detail
    unsafe {
        libc::write(fd, report.as_ptr().cast(), REPORT_LEN);
    }
}

/// Create a pipe (returns read end, write end)
fn create_pipe() -> Result<(File, File)> {
    let mut fds = [0i32; 2];

    // SAFETY: pipe2 syscall
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };

    if ret != 0 {
        return Err(CorralError::Io(std::io::Error::last_os_error()));
    }

    // SAFETY: We just created these file descriptors
    let read_end = unsafe { File::from_raw_fd(fds[0]) };
    let write_end = unsafe { File::from_raw_fd(fds[1]) };

    Ok((read_end, write_end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_write_end_means_launched() {
        let pipe = LaunchPipe::new().unwrap();
        let parent = pipe.into_parent();
        assert_eq!(
            parent.wait(Duration::from_secs(1)).unwrap(),
            Handshake::Launched
        );
    }

    #[test]
    fn report_is_decoded() {
        let pipe = LaunchPipe::new().unwrap();
        report_failure(pipe.child_fd(), SetupStage::WorkingDir, Errno::ENOENT);
        let parent = pipe.into_parent();
        assert_eq!(
            parent.wait(Duration::from_secs(1)).unwrap(),
            Handshake::Failed {
                stage: SetupStage::WorkingDir,
                errno: Errno::ENOENT,
            }
        );
    }

    #[test]
    fn open_write_end_times_out() {
        let (read, write) = create_pipe().unwrap();
        let parent = ParentPipe { read };
        let started = Instant::now();
        assert_eq!(
            parent.wait(Duration::from_millis(50)).unwrap(),
            Handshake::TimedOut
        );
        assert!(started.elapsed() >= Duration::from_millis(50));
        drop(write);
    }

    #[test]
    fn pipe_ends_are_close_on_exec() {
        let pipe = LaunchPipe::new().unwrap();
        let flags = unsafe { libc::fcntl(pipe.child_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }
}
