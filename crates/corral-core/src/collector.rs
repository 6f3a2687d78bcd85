//! Final reap and outcome classification

use crate::monitor::{LimitPolicy, MonitorReport, Usage};
use crate::result::{ExecutionOutcome, KillReason, ResourceUsage, UnenforcedLimits};
use crate::scope::Scope;
use crate::{CorralError, Result};
use nix::errno::Errno;
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// How the child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
}

/// Status and kernel accounting of a reaped child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub termination: Termination,
    pub usage: Usage,
}

/// Reap the child exactly once and read its rusage
pub fn reap(pid: Pid) -> Result<Reaped> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain data
    let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        // SAFETY: valid out pointers for one wait4 call
        let ret = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut rusage) };
        match Errno::result(ret) {
            Ok(_) => break,
            Err(Errno::EINTR) => {}
            Err(e) => return Err(CorralError::Monitor(format!("wait4({pid}) failed: {e}"))),
        }
    }

    let termination = if libc::WIFEXITED(status) {
        Termination::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        Termination::Signaled(libc::WTERMSIG(status))
    } else {
        return Err(CorralError::Monitor(format!(
            "unexpected wait status {status:#x} for {pid}"
        )));
    };

    let cpu_time = timeval(rusage.ru_utime) + timeval(rusage.ru_stime);
    let peak_wset = u64::try_from(rusage.ru_maxrss).unwrap_or(0).saturating_mul(1024);

    Ok(Reaped {
        termination,
        usage: Usage {
            cpu_time,
            peak_wset,
        },
    })
}

fn timeval(tv: libc::timeval) -> Duration {
    let secs = u64::try_from(tv.tv_sec).unwrap_or(0);
    let micros = u32::try_from(tv.tv_usec).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(u64::from(micros))
}

/// Verdict part of an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub is_killed: bool,
    pub kill_reason: KillReason,
}

/// Decide exit code, signal and kill reason.
///
/// `SIGSYS` is always a policy kill. Otherwise an engine decision wins. A
/// `SIGXCPU` or `SIGKILL` without a decision counts as enforcement when the
/// final usage is over a limit, since the kernel backstop or a kill between
/// polls got there first. Any other signal is the program's own.
#[must_use]
pub fn classify(
    termination: Termination,
    decision: Option<KillReason>,
    usage: &ResourceUsage,
    policy: &LimitPolicy,
    unenforced: UnenforcedLimits,
) -> Verdict {
    let killed = |reason| (true, reason);
    let natural = (false, KillReason::None);

    match termination {
        Termination::Exited(code) => {
            let (is_killed, kill_reason) = decision.map_or(natural, killed);
            Verdict {
                exit_code: code,
                signal: None,
                is_killed,
                kill_reason,
            }
        }
        Termination::Signaled(sig) => {
            let (is_killed, kill_reason) = if sig == libc::SIGSYS {
                killed(KillReason::Security)
            } else if let Some(reason) = decision {
                killed(reason)
            } else if sig == libc::SIGXCPU || sig == libc::SIGKILL {
                let observed = Usage {
                    cpu_time: usage.cpu_time,
                    peak_wset: usage.peak_wset,
                };
                policy
                    .evaluate(&observed, usage.wall_time, unenforced)
                    .map_or(natural, killed)
            } else {
                natural
            };
            Verdict {
                exit_code: -1,
                signal: Some(sig),
                is_killed,
                kill_reason,
            }
        }
    }
}

/// Sweep the scope, reap the leader and assemble the outcome.
///
/// Nothing the program started outlives this call.
pub fn collect(
    scope: &mut Scope,
    started: Instant,
    report: &MonitorReport,
    policy: &LimitPolicy,
) -> Result<ExecutionOutcome> {
    scope.sweep();
    let reaped = reap(scope.leader())?;

    let measured = reaped.usage.max(report.usage);
    let usage = ResourceUsage {
        wall_time: report.exited_at.saturating_duration_since(started),
        cpu_time: measured.cpu_time,
        peak_wset: measured.peak_wset,
    };

    let verdict = classify(
        reaped.termination,
        report.decision,
        &usage,
        policy,
        report.unenforced,
    );

    Ok(ExecutionOutcome {
        exit_code: verdict.exit_code,
        signal: verdict.signal,
        is_killed: verdict.is_killed,
        kill_reason: verdict.kill_reason,
        usage,
        unenforced: report.unenforced,
        launch_error: None,
    })
}
