//! Resource monitor
//!
//! A waiter thread blocks in `waitid(WEXITED | WNOWAIT)` and reports the
//! child's exit without reaping it. The calling thread is the observer: it
//! samples `/proc`, evaluates limits and makes the single termination
//! decision. Only the observer signals the child, and only while it is
//! unreaped.
//!
//! Usage covers the whole [`Scope`]: CPU time is summed over the leader and
//! its live members, and the working set is the larger of the leader's own
//! peak and the combined resident size.

use crate::config::{EngineConfig, LimitSpec};
use crate::procfs;
use crate::result::{KillReason, UnenforcedLimits};
use crate::scope::{Member, Scope};
use crate::{CorralError, Result};
use nix::sys::signal::Signal;
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};
use nix::unistd::Pid;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Latest resource measurement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub cpu_time: Duration,
    pub peak_wset: u64,
}

impl Usage {
    /// Component-wise maximum
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self {
            cpu_time: self.cpu_time.max(other.cpu_time),
            peak_wset: self.peak_wset.max(other.peak_wset),
        }
    }
}

/// The three numeric limits with a pure evaluation rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitPolicy {
    pub real_time: Option<Duration>,
    pub proc_time: Option<Duration>,
    pub proc_wset: Option<u64>,
}

impl LimitPolicy {
    #[must_use]
    pub const fn from_limits(limits: &LimitSpec) -> Self {
        Self {
            real_time: limits.real_time(),
            proc_time: limits.proc_time(),
            proc_wset: limits.proc_wset(),
        }
    }

    /// First exceeded limit by precedence: working set, CPU time, wall time.
    ///
    /// Limits trigger strictly above their value. Channels in `unenforced`
    /// never trigger.
    #[must_use]
    pub fn evaluate(
        &self,
        usage: &Usage,
        elapsed: Duration,
        unenforced: UnenforcedLimits,
    ) -> Option<KillReason> {
        if !unenforced.proc_wset && self.proc_wset.is_some_and(|max| usage.peak_wset > max) {
            return Some(KillReason::ProcWSet);
        }
        if !unenforced.proc_time && self.proc_time.is_some_and(|max| usage.cpu_time > max) {
            return Some(KillReason::ProcTime);
        }
        if self.real_time.is_some_and(|max| elapsed > max) {
            return Some(KillReason::RealTime);
        }
        None
    }

    /// Whether `/proc` needs polling at all
    #[must_use]
    pub const fn needs_sampling(&self) -> bool {
        self.proc_time.is_some() || self.proc_wset.is_some()
    }
}

/// Consecutive-failure counter for one metric source
#[derive(Debug, Clone, Copy)]
struct Channel {
    failures: u32,
    retries: u32,
    degraded: bool,
}

impl Channel {
    const fn new(retries: u32) -> Self {
        Self {
            failures: 0,
            retries,
            degraded: false,
        }
    }

    /// Record one read. Returns true the moment the channel degrades.
    fn record(&mut self, ok: bool) -> bool {
        if self.degraded {
            return false;
        }
        if ok {
            self.failures = 0;
            return false;
        }
        self.failures += 1;
        if self.failures >= self.retries.max(1) {
            self.degraded = true;
            return true;
        }
        false
    }
}

/// Polls `/proc/<pid>` and tracks per-channel health
#[derive(Debug)]
pub struct Sampler {
    pid: Pid,
    policy: LimitPolicy,
    cpu: Channel,
    wset: Channel,
    last: Usage,
}

impl Sampler {
    #[must_use]
    pub const fn new(pid: Pid, policy: LimitPolicy, retries: u32) -> Self {
        Self {
            pid,
            policy,
            cpu: Channel::new(retries),
            wset: Channel::new(retries),
            last: Usage {
                cpu_time: Duration::ZERO,
                peak_wset: 0,
            },
        }
    }

    /// Take one measurement of the scope. A zombie leader is not sampled:
    /// its memory lines are gone and its counters are final.
    ///
    /// Only reads of the leader count toward channel health; members come
    /// and go between reads.
    pub fn tick(&mut self, scope: &mut Scope) {
        let stat = procfs::read_stat(self.pid);
        if matches!(&stat, Ok(s) if s.is_zombie()) {
            return;
        }
        let mem = procfs::read_mem(self.pid);
        let members = scope.members();

        let cpu = stat.map(|s| s.cpu_time + members_cpu(&members));
        let wset = mem.map(|m| m.peak().max(m.rss.saturating_add(members_rss(&members))));
        self.apply(cpu, wset);
    }

    fn apply(&mut self, cpu: std::io::Result<Duration>, wset: std::io::Result<u64>) {
        if let Ok(cpu_time) = &cpu {
            self.last.cpu_time = self.last.cpu_time.max(*cpu_time);
        }
        if let Ok(peak) = &wset {
            self.last.peak_wset = self.last.peak_wset.max(*peak);
        }

        if self.cpu.record(cpu.is_ok()) && self.policy.proc_time.is_some() {
            tracing::warn!(
                pid = %self.pid,
                error = %cpu.as_ref().err().map(ToString::to_string).unwrap_or_default(),
                "cpu time unreadable, limit no longer enforced"
            );
        }
        if self.wset.record(wset.is_ok()) && self.policy.proc_wset.is_some() {
            tracing::warn!(
                pid = %self.pid,
                error = %wset.as_ref().err().map(ToString::to_string).unwrap_or_default(),
                "working set unreadable, limit no longer enforced"
            );
        }
    }

    #[must_use]
    pub const fn last(&self) -> Usage {
        self.last
    }

    /// Degraded channels whose limit is configured
    #[must_use]
    pub const fn unenforced(&self) -> UnenforcedLimits {
        UnenforcedLimits {
            proc_time: self.cpu.degraded && self.policy.proc_time.is_some(),
            proc_wset: self.wset.degraded && self.policy.proc_wset.is_some(),
        }
    }
}

/// CPU time of live members, their reaped children included
fn members_cpu(members: &[Member]) -> Duration {
    members.iter().map(|m| m.stat.cpu_time).sum()
}

/// Resident size of live members; ones that vanish mid-read count as zero
fn members_rss(members: &[Member]) -> u64 {
    members
        .iter()
        .filter_map(|m| procfs::read_mem(m.pid).ok())
        .fold(0, |total, mem| total.saturating_add(mem.rss))
}

/// Exit notification from the waiter thread
pub type ExitNotice = std::result::Result<(), nix::Error>;

/// Start the waiter thread for `pid`
pub fn spawn_waiter(pid: Pid) -> Result<(JoinHandle<()>, Receiver<ExitNotice>)> {
    let (tx, rx) = mpsc::channel();
    let handle = std::thread::Builder::new()
        .name(format!("corral-wait-{pid}"))
        .spawn(move || {
            let notice = loop {
                match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                    Err(nix::Error::EINTR) => {}
                    Ok(_) => break Ok(()),
                    Err(e) => break Err(e),
                }
            };
            // the observer may already be gone on its error path
            let _ = tx.send(notice);
        })
        .map_err(|e| CorralError::Monitor(format!("failed to start waiter thread: {e}")))?;
    Ok((handle, rx))
}

/// What the observer saw
#[derive(Debug, Clone, Copy)]
pub struct MonitorReport {
    /// The termination decision, if one was made
    pub decision: Option<KillReason>,
    /// When the exit was observed
    pub exited_at: Instant,
    pub usage: Usage,
    pub unenforced: UnenforcedLimits,
}

/// Observer side of the monitor
#[derive(Debug)]
pub struct Monitor<'a> {
    scope: &'a mut Scope,
    started: Instant,
    policy: LimitPolicy,
    poll_interval: Duration,
    kill_grace: Duration,
    sampler: Sampler,
}

impl<'a> Monitor<'a> {
    #[must_use]
    pub fn new(
        scope: &'a mut Scope,
        started: Instant,
        policy: LimitPolicy,
        config: &EngineConfig,
    ) -> Self {
        let pid = scope.leader();
        Self {
            scope,
            started,
            policy,
            poll_interval: config.poll_interval,
            kill_grace: config.kill_grace,
            sampler: Sampler::new(pid, policy, config.metric_retries),
        }
    }

    /// Observe until the waiter reports the exit
    pub fn watch(mut self, exits: &Receiver<ExitNotice>) -> MonitorReport {
        let mut decision: Option<KillReason> = None;
        let mut escalate_at: Option<Instant> = None;

        loop {
            let timeout = self.next_wakeup(decision.is_some(), escalate_at);
            match exits.recv_timeout(timeout) {
                Ok(Err(e)) => {
                    tracing::warn!(pid = %self.pid(), error = %e, "waiter failed, treating child as exited");
                    break;
                }
                Ok(Ok(())) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if let Some(deadline) = escalate_at {
                if Instant::now() >= deadline {
                    tracing::warn!(pid = %self.pid(), "grace period elapsed, sending SIGKILL");
                    self.scope.signal(Signal::SIGKILL);
                    escalate_at = None;
                }
                continue;
            }
            if decision.is_some() {
                continue;
            }

            if self.policy.needs_sampling() {
                self.sampler.tick(self.scope);
            } else {
                self.scope.track();
            }
            let Some(reason) = self.policy.evaluate(
                &self.sampler.last(),
                self.started.elapsed(),
                self.sampler.unenforced(),
            ) else {
                continue;
            };

            if !self.still_running() {
                // exited on its own; the waiter's message is on its way
                continue;
            }

            tracing::info!(pid = %self.pid(), reason = %reason, "limit exceeded, terminating");
            decision = Some(reason);
            if self.kill_grace.is_zero() {
                self.scope.signal(Signal::SIGKILL);
            } else {
                self.scope.signal(Signal::SIGTERM);
                escalate_at = Some(Instant::now() + self.kill_grace);
            }
        }

        let exited_at = Instant::now();
        MonitorReport {
            decision,
            exited_at,
            usage: self.sampler.last(),
            unenforced: self.sampler.unenforced(),
        }
    }

    fn next_wakeup(&self, decided: bool, escalate_at: Option<Instant>) -> Duration {
        let now = Instant::now();
        let mut wait = self.poll_interval;
        if let Some(deadline) = escalate_at {
            wait = wait.min(deadline.saturating_duration_since(now));
        }
        if let (false, Some(limit)) = (decided, self.policy.real_time) {
            // wake just past the wall deadline, the limit is strict
            let deadline = self.started + limit + Duration::from_millis(1);
            if deadline > now {
                wait = wait.min(deadline - now);
            }
        }
        wait
    }

    fn pid(&self) -> Pid {
        self.scope.leader()
    }

    /// Non-reaping liveness check
    fn still_running(&self) -> bool {
        matches!(
            waitid(
                Id::Pid(self.pid()),
                WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT | WaitPidFlag::WNOHANG
            ),
            Ok(WaitStatus::StillAlive)
        )
    }
}
