//! The set of processes one invocation owns
//!
//! The leader is the spawned child. Members are everything it forked that
//! is still alive, including processes that left its process group or
//! session. With a cgroup the kernel keeps that list; without one the
//! scope walks `/proc` on every call and remembers each descendant by pid
//! and start time, so an orphan reparented away from the leader is still
//! found and a recycled pid is not.

use crate::isolation::Cgroup;
use crate::procfs::{self, ProcStat};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::time::Duration;

/// Kill rounds during a sweep, for members forked while it runs
const SWEEP_ROUNDS: u32 = 20;
const SWEEP_BACKOFF: Duration = Duration::from_millis(1);

/// A live process of the scope other than the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub pid: Pid,
    pub stat: ProcStat,
}

#[derive(Debug)]
pub struct Scope {
    leader: Pid,
    cgroup: Option<Cgroup>,
    /// Descendants seen so far, with their start time
    tracked: HashMap<Pid, u64>,
}

impl Scope {
    #[must_use]
    pub fn new(leader: Pid, cgroup: Option<Cgroup>) -> Self {
        Self {
            leader,
            cgroup,
            tracked: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn leader(&self) -> Pid {
        self.leader
    }

    /// Whether membership comes from a cgroup
    #[must_use]
    pub const fn has_cgroup(&self) -> bool {
        self.cgroup.is_some()
    }

    /// Keep the cgroup only if the leader actually joined it.
    ///
    /// Call once the child has passed its setup.
    pub fn confirm_cgroup(&mut self) {
        let Some(cgroup) = &self.cgroup else {
            return;
        };
        match cgroup.pids() {
            Ok(pids) if pids.contains(&self.leader) => {}
            // an exited leader is no longer listed
            Ok(_) if !self.leader_alive() => {}
            Ok(_) => {
                tracing::warn!(
                    pid = %self.leader,
                    cgroup = %cgroup.path().display(),
                    "child is not in its cgroup, tracking descendants through /proc"
                );
                self.cgroup = None;
            }
            Err(e) => {
                tracing::warn!(
                    pid = %self.leader,
                    error = %e,
                    "cgroup unreadable, tracking descendants through /proc"
                );
                self.cgroup = None;
            }
        }
    }

    fn leader_alive(&self) -> bool {
        procfs::read_stat(self.leader).is_ok_and(|stat| !stat.is_zombie())
    }

    /// Live members, zombies excluded
    pub fn members(&mut self) -> Vec<Member> {
        if let Some(members) = self.cgroup_members() {
            return members;
        }

        let table = match procfs::processes() {
            Ok(table) => table,
            Err(e) => {
                tracing::debug!(error = %e, "cannot scan /proc");
                HashMap::new()
            }
        };
        for pid in procfs::descendants(&table, self.leader) {
            if let Some(stat) = table.get(&pid) {
                self.tracked.insert(pid, stat.start_ticks);
            }
        }
        self.tracked.retain(|pid, start| {
            table
                .get(pid)
                .is_some_and(|stat| stat.start_ticks == *start && !stat.is_zombie())
        });
        self.tracked
            .keys()
            .filter_map(|&pid| table.get(&pid).map(|&stat| Member { pid, stat }))
            .collect()
    }

    fn cgroup_members(&self) -> Option<Vec<Member>> {
        let pids = match self.cgroup.as_ref()?.pids() {
            Ok(pids) => pids,
            Err(e) => {
                tracing::debug!(error = %e, "cannot list cgroup, scanning /proc");
                return None;
            }
        };
        Some(
            pids.into_iter()
                .filter(|&pid| pid != self.leader)
                .filter_map(|pid| {
                    let stat = procfs::read_stat(pid).ok()?;
                    (!stat.is_zombie()).then_some(Member { pid, stat })
                })
                .collect(),
        )
    }

    /// Record descendants without reading their usage
    pub fn track(&mut self) {
        if self.cgroup.is_none() {
            self.members();
        }
    }

    /// Signal the leader's process group, the leader and every member
    pub fn signal(&mut self, signal: Signal) {
        if signal == Signal::SIGKILL {
            if let Some(cgroup) = &self.cgroup {
                cgroup.kill();
            }
        }
        let members = self.members();
        signal_group(self.leader, signal);
        for member in members {
            signal_pid(member.pid, signal);
        }
    }

    /// SIGKILL everything in the scope until no member is left.
    ///
    /// Must run before the leader is reaped: its zombie keeps the process
    /// group id reserved.
    pub fn sweep(&mut self) {
        for _ in 0..SWEEP_ROUNDS {
            self.signal(Signal::SIGKILL);
            if self.members().is_empty() {
                return;
            }
            std::thread::sleep(SWEEP_BACKOFF);
        }
        tracing::warn!(pid = %self.leader, "members still alive after sweep");
    }
}

/// Signal a process and its process group, ignoring `ESRCH`
fn signal_group(pid: Pid, signal: Signal) {
    if let Err(e) = killpg(pid, signal) {
        if e != Errno::ESRCH {
            tracing::debug!(pid = %pid, %signal, error = %e, "killpg failed");
        }
    }
    signal_pid(pid, signal);
}

fn signal_pid(pid: Pid, signal: Signal) {
    if let Err(e) = kill(pid, signal) {
        if e != Errno::ESRCH {
            tracing::debug!(pid = %pid, %signal, error = %e, "kill failed");
        }
    }
}
