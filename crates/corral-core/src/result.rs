//! Execution outcome types

use crate::error::LaunchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why the child stopped running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum KillReason {
    /// The engine failed before the program image loaded
    Unset = -1,
    /// The program exited (or died) on its own
    None = 0,
    /// Syscall policy violation
    Security = 1,
    /// Wall-clock limit
    RealTime = 2,
    /// CPU time limit
    ProcTime = 3,
    /// Working-set limit
    ProcWSet = 4,
}

impl KillReason {
    /// Stable integer code used at the C boundary
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => Self::Unset,
            0 => Self::None,
            1 => Self::Security,
            2 => Self::RealTime,
            3 => Self::ProcTime,
            4 => Self::ProcWSet,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::None => "none",
            Self::Security => "security",
            Self::RealTime => "real-time",
            Self::ProcTime => "proc-time",
            Self::ProcWSet => "proc-wset",
        }
    }
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resources consumed by the child
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Wall time from child creation to exit
    pub wall_time: Duration,

    /// User + system CPU time, including reaped descendants
    pub cpu_time: Duration,

    /// Peak resident set size in bytes
    pub peak_wset: u64,
}

impl ResourceUsage {
    /// Wall time in whole milliseconds
    #[must_use]
    pub fn real_time_ms(&self) -> u64 {
        u64::try_from(self.wall_time.as_millis()).unwrap_or(u64::MAX)
    }

    /// CPU time in whole milliseconds
    #[must_use]
    pub fn proc_time_ms(&self) -> u64 {
        u64::try_from(self.cpu_time.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Limit channels that could not be enforced for the whole run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnenforcedLimits {
    pub proc_time: bool,
    pub proc_wset: bool,
}

impl UnenforcedLimits {
    pub const PROC_TIME_BIT: u32 = 1 << 0;
    pub const PROC_WSET_BIT: u32 = 1 << 1;

    #[must_use]
    pub const fn any(&self) -> bool {
        self.proc_time || self.proc_wset
    }

    /// Bit mask form used at the C boundary
    #[must_use]
    pub const fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.proc_time {
            bits |= Self::PROC_TIME_BIT;
        }
        if self.proc_wset {
            bits |= Self::PROC_WSET_BIT;
        }
        bits
    }
}

/// Final, immutable report of one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Exit code, or -1 when the child did not exit normally
    pub exit_code: i32,

    /// Terminating signal, if any
    pub signal: Option<i32>,

    /// The engine forcibly terminated the child
    pub is_killed: bool,

    pub kill_reason: KillReason,

    pub usage: ResourceUsage,

    /// Limit channels that degraded to unenforced
    pub unenforced: UnenforcedLimits,

    /// Set only for launch failures
    pub launch_error: Option<LaunchError>,
}

impl ExecutionOutcome {
    /// Outcome for an invocation that never reached the program image
    #[must_use]
    pub fn launch_failed(error: LaunchError) -> Self {
        Self {
            exit_code: -1,
            signal: None,
            is_killed: false,
            kill_reason: KillReason::Unset,
            usage: ResourceUsage::default(),
            unenforced: UnenforcedLimits::default(),
            launch_error: Some(error),
        }
    }

    #[must_use]
    pub const fn is_launch_failure(&self) -> bool {
        matches!(self.kill_reason, KillReason::Unset)
    }

    /// Exit code 0, not killed, no signal
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0
            && self.signal.is_none()
            && !self.is_killed
            && matches!(self.kill_reason, KillReason::None)
    }
}
