//! Execution request records and engine configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// What to run and as whom
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramSpec {
    /// Path to the executable, used as given (no `PATH` lookup)
    pub program_path: PathBuf,

    /// Arguments passed after `argv[0]`
    pub args: Vec<String>,

    /// Working directory; empty means the engine's own
    pub working_dir: PathBuf,

    /// User to run as; empty means the engine's own identity
    pub exec_as_user: String,
}

impl ProgramSpec {
    #[must_use]
    pub fn new(program_path: impl Into<PathBuf>) -> Self {
        Self {
            program_path: program_path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set arguments from a single argument string.
    ///
    /// The string is split on ASCII whitespace. There is no quoting and no
    /// shell expansion.
    #[must_use]
    pub fn arg_string(mut self, args: &str) -> Self {
        self.args = split_arg_string(args);
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    #[must_use]
    pub fn exec_as_user(mut self, user: impl Into<String>) -> Self {
        self.exec_as_user = user.into();
        self
    }
}

/// Split an argument string into words
#[must_use]
pub fn split_arg_string(args: &str) -> Vec<String> {
    args.split_ascii_whitespace().map(str::to_owned).collect()
}

/// Standard stream redirection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoSpec {
    /// Whether any redirection happens at all
    pub redirected: bool,

    /// File to read stdin from; empty keeps the engine's stdin
    pub stdin_path: PathBuf,

    /// File to write stdout to; empty keeps the engine's stdout
    pub stdout_path: PathBuf,

    /// File to write stderr to; empty keeps the engine's stderr.
    /// Ignored when `dup_err_out` is set.
    pub stderr_path: PathBuf,

    /// Make stderr an alias of stdout's destination
    pub dup_err_out: bool,
}

impl IoSpec {
    #[must_use]
    pub fn inherit() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.redirected = true;
        self.stdin_path = path.into();
        self
    }

    #[must_use]
    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.redirected = true;
        self.stdout_path = path.into();
        self
    }

    #[must_use]
    pub fn stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.redirected = true;
        self.stderr_path = path.into();
        self
    }

    #[must_use]
    pub fn dup_err_out(mut self, dup: bool) -> Self {
        self.redirected = true;
        self.dup_err_out = dup;
        self
    }
}

/// Resource limits. Zero means unbounded for the three numeric limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSpec {
    /// Wall-clock limit in milliseconds
    pub limit_real_time: u64,

    /// CPU time limit (user + system) in milliseconds
    pub limit_proc_time: u64,

    /// Peak resident memory limit in bytes
    pub limit_proc_wset: u64,

    /// Apply the classic resource-limit set below
    pub rlimit_enabled: bool,

    /// `RLIMIT_CORE` in bytes
    pub rlimit_core: u64,

    /// `RLIMIT_NPROC`
    pub rlimit_nproc: u64,

    /// `RLIMIT_NOFILE`
    pub rlimit_nofile: u64,
}

impl LimitSpec {
    #[must_use]
    pub fn real_time_ms(mut self, ms: u64) -> Self {
        self.limit_real_time = ms;
        self
    }

    #[must_use]
    pub fn proc_time_ms(mut self, ms: u64) -> Self {
        self.limit_proc_time = ms;
        self
    }

    #[must_use]
    pub fn proc_wset_bytes(mut self, bytes: u64) -> Self {
        self.limit_proc_wset = bytes;
        self
    }

    /// Saturates: a limit too large to express in bytes is no limit in practice
    #[must_use]
    pub fn proc_wset_mb(self, mb: u64) -> Self {
        self.proc_wset_bytes(mb.saturating_mul(1024 * 1024))
    }

    #[must_use]
    pub fn rlimits(mut self, core: u64, nproc: u64, nofile: u64) -> Self {
        self.rlimit_enabled = true;
        self.rlimit_core = core;
        self.rlimit_nproc = nproc;
        self.rlimit_nofile = nofile;
        self
    }

    /// Wall-clock limit, `None` when unbounded
    #[must_use]
    pub const fn real_time(&self) -> Option<Duration> {
        nonzero_ms(self.limit_real_time)
    }

    /// CPU time limit, `None` when unbounded
    #[must_use]
    pub const fn proc_time(&self) -> Option<Duration> {
        nonzero_ms(self.limit_proc_time)
    }

    /// Working-set limit in bytes, `None` when unbounded
    #[must_use]
    pub const fn proc_wset(&self) -> Option<u64> {
        if self.limit_proc_wset == 0 {
            None
        } else {
            Some(self.limit_proc_wset)
        }
    }
}

const fn nonzero_ms(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

/// Containment policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSpec {
    /// Install a seccomp filter before the program image loads
    pub scmp_enabled: bool,

    /// Extend the filter with the "deny common" classes
    pub scmp_deny_common: bool,

    /// Create fresh mount, PID, UTS, IPC and cgroup namespaces
    pub unshare_common: bool,

    /// Create a fresh network namespace (independent of `unshare_common`)
    pub unshare_network: bool,
}

impl GuardSpec {
    #[must_use]
    pub fn seccomp(mut self, deny_common: bool) -> Self {
        self.scmp_enabled = true;
        self.scmp_deny_common = deny_common;
        self
    }

    #[must_use]
    pub fn unshare(mut self, common: bool, network: bool) -> Self {
        self.unshare_common = common;
        self.unshare_network = network;
        self
    }
}

/// The four input records bundled for JSON callers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionRequest {
    pub program: ProgramSpec,
    pub io: IoSpec,
    pub limits: LimitSpec,
    pub guard: GuardSpec,
}

/// Engine tuning knobs, independent of any single request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval between limit checks
    pub poll_interval: Duration,

    /// Time between SIGTERM and SIGKILL on forced termination
    pub kill_grace: Duration,

    /// Consecutive metric read failures tolerated before a limit degrades
    pub metric_retries: u32,

    /// Upper bound on the wait for the child to reach its program image
    pub handshake_timeout: Duration,

    /// cgroup v2 directory under which each invocation gets its own cgroup.
    /// `None` tracks descendants through `/proc` instead.
    pub cgroup_root: Option<PathBuf>,
}

/// Default parent of the per-invocation cgroups
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/corral";

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            kill_grace: Duration::from_millis(100),
            metric_retries: 5,
            handshake_timeout: Duration::from_secs(10),
            cgroup_root: Some(PathBuf::from(DEFAULT_CGROUP_ROOT)),
        }
    }
}

impl EngineConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Defaults overridden by `CORRAL_*` environment variables.
    ///
    /// Recognized: `CORRAL_POLL_INTERVAL_MS`, `CORRAL_KILL_GRACE_MS`,
    /// `CORRAL_METRIC_RETRIES`, `CORRAL_HANDSHAKE_TIMEOUT_MS` and
    /// `CORRAL_CGROUP_ROOT` (empty disables cgroups). Unparseable values are
    /// ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_u64("CORRAL_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = env_u64("CORRAL_KILL_GRACE_MS") {
            config.kill_grace = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("CORRAL_METRIC_RETRIES") {
            config.metric_retries = u32::try_from(n).unwrap_or(u32::MAX);
        }
        if let Some(ms) = env_u64("CORRAL_HANDSHAKE_TIMEOUT_MS") {
            config.handshake_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(root) = std::env::var_os("CORRAL_CGROUP_ROOT") {
            config.cgroup_root = (!root.is_empty()).then(|| PathBuf::from(root));
        }
        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(name, value = %raw, error = %e, "ignoring invalid engine setting");
            None
        }
    }
}

/// Builder for `EngineConfig`
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    #[must_use]
    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.config.kill_grace = grace;
        self
    }

    #[must_use]
    pub fn metric_retries(mut self, retries: u32) -> Self {
        self.config.metric_retries = retries;
        self
    }

    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    /// `None` disables cgroups
    #[must_use]
    pub fn cgroup_root(mut self, root: Option<PathBuf>) -> Self {
        self.config.cgroup_root = root;
        self
    }

    #[must_use]
    pub fn build(self) -> EngineConfig {
        self.config
    }
}
