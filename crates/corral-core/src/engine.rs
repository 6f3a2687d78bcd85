//! The execution engine: normalize, launch, monitor, collect

use crate::collector;
use crate::config::{EngineConfig, ExecutionRequest, GuardSpec, IoSpec, LimitSpec, ProgramSpec};
use crate::error::{LaunchError, SetupStage};
use crate::isolation::clone3::spawn_child;
use crate::isolation::{Cgroup, ChildPlan, NamespaceConfig, RlimitPlan, SeccompConfig, StdioFiles};
use crate::monitor::{self, LimitPolicy, Monitor, MonitorReport};
use crate::normalize::{LaunchRequest, normalize};
use crate::pipe::{Handshake, LaunchPipe};
use crate::result::ExecutionOutcome;
use crate::scope::Scope;
use crate::Result as CorralResult;
use nix::unistd::Pid;
use std::time::Instant;

/// Runs programs under isolation and limits.
///
/// An engine holds only tuning knobs, so one instance can serve concurrent
/// invocations from several threads.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    #[must_use]
    pub const fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Engine configured from `CORRAL_*` environment variables
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(EngineConfig::from_env())
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one program to completion.
    ///
    /// Never panics on bad input: every failure before the program image
    /// loads comes back as an outcome with `KillReason::Unset`.
    #[must_use]
    pub fn execute(
        &self,
        program: &ProgramSpec,
        io: &IoSpec,
        limits: &LimitSpec,
        guard: &GuardSpec,
    ) -> ExecutionOutcome {
        match self.run(program, io, limits, guard) {
            Ok(outcome) => {
                tracing::info!(
                    program = %program.program_path.display(),
                    exit_code = outcome.exit_code,
                    signal = ?outcome.signal,
                    kill_reason = %outcome.kill_reason,
                    real_time_ms = outcome.usage.real_time_ms(),
                    proc_time_ms = outcome.usage.proc_time_ms(),
                    peak_wset = outcome.usage.peak_wset,
                    "execution finished"
                );
                outcome
            }
            Err(error) => {
                tracing::info!(
                    program = %program.program_path.display(),
                    stage = %error.stage,
                    error = %error.message,
                    "launch failed"
                );
                ExecutionOutcome::launch_failed(error)
            }
        }
    }

    /// Run a bundled request
    #[must_use]
    pub fn execute_request(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        self.execute(&request.program, &request.io, &request.limits, &request.guard)
    }

    fn run(
        &self,
        program: &ProgramSpec,
        io: &IoSpec,
        limits: &LimitSpec,
        guard: &GuardSpec,
    ) -> Result<ExecutionOutcome, LaunchError> {
        let request = normalize(program, io, limits, guard)
            .map_err(|e| LaunchError::from_error(SetupStage::Validate, &e))?;
        let policy = LimitPolicy::from_limits(&request.limits);

        let (mut child, started) = self.launch(&request)?;

        let (waiter, exits) = match monitor::spawn_waiter(child.pid()) {
            Ok(waiter) => waiter,
            Err(e) => return Err(LaunchError::from_error(SetupStage::Spawn, &e)),
        };

        let report = Monitor::new(&mut child.scope, started, policy, &self.config).watch(&exits);
        if waiter.join().is_err() {
            tracing::warn!(pid = %child.pid(), "waiter thread panicked");
        }

        let pid = child.pid();
        // without a wait status there is no usage to report either
        child.collect(started, &report, &policy).map_err(|e| {
            tracing::warn!(pid = %pid, error = %e, "collection failed");
            LaunchError::from_error(SetupStage::Collect, &e)
        })
    }

    /// A fresh cgroup for one run, or `None` to track through `/proc`
    fn cgroup(&self) -> Option<Cgroup> {
        let root = self.config.cgroup_root.as_deref()?;
        match Cgroup::create(root) {
            Ok(cgroup) => Some(cgroup),
            Err(e) => {
                tracing::debug!(error = %e, "no cgroup, tracking descendants through /proc");
                None
            }
        }
    }

    /// Prepare, spawn and complete the handshake.
    ///
    /// Returns the running child and the instant it was created.
    fn launch(&self, request: &LaunchRequest) -> Result<(Child, Instant), LaunchError> {
        let prepare = |e| LaunchError::from_error(SetupStage::Prepare, &e);

        let stdio = StdioFiles::open(&request.stdio).map_err(prepare)?;
        let seccomp = SeccompConfig::from(&request.guard)
            .compile()
            .map_err(prepare)?;
        let pipe = LaunchPipe::new().map_err(prepare)?;
        let cgroup = self.cgroup();

        let mut argv: Vec<*const libc::c_char> =
            request.argv.iter().map(|arg| arg.as_ptr()).collect();
        argv.push(std::ptr::null());

        let namespaces = NamespaceConfig::from(&request.guard);
        let plan = ChildPlan {
            program: &request.program,
            argv: &argv,
            working_dir: request.working_dir.as_deref(),
            namespaces,
            parent_pid: if namespaces.new_pid_namespace() {
                0
            } else {
                nix::unistd::getpid().as_raw()
            },
            stdio: stdio.plan(),
            rlimits: RlimitPlan::from_limits(&request.limits),
            privileges: request
                .identity
                .as_ref()
                .filter(|id| id.requires_switch())
                .map(crate::isolation::Identity::drop_plan),
            cgroup_fd: cgroup.as_ref().and_then(Cgroup::procs_fd),
            seccomp: seccomp.as_ref(),
            report_fd: pipe.child_fd(),
        };

        let (pid, method) = spawn_child(namespaces.to_clone_flags(), || plan.run())
            .map_err(|e| LaunchError::from_error(SetupStage::Spawn, &e))?;
        let started = Instant::now();
        let mut child = Child::new(Scope::new(pid, cgroup));
        tracing::debug!(pid = %pid, ?method, "child created");

        let handshake = pipe
            .into_parent()
            .wait(self.config.handshake_timeout)
            .map_err(|e| LaunchError::from_error(SetupStage::Handshake, &e))?;
        drop(stdio);

        match handshake {
            Handshake::Launched => {
                child.scope.confirm_cgroup();
                tracing::debug!(
                    pid = %pid,
                    cgroup = child.scope.has_cgroup(),
                    "program image loaded"
                );
                Ok((child, started))
            }
            Handshake::Failed { stage, errno } => Err(LaunchError::new(stage, errno.to_string())),
            Handshake::TimedOut => Err(LaunchError::new(
                SetupStage::Handshake,
                format!(
                    "child did not reach exec within {:?}",
                    self.config.handshake_timeout
                ),
            )),
        }
    }
}

/// A spawned child and everything it starts. Killed and reaped on drop
/// unless handed to the collector.
#[derive(Debug)]
struct Child {
    scope: Scope,
    armed: bool,
}

impl Child {
    const fn new(scope: Scope) -> Self {
        Self { scope, armed: true }
    }

    const fn pid(&self) -> Pid {
        self.scope.leader()
    }

    /// Sweep, reap and classify. Disarms first: the collector owns the
    /// reap from here, whether or not it succeeds.
    fn collect(
        mut self,
        started: Instant,
        report: &MonitorReport,
        policy: &LimitPolicy,
    ) -> CorralResult<ExecutionOutcome> {
        self.armed = false;
        collector::collect(&mut self.scope, started, report, policy)
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.scope.sweep();
        if let Err(e) = collector::reap(self.scope.leader()) {
            tracing::warn!(pid = %self.pid(), error = %e, "failed to reap child");
        }
    }
}

/// Run one program with the default engine configuration.
///
/// See [`Engine::execute`].
#[must_use]
pub fn execute(
    program: &ProgramSpec,
    io: &IoSpec,
    limits: &LimitSpec,
    guard: &GuardSpec,
) -> ExecutionOutcome {
    Engine::default().execute(program, io, limits, guard)
}
