//! corral CLI - run untrusted programs under isolation and limits

use clap::{Args, Parser, Subcommand};
use corral_core::isolation::seccomp::{self, Denial};
use corral_core::{
    Engine, ExecutionOutcome, ExecutionRequest, GuardSpec, IoSpec, LimitSpec, POLICY_VERSION,
    ProgramSpec,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

const EXIT_LAUNCH_FAILED: u8 = 2;

#[derive(Parser)]
#[command(name = "corral")]
#[command(author, version, about = "Run a program under isolation and resource limits")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one program described by flags
    Run(RunArgs),

    /// Run an execution request read from a JSON file
    Request {
        /// Path to the request (`-` for stdin)
        file: PathBuf,
    },

    /// Run the same request many times concurrently and summarize
    Batch {
        /// Path to the request (`-` for stdin)
        file: PathBuf,

        /// Number of runs
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,

        /// Runs in flight at once
        #[arg(short, long, default_value = "4")]
        jobs: usize,
    },

    /// Print the seccomp deny table
    Policy,
}

#[derive(Args)]
struct RunArgs {
    /// Program to execute
    program: PathBuf,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Working directory
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Run as this user
    #[arg(short, long)]
    user: Option<String>,

    /// Redirect standard input from a file
    #[arg(long)]
    stdin: Option<PathBuf>,

    /// Redirect standard output to a file
    #[arg(long)]
    stdout: Option<PathBuf>,

    /// Redirect standard error to a file
    #[arg(long, conflicts_with = "merge_stderr")]
    stderr: Option<PathBuf>,

    /// Send standard error wherever standard output goes
    #[arg(long)]
    merge_stderr: bool,

    /// Wall-clock limit in milliseconds (0 = unbounded)
    #[arg(short, long, default_value = "0")]
    time: u64,

    /// CPU-time limit in milliseconds (0 = unbounded)
    #[arg(long, default_value = "0")]
    cpu: u64,

    /// Working-set limit in MB (0 = unbounded)
    #[arg(short, long, default_value = "0")]
    memory: u64,

    /// Kernel rlimits: core file bytes, processes, open files
    #[arg(long, num_args = 3, value_names = ["CORE", "NPROC", "NOFILE"])]
    rlimits: Option<Vec<u64>>,

    /// Install the seccomp escape filter
    #[arg(long)]
    seccomp: bool,

    /// Also deny the common tier (process creation, privilege changes, ...)
    #[arg(long, requires = "seccomp")]
    deny_common: bool,

    /// New mount, IPC, UTS and PID namespaces
    #[arg(long)]
    unshare: bool,

    /// New network namespace
    #[arg(long)]
    unshare_net: bool,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn to_request(&self) -> ExecutionRequest {
        let mut program = ProgramSpec::new(&self.program).args(self.args.iter().cloned());
        if let Some(cwd) = &self.cwd {
            program = program.working_dir(cwd);
        }
        if let Some(user) = &self.user {
            program = program.exec_as_user(user);
        }

        let mut io = IoSpec::inherit();
        if let Some(path) = &self.stdin {
            io = io.stdin(path);
        }
        if let Some(path) = &self.stdout {
            io = io.stdout(path);
        }
        if let Some(path) = &self.stderr {
            io = io.stderr(path);
        }
        if self.merge_stderr {
            io = io.dup_err_out(true);
        }

        let mut limits = LimitSpec::default()
            .real_time_ms(self.time)
            .proc_time_ms(self.cpu)
            .proc_wset_mb(self.memory);
        if let Some([core, nproc, nofile]) = self.rlimits.as_deref() {
            limits = limits.rlimits(*core, *nproc, *nofile);
        }

        let mut guard = GuardSpec::default().unshare(self.unshare, self.unshare_net);
        if self.seccomp {
            guard = guard.seccomp(self.deny_common);
        }

        ExecutionRequest {
            program,
            io,
            limits,
            guard,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid request in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot encode outcome: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("batch run failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("corral=info")),
        )
        .init();

    let cli = Cli::parse();
    let engine = Engine::from_env();

    match run(cli.command, engine).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("corral: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, engine: Engine) -> Result<ExitCode, CliError> {
    match command {
        Commands::Run(args) => {
            let outcome = engine.execute_request(&args.to_request());
            if args.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_outcome(&outcome);
            }
            Ok(exit_code(&outcome))
        }

        Commands::Request { file } => {
            let request = read_request(&file)?;
            let outcome = engine.execute_request(&request);
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(exit_code(&outcome))
        }

        Commands::Batch { file, count, jobs } => {
            let request = read_request(&file)?;
            let summary = batch(engine, request, count, jobs.max(1)).await?;
            summary.print();
            Ok(if summary.launch_failures > 0 {
                ExitCode::from(EXIT_LAUNCH_FAILED)
            } else {
                ExitCode::SUCCESS
            })
        }

        Commands::Policy => {
            print_policy();
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(outcome: &ExecutionOutcome) -> ExitCode {
    if outcome.is_launch_failure() {
        ExitCode::from(EXIT_LAUNCH_FAILED)
    } else {
        ExitCode::SUCCESS
    }
}

fn read_request(path: &Path) -> Result<ExecutionRequest, CliError> {
    let read_err = |source| CliError::Read {
        path: path.to_owned(),
        source,
    };
    let raw = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).map_err(read_err)?
    } else {
        std::fs::read_to_string(path).map_err(read_err)?
    };
    serde_json::from_str(&raw).map_err(|source| CliError::Parse {
        path: path.to_owned(),
        source,
    })
}

fn print_outcome(outcome: &ExecutionOutcome) {
    if let Some(error) = &outcome.launch_error {
        println!("{error}");
        return;
    }
    println!("exit code:    {}", outcome.exit_code);
    match outcome.signal {
        Some(signal) => println!("signal:       {signal}"),
        None => println!("signal:       -"),
    }
    println!(
        "killed:       {} ({})",
        if outcome.is_killed { "yes" } else { "no" },
        outcome.kill_reason
    );
    println!("wall time:    {} ms", outcome.usage.real_time_ms());
    println!("cpu time:     {} ms", outcome.usage.proc_time_ms());
    println!("peak memory:  {} KiB", outcome.usage.peak_wset / 1024);
    if outcome.unenforced.proc_time {
        println!("warning: cpu-time limit was not enforced");
    }
    if outcome.unenforced.proc_wset {
        println!("warning: working-set limit was not enforced");
    }
}

#[derive(Debug, Default)]
struct BatchSummary {
    runs: usize,
    by_reason: BTreeMap<&'static str, usize>,
    launch_failures: usize,
    unenforced: usize,
    max_real_time_ms: u64,
    total_real_time_ms: u64,
    elapsed_ms: u128,
}

impl BatchSummary {
    fn record(&mut self, outcome: &ExecutionOutcome) {
        self.runs += 1;
        *self.by_reason.entry(outcome.kill_reason.as_str()).or_default() += 1;
        if outcome.is_launch_failure() {
            self.launch_failures += 1;
        }
        if outcome.unenforced.any() {
            self.unenforced += 1;
        }
        let real_time = outcome.usage.real_time_ms();
        self.max_real_time_ms = self.max_real_time_ms.max(real_time);
        self.total_real_time_ms += real_time;
    }

    fn print(&self) {
        println!("runs: {} in {} ms", self.runs, self.elapsed_ms);
        for (reason, n) in &self.by_reason {
            println!("  {reason:<10} {n}");
        }
        if self.unenforced > 0 {
            println!("  {} run(s) had a limit left unenforced", self.unenforced);
        }
        if self.runs > 0 {
            println!(
                "wall time: mean {} ms, max {} ms",
                self.total_real_time_ms / self.runs as u64,
                self.max_real_time_ms
            );
        }
    }
}

async fn batch(
    engine: Engine,
    request: ExecutionRequest,
    count: usize,
    jobs: usize,
) -> Result<BatchSummary, CliError> {
    let engine = Arc::new(engine);
    let request = Arc::new(request);
    let started = Instant::now();
    let mut summary = BatchSummary::default();
    let mut tasks = JoinSet::new();

    for _ in 0..count {
        if tasks.len() >= jobs {
            if let Some(done) = tasks.join_next().await {
                summary.record(&done?);
            }
        }
        let engine = Arc::clone(&engine);
        let request = Arc::clone(&request);
        tasks.spawn_blocking(move || engine.execute_request(&request));
    }
    while let Some(done) = tasks.join_next().await {
        summary.record(&done?);
    }

    summary.elapsed_ms = started.elapsed().as_millis();
    Ok(summary)
}

fn print_policy() {
    println!("seccomp policy version {POLICY_VERSION}");
    println!("{:<20} {:>4}  {:<18} {:<17} when", "syscall", "nr", "class", "enabled by");
    for entry in seccomp::policy() {
        let when = match entry.denial {
            Denial::Always => "always".to_owned(),
            Denial::ArgNonZero(arg) => format!("arg{arg} != 0"),
        };
        println!(
            "{:<20} {:>4}  {:<18} {:<17} {when}",
            entry.name,
            entry.nr,
            entry.class.as_str(),
            entry.class.tier().flag(),
        );
    }
}
