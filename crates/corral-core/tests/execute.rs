//! End-to-end runs of real binaries through `corral_core::execute`

mod common;

use corral_core::{
    Engine, EngineConfig, ExecutionOutcome, GuardSpec, IoSpec, KillReason, LimitSpec, ProgramSpec,
    SetupStage, execute,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

fn run(program: ProgramSpec) -> ExecutionOutcome {
    execute(
        &program,
        &IoSpec::inherit(),
        &LimitSpec::default(),
        &GuardSpec::default(),
    )
}

fn run_with_output(program: ProgramSpec, io: IoSpec) -> ExecutionOutcome {
    execute(&program, &io, &LimitSpec::default(), &GuardSpec::default())
}

fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[test]
fn true_exits_cleanly() {
    let outcome = run(ProgramSpec::new("/bin/true"));
    assert!(outcome.is_success(), "{outcome:?}");
    assert!(outcome.launch_error.is_none());
}

#[test]
fn false_exits_with_one() {
    let outcome = run(ProgramSpec::new("/bin/false"));
    assert_eq!(outcome.exit_code, 1);
    assert!(!outcome.is_killed);
    assert_eq!(outcome.kill_reason, KillReason::None);
    assert_eq!(outcome.signal, None);
}

#[test]
fn exit_code_passes_through() {
    let outcome = run(ProgramSpec::new("/bin/sh").args(["-c", "exit 42"]));
    assert_eq!(outcome.exit_code, 42);
    assert_eq!(outcome.kill_reason, KillReason::None);
}

#[test]
fn nonexistent_program_is_a_launch_failure() {
    let outcome = run(ProgramSpec::new("/nonexistent/corral-program"));
    assert_eq!(outcome.kill_reason, KillReason::Unset);
    assert!(!outcome.is_killed);
    assert_eq!(outcome.usage, corral_core::ResourceUsage::default());
    assert_eq!(outcome.launch_error.unwrap().stage, SetupStage::Validate);
}

#[test]
fn unrunnable_image_fails_at_exec() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage");
    fs::write(&path, [0x7f, b'X', b'Y', b'Z', 0, 1, 2, 3]).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

    let outcome = run(ProgramSpec::new(&path));
    assert_eq!(outcome.kill_reason, KillReason::Unset);
    let error = outcome.launch_error.unwrap();
    assert_eq!(error.stage, SetupStage::Exec, "{}", error.message);
}

#[test]
fn unhandled_signal_is_not_a_kill() {
    let outcome = run(ProgramSpec::new("/bin/sh").args(["-c", "kill -USR1 $$"]));
    assert_eq!(outcome.signal, Some(libc::SIGUSR1));
    assert_eq!(outcome.exit_code, -1);
    assert!(!outcome.is_killed);
    assert_eq!(outcome.kill_reason, KillReason::None);
}

#[test]
fn stdout_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");

    let outcome = run_with_output(
        ProgramSpec::new("/bin/echo").args(["hello", "world"]),
        IoSpec::inherit().stdout(&out),
    );
    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(fs::read_to_string(&out).unwrap(), "hello world\n");
}

#[test]
fn arguments_are_passed_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");

    run_with_output(
        ProgramSpec::new("/bin/echo").arg("a  b *"),
        IoSpec::inherit().stdout(&out),
    );
    assert_eq!(fs::read_to_string(&out).unwrap(), "a  b *\n");
}

#[test]
fn stdin_is_copied_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.bin");
    let out = dir.path().join("out.bin");
    let payload: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
    fs::write(&input, &payload).unwrap();

    let outcome = run_with_output(
        ProgramSpec::new("/bin/cat"),
        IoSpec::inherit().stdin(&input).stdout(&out),
    );
    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(fs::read(&out).unwrap(), payload);
}

#[test]
fn stderr_can_follow_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("combined.txt");

    run_with_output(
        ProgramSpec::new("/bin/sh").args(["-c", "echo out; echo err 1>&2"]),
        IoSpec::inherit().stdout(&out).dup_err_out(true),
    );
    assert_eq!(fs::read_to_string(&out).unwrap(), "out\nerr\n");
}

#[test]
fn stderr_to_its_own_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");
    let err = dir.path().join("err.txt");

    run_with_output(
        ProgramSpec::new("/bin/sh").args(["-c", "echo out; echo err 1>&2"]),
        IoSpec::inherit().stdout(&out).stderr(&err),
    );
    assert_eq!(fs::read_to_string(&out).unwrap(), "out\n");
    assert_eq!(fs::read_to_string(&err).unwrap(), "err\n");
}

#[test]
fn working_directory_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("pwd.txt");

    run_with_output(
        ProgramSpec::new("/bin/sh")
            .args(["-c", "pwd -P"])
            .working_dir(dir.path()),
        IoSpec::inherit().stdout(&out),
    );
    let expected = dir.path().canonicalize().unwrap();
    assert_eq!(
        fs::read_to_string(&out).unwrap().trim_end(),
        expected.to_str().unwrap()
    );
}

#[test]
fn relative_program_runs_from_working_dir() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("run.sh");
    fs::write(&script, "#!/bin/sh\necho working-dir-copy\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    let out = dir.path().join("out.txt");

    let outcome = run_with_output(
        ProgramSpec::new("./run.sh").working_dir(dir.path()),
        IoSpec::inherit().stdout(&out),
    );
    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(fs::read_to_string(&out).unwrap(), "working-dir-copy\n");
}

#[test]
fn wall_clock_limit_terminates_sleep() {
    let outcome = execute(
        &ProgramSpec::new("/bin/sleep").arg("5"),
        &IoSpec::inherit(),
        &LimitSpec::default().real_time_ms(300),
        &GuardSpec::default(),
    );
    assert!(outcome.is_killed);
    assert_eq!(outcome.kill_reason, KillReason::RealTime);
    assert!(outcome.usage.wall_time >= Duration::from_millis(300));
    assert!(
        outcome.usage.wall_time < Duration::from_millis(2500),
        "{:?}",
        outcome.usage.wall_time
    );
}

#[test]
fn cpu_limit_terminates_busy_loop() {
    let outcome = execute(
        &ProgramSpec::new("/bin/sh").args(["-c", "while :; do :; done"]),
        &IoSpec::inherit(),
        &LimitSpec::default().proc_time_ms(300).real_time_ms(10_000),
        &GuardSpec::default(),
    );
    assert!(outcome.is_killed);
    assert_eq!(outcome.kill_reason, KillReason::ProcTime);
    assert!(outcome.usage.cpu_time > Duration::from_millis(300));
}

#[test]
fn memory_limit_terminates_growing_process() {
    let limit = 32 * 1024 * 1024;
    let outcome = execute(
        &ProgramSpec::new("/usr/bin/tail").arg("/dev/zero"),
        &IoSpec::inherit(),
        &LimitSpec::default()
            .proc_wset_bytes(limit)
            .real_time_ms(10_000),
        &GuardSpec::default(),
    );
    assert!(outcome.is_killed);
    assert_eq!(outcome.kill_reason, KillReason::ProcWSet);
    assert!(outcome.usage.peak_wset > limit);
}

#[test]
fn forked_workers_count_toward_memory_limit() {
    let limit = 48 * 1024 * 1024;
    let outcome = execute(
        &ProgramSpec::new("/bin/sh").args([
            "-c",
            "/usr/bin/tail /dev/zero & /usr/bin/tail /dev/zero & wait",
        ]),
        &IoSpec::inherit(),
        &LimitSpec::default()
            .proc_wset_bytes(limit)
            .real_time_ms(10_000),
        &GuardSpec::default(),
    );
    assert!(outcome.is_killed, "{outcome:?}");
    assert_eq!(outcome.kill_reason, KillReason::ProcWSet);
    assert!(outcome.usage.peak_wset > limit);
    assert!(common::survivors(&["/usr/bin/tail", "/dev/zero"]).is_empty());
}

#[test]
fn detached_descendants_are_killed_with_the_program() {
    let outcome = execute(
        &ProgramSpec::new("/bin/sh").args(["-c", "setsid sleep 7.77 & sleep 5"]),
        &IoSpec::inherit(),
        &LimitSpec::default().real_time_ms(200),
        &GuardSpec::default(),
    );
    assert_eq!(outcome.kill_reason, KillReason::RealTime);
    assert_eq!(common::survivors(&["sleep", "7.77"]), Vec::<i32>::new());
}

#[test]
fn detached_descendants_are_killed_after_natural_exit() {
    let outcome = execute(
        &ProgramSpec::new("/bin/sh").args(["-c", "setsid sleep 7.78 & sleep 0.3; exit 4"]),
        &IoSpec::inherit(),
        &LimitSpec::default().real_time_ms(5_000),
        &GuardSpec::default(),
    );
    assert_eq!(outcome.exit_code, 4);
    assert!(!outcome.is_killed);
    assert_eq!(common::survivors(&["sleep", "7.78"]), Vec::<i32>::new());
}

#[test]
fn within_limits_is_a_natural_exit() {
    let outcome = execute(
        &ProgramSpec::new("/bin/sh").args(["-c", "exit 3"]),
        &IoSpec::inherit(),
        &LimitSpec::default()
            .real_time_ms(5_000)
            .proc_time_ms(5_000)
            .proc_wset_mb(512),
        &GuardSpec::default(),
    );
    assert_eq!(outcome.exit_code, 3);
    assert!(!outcome.is_killed);
    assert_eq!(outcome.kill_reason, KillReason::None);
    assert!(!outcome.unenforced.any());
}

#[test]
fn short_grace_period_still_kills() {
    let engine = Engine::new(
        EngineConfig::builder()
            .kill_grace(Duration::ZERO)
            .poll_interval(Duration::from_millis(5))
            .build(),
    );
    let outcome = engine.execute(
        &ProgramSpec::new("/bin/sh").args(["-c", "trap '' TERM; sleep 5"]),
        &IoSpec::inherit(),
        &LimitSpec::default().real_time_ms(200),
        &GuardSpec::default(),
    );
    assert_eq!(outcome.kill_reason, KillReason::RealTime);
    assert_eq!(outcome.signal, Some(libc::SIGKILL));
}

#[test]
fn sigterm_ignoring_child_is_escalated() {
    let outcome = execute(
        &ProgramSpec::new("/bin/sh").args(["-c", "trap '' TERM; while :; do :; done"]),
        &IoSpec::inherit(),
        &LimitSpec::default().real_time_ms(200),
        &GuardSpec::default(),
    );
    assert!(outcome.is_killed);
    assert_eq!(outcome.kill_reason, KillReason::RealTime);
    assert_eq!(outcome.signal, Some(libc::SIGKILL));
}

#[test]
fn escape_filter_lets_ordinary_programs_run() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");

    let outcome = execute(
        &ProgramSpec::new("/bin/echo").arg("filtered"),
        &IoSpec::inherit().stdout(&out),
        &LimitSpec::default(),
        &GuardSpec::default().seccomp(false),
    );
    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(fs::read_to_string(&out).unwrap(), "filtered\n");
}

#[test]
fn denied_syscall_is_a_security_kill() {
    let outcome = execute(
        &ProgramSpec::new("/bin/sh").args(["-c", "/bin/true; /bin/true"]),
        &IoSpec::inherit(),
        &LimitSpec::default().real_time_ms(5_000),
        &GuardSpec::default().seccomp(true),
    );
    assert!(outcome.is_killed);
    assert_eq!(outcome.kill_reason, KillReason::Security);
    assert_eq!(outcome.signal, Some(libc::SIGSYS));
}

#[test]
fn classic_rlimits_apply() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("limits.txt");

    let outcome = execute(
        &ProgramSpec::new("/bin/sh").args(["-c", "ulimit -n"]),
        &IoSpec::inherit().stdout(&out),
        &LimitSpec::default().rlimits(0, 4096, 64),
        &GuardSpec::default(),
    );
    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(fs::read_to_string(&out).unwrap().trim(), "64");
}

#[test]
fn concurrent_invocations_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let out = dir.path().join(format!("out-{i}.txt"));
                scope.spawn(move || {
                    let outcome = run_with_output(
                        ProgramSpec::new("/bin/echo").arg(i.to_string()),
                        IoSpec::inherit().stdout(&out),
                    );
                    (outcome, fs::read_to_string(&out).unwrap())
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let (outcome, text) = handle.join().unwrap();
            assert!(outcome.is_success(), "{outcome:?}");
            assert_eq!(text, format!("{i}\n"));
        }
    });
}

#[test]
#[ignore = "requires root"]
fn runs_as_requested_user() {
    if !is_root() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o777)).unwrap();
    let out = dir.path().join("id.txt");

    let outcome = run_with_output(
        ProgramSpec::new("/usr/bin/id").arg("-u").exec_as_user("nobody"),
        IoSpec::inherit().stdout(&out),
    );
    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(fs::read_to_string(&out).unwrap().trim(), "65534");
}

#[test]
#[ignore = "requires root"]
fn common_namespaces_make_child_pid_one() {
    if !is_root() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("pid.txt");

    let outcome = execute(
        &ProgramSpec::new("/bin/sh").args(["-c", "echo $$; ls /proc | grep -c '^[0-9]'"]),
        &IoSpec::inherit().stdout(&out),
        &LimitSpec::default().real_time_ms(5_000),
        &GuardSpec::default().unshare(true, false),
    );
    assert!(outcome.is_success(), "{outcome:?}");
    let text = fs::read_to_string(&out).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("1"));
    // sh and the ls/grep pipeline, nothing from the host
    assert!(lines.next().unwrap().parse::<u32>().unwrap() <= 4);
}

#[test]
#[ignore = "requires root"]
fn network_namespace_has_only_loopback() {
    if !is_root() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("net.txt");

    let outcome = execute(
        &ProgramSpec::new("/bin/cat").arg("/proc/net/dev"),
        &IoSpec::inherit().stdout(&out),
        &LimitSpec::default(),
        &GuardSpec::default().unshare(false, true),
    );
    assert!(outcome.is_success(), "{outcome:?}");
    let text = fs::read_to_string(&out).unwrap();
    let interfaces: Vec<_> = text.lines().skip(2).collect();
    assert_eq!(interfaces.len(), 1, "{text}");
    assert!(interfaces[0].trim_start().starts_with("lo:"));
}

#[test]
fn namespaces_without_privilege_fail_validation() {
    if is_root() {
        return;
    }
    let outcome = execute(
        &ProgramSpec::new("/bin/true"),
        &IoSpec::inherit(),
        &LimitSpec::default(),
        &GuardSpec::default().unshare(true, true),
    );
    assert_eq!(outcome.kill_reason, KillReason::Unset);
    assert_eq!(outcome.launch_error.unwrap().stage, SetupStage::Validate);
}
