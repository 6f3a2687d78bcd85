//! Repeated invocations must not leave children or descriptors behind.
//!
//! Kept in its own test binary so no other test spawns processes or opens
//! files while the counts are taken.

mod common;

use corral_core::{GuardSpec, IoSpec, KillReason, LimitSpec, ProgramSpec, execute};
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, waitpid};

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

#[test]
fn hundred_runs_leave_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.txt");
    std::fs::write(&input, "line\n").unwrap();
    let baseline = open_fds();

    for i in 0..100 {
        let out = dir.path().join(format!("out-{}.txt", i % 4));
        let outcome = match i % 9 {
            0 => execute(
                &ProgramSpec::new("/bin/true"),
                &IoSpec::inherit(),
                &LimitSpec::default(),
                &GuardSpec::default(),
            ),
            1 => execute(
                &ProgramSpec::new("/bin/cat"),
                &IoSpec::inherit().stdin(&input).stdout(&out),
                &LimitSpec::default().real_time_ms(5_000),
                &GuardSpec::default(),
            ),
            2 => execute(
                &ProgramSpec::new("/bin/sh").args(["-c", "sleep 5.01 & sleep 5"]),
                &IoSpec::inherit(),
                &LimitSpec::default().real_time_ms(50),
                &GuardSpec::default(),
            ),
            3 => execute(
                &ProgramSpec::new("/nonexistent/corral-leak"),
                &IoSpec::inherit(),
                &LimitSpec::default(),
                &GuardSpec::default(),
            ),
            4 => execute(
                &ProgramSpec::new("/bin/sh").args(["-c", "echo x; exit 7"]),
                &IoSpec::inherit().stdout(&out).dup_err_out(true),
                &LimitSpec::default().proc_time_ms(5_000),
                &GuardSpec::default().seccomp(false),
            ),
            5 => execute(
                &ProgramSpec::new("/bin/sh").args(["-c", "while :; do :; done"]),
                &IoSpec::inherit(),
                &LimitSpec::default().proc_time_ms(100).real_time_ms(5_000),
                &GuardSpec::default(),
            ),
            6 => execute(
                &ProgramSpec::new("/usr/bin/tail").arg("/dev/zero"),
                &IoSpec::inherit(),
                &LimitSpec::default().proc_wset_mb(24).real_time_ms(5_000),
                &GuardSpec::default(),
            ),
            7 => execute(
                &ProgramSpec::new("/bin/sh").args(["-c", "/bin/true; /bin/true"]),
                &IoSpec::inherit(),
                &LimitSpec::default().real_time_ms(5_000),
                &GuardSpec::default().seccomp(true),
            ),
            _ => execute(
                &ProgramSpec::new("/bin/sh").args(["-c", "setsid sleep 9.19 & sleep 0.1"]),
                &IoSpec::inherit(),
                &LimitSpec::default().real_time_ms(5_000),
                &GuardSpec::default(),
            ),
        };

        match i % 9 {
            2 => assert_eq!(outcome.kill_reason, KillReason::RealTime),
            3 => assert_eq!(outcome.kill_reason, KillReason::Unset),
            4 => assert_eq!(outcome.exit_code, 7),
            5 => assert_eq!(outcome.kill_reason, KillReason::ProcTime, "run {i}: {outcome:?}"),
            6 => assert_eq!(outcome.kill_reason, KillReason::ProcWSet, "run {i}: {outcome:?}"),
            7 => assert_eq!(outcome.kill_reason, KillReason::Security, "run {i}: {outcome:?}"),
            _ => assert!(outcome.is_success(), "run {i}: {outcome:?}"),
        }
    }

    assert_eq!(open_fds(), baseline);
    assert_eq!(
        waitpid(None::<nix::unistd::Pid>, Some(WaitPidFlag::WNOHANG)),
        Err(Errno::ECHILD),
        "no child may outlive its invocation"
    );
    for argv in [["sleep", "5.01"], ["sleep", "9.19"], ["tail", "/dev/zero"]] {
        assert_eq!(common::survivors(&argv), Vec::<i32>::new(), "{argv:?} survived");
    }
}
