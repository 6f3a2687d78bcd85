//! Helpers shared by the integration tests

use std::time::{Duration, Instant};

/// Pids of live, non-zombie processes whose command line is exactly `argv`
pub fn live_with_cmdline(argv: &[&str]) -> Vec<i32> {
    let mut wanted = argv.join("\0").into_bytes();
    wanted.push(0);

    let mut found = Vec::new();
    for entry in std::fs::read_dir("/proc").unwrap().flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        let Ok(cmdline) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
            continue;
        };
        if cmdline == wanted && !is_zombie(pid) {
            found.push(pid);
        }
    }
    found
}

fn is_zombie(pid: i32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_ascii_whitespace().next().map(|s| s == "Z" || s == "X")
        })
        // gone counts as dead
        .unwrap_or(true)
}

/// Wait up to a second for every process running `argv` to die
pub fn survivors(argv: &[&str]) -> Vec<i32> {
    let deadline = Instant::now() + Duration::from_secs(1);
    loop {
        let alive = live_with_cmdline(argv);
        if alive.is_empty() || Instant::now() >= deadline {
            return alive;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
