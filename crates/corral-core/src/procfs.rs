//! `/proc/<pid>` readers for the resource monitor

use nix::unistd::Pid;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Kernel clock ticks per second
pub static CLK_TCK: Lazy<u64> = Lazy::new(|| {
    // SAFETY: sysconf has no preconditions
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    u64::try_from(ticks).ok().filter(|&t| t > 0).unwrap_or(100)
});

/// Fields of `/proc/<pid>/stat` the monitor uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub state: char,
    pub ppid: i32,
    /// utime + stime + cutime + cstime
    pub cpu_time: Duration,
    /// Start time in clock ticks after boot; tells a reused pid apart
    pub start_ticks: u64,
}

impl ProcStat {
    #[must_use]
    pub const fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X')
    }
}

/// Parse the contents of `/proc/<pid>/stat`.
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
#[must_use]
pub fn parse_stat(contents: &str, ticks_per_sec: u64) -> Option<ProcStat> {
    let rest = &contents[contents.rfind(')')? + 1..];
    let fields: [&str; 20] = {
        let mut it = rest.split_ascii_whitespace();
        let mut out = [""; 20];
        for slot in &mut out {
            *slot = it.next()?;
        }
        out
    };

    // field 3 is index 0 here
    let state = fields[0].chars().next()?;
    let ppid = fields[1].parse().ok()?;
    let start_ticks = fields[19].parse().ok()?;
    let mut ticks: u64 = 0;
    for field in &fields[11..15] {
        ticks = ticks.saturating_add(field.parse::<i64>().ok()?.max(0).unsigned_abs());
    }

    let tps = ticks_per_sec.max(1);
    let millis = ticks.saturating_mul(1000) / tps;
    Some(ProcStat {
        state,
        ppid,
        cpu_time: Duration::from_millis(millis),
        start_ticks,
    })
}

/// Resident memory from `/proc/<pid>/status`, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcMem {
    /// `VmHWM`, the resident high-water mark
    pub hwm: u64,
    /// `VmRSS`
    pub rss: u64,
}

impl ProcMem {
    #[must_use]
    pub const fn peak(&self) -> u64 {
        if self.hwm > self.rss { self.hwm } else { self.rss }
    }
}

/// `None` when neither line is present, as for kernel threads and zombies
#[must_use]
pub fn parse_status_mem(contents: &str) -> Option<ProcMem> {
    let mut mem = ProcMem::default();
    let mut found = false;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let slot = match key {
            "VmHWM" => &mut mem.hwm,
            "VmRSS" => &mut mem.rss,
            _ => continue,
        };
        let kb: u64 = value.trim().trim_end_matches("kB").trim().parse().ok()?;
        *slot = kb.saturating_mul(1024);
        found = true;
    }
    found.then_some(mem)
}

/// Peak working set in bytes: the larger of `VmHWM` and `VmRSS`
#[must_use]
pub fn parse_status_wset(contents: &str) -> Option<u64> {
    parse_status_mem(contents).map(|mem| mem.peak())
}

pub fn read_stat(pid: Pid) -> std::io::Result<ProcStat> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/stat"))?;
    parse_stat(&contents, *CLK_TCK).ok_or_else(|| invalid("stat"))
}

pub fn read_mem(pid: Pid) -> std::io::Result<ProcMem> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/status"))?;
    parse_status_mem(&contents).ok_or_else(|| invalid("status"))
}

pub fn read_wset(pid: Pid) -> std::io::Result<u64> {
    read_mem(pid).map(|mem| mem.peak())
}

/// Snapshot of every process visible in `/proc`.
///
/// Processes that exit during the scan are skipped.
pub fn processes() -> std::io::Result<HashMap<Pid, ProcStat>> {
    let mut table = HashMap::new();
    for entry in std::fs::read_dir("/proc")? {
        let Some(pid) = entry?
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        let pid = Pid::from_raw(pid);
        if let Ok(stat) = read_stat(pid) {
            table.insert(pid, stat);
        }
    }
    Ok(table)
}

/// Every process below `root` in the parent links of `table`
#[must_use]
pub fn descendants(table: &HashMap<Pid, ProcStat>, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<i32, Vec<Pid>> = HashMap::new();
    for (pid, stat) in table {
        children.entry(stat.ppid).or_default().push(*pid);
    }

    let mut seen = HashSet::from([root]);
    let mut found = Vec::new();
    let mut queue = vec![root];
    while let Some(parent) = queue.pop() {
        for &child in children.get(&parent.as_raw()).into_iter().flatten() {
            if seen.insert(child) {
                found.push(child);
                queue.push(child);
            }
        }
    }
    found
}

fn invalid(file: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("unparseable /proc {file} entry"),
    )
}
