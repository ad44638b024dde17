//! Process liveness and CPU sampling from `/proc`.
//!
//! Linux reads `/proc`. Other unixes check liveness with a signal-0 `kill`
//! and report CPU as 0.

use std::collections::HashMap;
use std::time::Instant;

/// Clock ticks per second for `/proc/<pid>/stat` times.
const USER_HZ: f64 = 100.0;

/// Liveness seam, faked in tests.
pub trait ProcessProbe {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the local process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcProbe;

impl ProcessProbe for ProcProbe {
    #[cfg(target_os = "linux")]
    fn is_alive(&self, pid: u32) -> bool {
        read_stat(pid).is_some_and(|stat| !matches!(stat.state, 'Z' | 'X'))
    }

    /// Signal 0 check. `EPERM` still means the pid exists.
    #[cfg(all(unix, not(target_os = "linux")))]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw == 0 {
            return false;
        }
        matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatFields {
    state: char,
    ppid: u32,
    ticks: u64,
}

fn parse_stat(contents: &str) -> Option<StatFields> {
    // comm (field 2) may contain spaces and parens; split after the last ')'.
    let after_comm = contents.rsplit_once(')')?.1;
    let tokens: Vec<&str> = after_comm.split_whitespace().collect();
    let state = tokens.first()?.chars().next()?;
    let ppid = tokens.get(1)?.parse().ok()?;
    // utime and stime are fields 14 and 15.
    let utime: u64 = tokens.get(11)?.parse().ok()?;
    let stime: u64 = tokens.get(12)?.parse().ok()?;
    Some(StatFields {
        state,
        ppid,
        ticks: utime + stime,
    })
}

fn read_stat(pid: u32) -> Option<StatFields> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat(&contents)
}

/// Sum of user+system ticks for `root` and all its descendants.
///
/// `None` if `root` itself is gone.
pub fn tree_cpu_ticks(root: u32) -> Option<u64> {
    let root_stat = read_stat(root)?;
    let mut stats: HashMap<u32, StatFields> = HashMap::new();
    if let Ok(entries) = std::fs::read_dir("/proc") {
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse().ok()) else {
                continue;
            };
            if let Some(stat) = read_stat(pid) {
                stats.insert(pid, stat);
            }
        }
    }
    stats.insert(root, root_stat);
    Some(sum_tree(root, &stats))
}

fn sum_tree(root: u32, stats: &HashMap<u32, StatFields>) -> u64 {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (&pid, stat) in stats {
        if pid != root {
            children.entry(stat.ppid).or_default().push(pid);
        }
    }
    let mut total = 0;
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        if let Some(stat) = stats.get(&pid) {
            total += stat.ticks;
        }
        if let Some(kids) = children.get(&pid) {
            stack.extend(kids);
        }
    }
    total
}

/// CPU utilisation of a process tree between successive samples.
#[derive(Debug)]
pub struct CpuSampler {
    pid: u32,
    last: Option<(Instant, u64)>,
}

impl CpuSampler {
    pub fn new(pid: u32) -> Self {
        Self { pid, last: None }
    }

    /// Percent of one core used since the previous call. The first call
    /// primes the sampler and returns 0.
    pub fn sample(&mut self) -> f64 {
        let Some(ticks) = tree_cpu_ticks(self.pid) else {
            return 0.0;
        };
        let now = Instant::now();
        let percent = match self.last {
            Some((at, prev)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    ticks.saturating_sub(prev) as f64 / USER_HZ / elapsed * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some((now, ticks));
        percent
    }
}
