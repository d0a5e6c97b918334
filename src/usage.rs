//! Process resource usage for `ServerInfo`.
//!
//! Reads `/proc/self/stat` and `/proc/self/statm`. On platforms without procfs
//! every figure reads as zero.

use std::time::Instant;

use parking_lot::Mutex;

/// Resource figures at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageSnapshot {
    /// CPU use since the previous snapshot, 100.0 = one core
    pub cpu_percent: f64,
    /// Resident set size
    pub memory_bytes: u64,
}

/// Source of resource usage figures.
pub trait UsageSource: Send + Sync + 'static {
    fn snapshot(&self) -> UsageSnapshot;
}

/// Usage of the current process.
#[derive(Debug)]
pub struct ProcessUsage {
    ticks_per_sec: f64,
    page_size: u64,
    last: Mutex<(Instant, u64)>,
}

impl ProcessUsage {
    pub fn new() -> Self {
        // SAFETY: sysconf has no preconditions
        let (ticks, page) =
            unsafe { (libc::sysconf(libc::_SC_CLK_TCK), libc::sysconf(libc::_SC_PAGESIZE)) };
        Self {
            ticks_per_sec: if ticks > 0 { ticks as f64 } else { 100.0 },
            page_size: if page > 0 { page as u64 } else { 4096 },
            last: Mutex::new((Instant::now(), cpu_ticks().unwrap_or(0))),
        }
    }
}

impl Default for ProcessUsage {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageSource for ProcessUsage {
    fn snapshot(&self) -> UsageSnapshot {
        let now = Instant::now();
        let cpu_percent = match cpu_ticks() {
            Some(ticks) => {
                let mut last = self.last.lock();
                let (then, then_ticks) = *last;
                *last = (now, ticks);
                let wall = now.duration_since(then).as_secs_f64();
                if wall > 0.0 {
                    let cpu = ticks.saturating_sub(then_ticks) as f64 / self.ticks_per_sec;
                    cpu / wall * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        let memory_bytes = resident_pages().map(|p| p * self.page_size).unwrap_or(0);
        UsageSnapshot { cpu_percent, memory_bytes }
    }
}

/// utime + stime in clock ticks.
fn cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // The command name may contain spaces; fields are counted after its ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn resident_pages() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    statm.split_whitespace().nth(1)?.parse().ok()
}

/// Host name of the machine, or `localhost` when it cannot be read.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
