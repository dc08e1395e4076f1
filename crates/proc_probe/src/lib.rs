//! Process introspection.
//!
//! Given a PID, builds a `ProcessRecord` snapshot from kernel-exposed process
//! information. The Linux implementation reads `/proc`; on hosts where that
//! is unavailable the `NullProbe` hands back degraded records carrying only
//! (pid, observed-at time) and the tracker runs in VDF-only mode.

use repeat_models::{hash_file_sha256, now_ts, ProcessRecord};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("process information unavailable on this host")]
    Unavailable,
    #[error("process {0} not found")]
    NoSuchProcess(i32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unparseable stat data for pid {0}")]
    Stat(i32),
}

pub type Result<T> = std::result::Result<T, ProbeError>;

/// Walking more ancestors than this means /proc is lying to us.
const MAX_LINEAGE: usize = 64;

pub trait ProcessInspector: Send + Sync {
    /// Snapshot the process. Degraded implementations return a record with
    /// only pid and observed-at time filled in.
    fn snapshot(&self, pid: i32) -> Result<ProcessRecord>;

    /// Snapshot the process and its ancestor chain, nearest first, stopping
    /// at pid 1 (or wherever the kernel stops answering).
    fn lineage(&self, pid: i32) -> Result<Vec<ProcessRecord>> {
        let mut chain = Vec::new();
        let mut current = pid;
        while current > 1 && chain.len() < MAX_LINEAGE {
            let record = match self.snapshot(current) {
                Ok(r) => r,
                // A parent may exit between our stat reads.
                Err(_) if !chain.is_empty() => break,
                Err(e) => return Err(e),
            };
            let parent = record.parent_pid;
            chain.push(record);
            if parent <= 1 {
                break;
            }
            current = parent;
        }
        Ok(chain)
    }

    /// Whether real introspection is available. False means VDF-only mode.
    fn available(&self) -> bool;
}

/// Hostname of the recording host, matching what goes into record IDs.
pub fn system_hostname() -> String {
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Pick the best introspector for this host.
pub fn detect() -> Box<dyn ProcessInspector> {
    match ProcProbe::new() {
        Ok(probe) => Box::new(probe),
        Err(e) => {
            tracing::warn!("process introspection unavailable ({e}), provenance disabled");
            Box::new(NullProbe)
        }
    }
}

/// Linux `/proc` introspector.
pub struct ProcProbe {
    host: String,
    boot_time: f64,
    tick_hz: f64,
    /// exe path -> content hash, computed once per executable.
    exe_hashes: Mutex<HashMap<PathBuf, String>>,
}

impl ProcProbe {
    pub fn new() -> Result<Self> {
        let boot_time = read_boot_time()?;
        let tick_hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if tick_hz <= 0 {
            return Err(ProbeError::Unavailable);
        }
        // Sanity check that /proc answers for ourselves.
        std::fs::metadata("/proc/self/stat").map_err(|_| ProbeError::Unavailable)?;
        Ok(Self {
            host: system_hostname(),
            boot_time,
            tick_hz: tick_hz as f64,
            exe_hashes: Mutex::new(HashMap::new()),
        })
    }

    /// (start_time, parent_pid) from `/proc/<pid>/stat`.
    fn stat_info(&self, pid: i32) -> Result<(f64, i32)> {
        let raw = std::fs::read_to_string(format!("/proc/{pid}/stat")).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProbeError::NoSuchProcess(pid)
            } else {
                ProbeError::Io(e)
            }
        })?;

        // comm may contain spaces and parens; fields resume after the last ')'.
        let rest = raw
            .rfind(')')
            .map(|idx| &raw[idx + 1..])
            .ok_or(ProbeError::Stat(pid))?;
        let fields: Vec<&str> = rest.split_whitespace().collect();

        // After comm: state(3) ppid(4) ... starttime(22), 1-based field numbers.
        let ppid: i32 = fields
            .get(1)
            .and_then(|f| f.parse().ok())
            .ok_or(ProbeError::Stat(pid))?;
        let start_ticks: u64 = fields
            .get(19)
            .and_then(|f| f.parse().ok())
            .ok_or(ProbeError::Stat(pid))?;

        let pstart = self.boot_time + start_ticks as f64 / self.tick_hz;
        // Three-digit rounding keeps the value identical to its ID rendering.
        Ok(((pstart * 1000.0).round() / 1000.0, ppid))
    }

    fn exe_hash(&self, exe: &Path) -> String {
        if exe.as_os_str().is_empty() {
            return String::new();
        }
        let mut cache = self.exe_hashes.lock().unwrap();
        if let Some(hash) = cache.get(exe) {
            return hash.clone();
        }
        let hash = hash_file_sha256(exe).unwrap_or_default();
        cache.insert(exe.to_path_buf(), hash.clone());
        hash
    }
}

impl ProcessInspector for ProcProbe {
    fn snapshot(&self, pid: i32) -> Result<ProcessRecord> {
        let (pstart, parent_pid) = self.stat_info(pid)?;

        // The parent may be gone already; pstart 0 marks an unknown parent.
        let parent_start = if parent_pid > 0 {
            self.stat_info(parent_pid).map(|(s, _)| s).unwrap_or(0.0)
        } else {
            0.0
        };

        let cmd = read_nul_list(&format!("/proc/{pid}/cmdline"));
        let exe = read_link_str(&format!("/proc/{pid}/exe"));
        let hash = self.exe_hash(Path::new(&exe));
        let cwd = read_link_str(&format!("/proc/{pid}/cwd"));
        let env = read_environ(&format!("/proc/{pid}/environ"));

        Ok(ProcessRecord {
            phost: self.host.clone(),
            pstart,
            pid,
            parent_start,
            parent_pid,
            cmd,
            exe,
            hash,
            cwd,
            env,
            stdin: read_link_str(&format!("/proc/{pid}/fd/0")),
            stdout: read_link_str(&format!("/proc/{pid}/fd/1")),
            stderr: read_link_str(&format!("/proc/{pid}/fd/2")),
            exit_status: None,
        })
    }

    fn available(&self) -> bool {
        true
    }
}

/// Fallback for hosts without usable process information.
pub struct NullProbe;

impl ProcessInspector for NullProbe {
    fn snapshot(&self, pid: i32) -> Result<ProcessRecord> {
        Ok(ProcessRecord {
            phost: system_hostname(),
            pstart: now_ts(),
            pid,
            parent_start: 0.0,
            parent_pid: 0,
            cmd: Vec::new(),
            exe: String::new(),
            hash: String::new(),
            cwd: String::new(),
            env: BTreeMap::new(),
            stdin: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            exit_status: None,
        })
    }

    fn available(&self) -> bool {
        false
    }
}

fn read_boot_time() -> Result<f64> {
    let stat = std::fs::read_to_string("/proc/stat").map_err(|_| ProbeError::Unavailable)?;
    for line in stat.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            if let Ok(btime) = rest.trim().parse::<f64>() {
                return Ok(btime);
            }
        }
    }
    Err(ProbeError::Unavailable)
}

/// NUL-separated list file (`cmdline`), permission failures degrade to empty.
fn read_nul_list(path: &str) -> Vec<String> {
    let Ok(raw) = std::fs::read(path) else {
        return Vec::new();
    };
    raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

fn read_environ(path: &str) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let Ok(raw) = std::fs::read(path) else {
        return env;
    };
    for entry in raw.split(|b| *b == 0) {
        if entry.is_empty() {
            continue;
        }
        let entry = String::from_utf8_lossy(entry);
        if let Some((key, val)) = entry.split_once('=') {
            env.insert(key.to_string(), val.to_string());
        }
    }
    env
}

fn read_link_str(path: &str) -> String {
    std::fs::read_link(path)
        .map(|p| {
            let s = p.to_string_lossy().into_owned();
            // The kernel appends this marker to dead link targets.
            s.trim_end_matches(" (deleted)").to_string()
        })
        .unwrap_or_default()
}

#[cfg(test)]
#[cfg(target_os = "linux")]
mod tests {
    use super::*;

    #[test]
    fn snapshot_of_self_is_complete() {
        let probe = ProcProbe::new().expect("proc probe");
        let pid = std::process::id() as i32;
        let record = probe.snapshot(pid).expect("snapshot");

        assert_eq!(record.pid, pid);
        assert!(record.pstart > 0.0);
        assert!(record.parent_pid > 0);
        assert!(!record.cmd.is_empty());
        assert!(!record.exe.is_empty());
        assert_eq!(record.hash.len(), 64);
        assert!(!record.cwd.is_empty());
    }

    #[test]
    fn lineage_starts_with_self() {
        let probe = ProcProbe::new().expect("proc probe");
        let pid = std::process::id() as i32;
        let chain = probe.lineage(pid).expect("lineage");
        assert!(!chain.is_empty());
        assert_eq!(chain[0].pid, pid);
        for pair in chain.windows(2) {
            assert_eq!(pair[0].parent_pid, pair[1].pid);
        }
    }

    #[test]
    fn exe_hash_is_cached_and_stable() {
        let probe = ProcProbe::new().expect("proc probe");
        let pid = std::process::id() as i32;
        let one = probe.snapshot(pid).expect("snapshot");
        let two = probe.snapshot(pid).expect("snapshot");
        assert_eq!(one.hash, two.hash);
        assert_eq!(one.id(), two.id());
    }

    #[test]
    fn null_probe_is_degraded() {
        let probe = NullProbe;
        assert!(!probe.available());
        let record = probe.snapshot(4242).expect("degraded snapshot");
        assert_eq!(record.pid, 4242);
        assert!(record.cmd.is_empty());
        assert!(record.hash.is_empty());
    }
}
