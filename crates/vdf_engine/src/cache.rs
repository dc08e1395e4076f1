//! Derivation executor and cache.
//!
//! State machine per cache key:
//!
//! ```text
//! absent -> Pending -> Building -> Ready
//!                            \--> Failed
//! Ready|Failed -> absent   (eviction)
//! ```
//!
//! At most one derivation runs per key; different keys build in parallel.
//! The derivation's stdout streams into a growable buffer whose growth is
//! signalled on a condvar, so waiters can be served from the captured prefix
//! while the build is still running. Closing a handle never cancels a build;
//! the output only vanishes when the entry is evicted.

use crate::{Result, VdfError};
use repeat_models::now_ts;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// What to run to materialize a leaf.
#[derive(Debug, Clone)]
pub struct Derivation {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    /// When set, the command writes here (`{output}` template) and the file
    /// is slurped on exit instead of streaming stdout.
    pub output: Option<PathBuf>,
}

/// Outcome of one derivation run.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub pid: Option<i32>,
    pub exit: Option<i32>,
    pub started: f64,
    pub finished: f64,
    pub bytes: u64,
    /// Content hash of the frozen buffer, present on success.
    pub sha256: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Pending,
    Building,
    Ready,
    Failed,
}

struct SlotInner {
    phase: SlotPhase,
    buf: Vec<u8>,
    readers: usize,
    error: Option<String>,
    last_access: f64,
}

struct Slot {
    inner: Mutex<SlotInner>,
    cond: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                phase: SlotPhase::Pending,
                buf: Vec::new(),
                readers: 0,
                error: None,
                last_access: now_ts(),
            }),
            cond: Condvar::new(),
        }
    }
}

struct CacheShared {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    high_water: u64,
    timeout: Option<Duration>,
}

/// The VDF cache. Clones share state.
#[derive(Clone)]
pub struct VdfCache {
    shared: Arc<CacheShared>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub ready_bytes: u64,
}

impl VdfCache {
    pub fn new(high_water: u64, timeout: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                slots: Mutex::new(HashMap::new()),
                high_water,
                timeout,
            }),
        }
    }

    /// Register a reader for a key, starting the derivation if this is the
    /// first access. Returns immediately; reads block on buffer growth.
    pub fn open(
        &self,
        key: &str,
        derivation: Derivation,
        on_spawn: impl FnOnce(i32) + Send + 'static,
        on_complete: impl FnOnce(&BuildReport) + Send + 'static,
    ) -> Result<VdfHandle> {
        let slot = {
            let mut slots = self.shared.slots.lock().unwrap();
            Arc::clone(slots.entry(key.to_string()).or_insert_with(|| Arc::new(Slot::new())))
        };

        let mut inner = slot.inner.lock().unwrap();
        inner.last_access = now_ts();
        match inner.phase {
            SlotPhase::Ready | SlotPhase::Building => {
                inner.readers += 1;
            }
            SlotPhase::Failed => {
                let msg = inner.error.clone().unwrap_or_else(|| "derivation failed".into());
                drop(inner);
                // Failed entries evict immediately so the next access retries.
                self.remove_if_unused(key);
                return Err(VdfError::Derivation(msg));
            }
            SlotPhase::Pending => {
                inner.phase = SlotPhase::Building;
                inner.readers += 1;
                drop(inner);
                let shared = Arc::clone(&self.shared);
                let build_slot = Arc::clone(&slot);
                let build_key = key.to_string();
                std::thread::spawn(move || {
                    run_build(shared, build_slot, build_key, derivation, on_spawn, on_complete);
                });
                return Ok(VdfHandle {
                    key: key.to_string(),
                    slot,
                    shared: Arc::clone(&self.shared),
                });
            }
        }
        drop(inner);
        Ok(VdfHandle {
            key: key.to_string(),
            slot,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Current (length, finalized) of a key's buffer, for `stat`.
    pub fn peek(&self, key: &str) -> Option<(u64, SlotPhase)> {
        let slots = self.shared.slots.lock().unwrap();
        let slot = slots.get(key)?;
        let inner = slot.inner.lock().unwrap();
        Some((inner.buf.len() as u64, inner.phase))
    }

    pub fn stats(&self) -> CacheStats {
        let slots = self.shared.slots.lock().unwrap();
        let mut stats = CacheStats {
            entries: slots.len(),
            ready_bytes: 0,
        };
        for slot in slots.values() {
            let inner = slot.inner.lock().unwrap();
            if inner.phase == SlotPhase::Ready {
                stats.ready_bytes += inner.buf.len() as u64;
            }
        }
        stats
    }

    /// Evict until total Ready bytes fit under the high-water mark. Failed
    /// entries go on every sweep; Ready entries with readers stay.
    pub fn sweep(&self) {
        sweep(&self.shared);
    }

    fn remove_if_unused(&self, key: &str) {
        let mut slots = self.shared.slots.lock().unwrap();
        if let Some(slot) = slots.get(key) {
            let inner = slot.inner.lock().unwrap();
            let removable = inner.readers == 0
                && matches!(inner.phase, SlotPhase::Ready | SlotPhase::Failed);
            drop(inner);
            if removable {
                slots.remove(key);
            }
        }
    }
}

/// An open reader on a cache entry.
pub struct VdfHandle {
    key: String,
    slot: Arc<Slot>,
    shared: Arc<CacheShared>,
}

impl VdfHandle {
    /// Read from `offset`, blocking on buffer growth while the derivation is
    /// in flight. Returns an empty vec at end of a frozen buffer.
    pub fn read_at(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let mut inner = self.slot.inner.lock().unwrap();
        loop {
            inner.last_access = now_ts();
            match inner.phase {
                SlotPhase::Failed => {
                    let msg = inner.error.clone().unwrap_or_else(|| "derivation failed".into());
                    return Err(VdfError::Derivation(msg));
                }
                _ if (offset as usize) < inner.buf.len() => {
                    let start = offset as usize;
                    let end = (start + size).min(inner.buf.len());
                    return Ok(inner.buf[start..end].to_vec());
                }
                SlotPhase::Ready => return Ok(Vec::new()),
                _ => {
                    inner = self.slot.cond.wait(inner).unwrap();
                }
            }
        }
    }

    /// Block until the buffer freezes, then return all of it.
    pub fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut inner = self.slot.inner.lock().unwrap();
        loop {
            match inner.phase {
                SlotPhase::Ready => {
                    inner.last_access = now_ts();
                    return Ok(inner.buf.clone());
                }
                SlotPhase::Failed => {
                    let msg = inner.error.clone().unwrap_or_else(|| "derivation failed".into());
                    return Err(VdfError::Derivation(msg));
                }
                _ => {
                    inner = self.slot.cond.wait(inner).unwrap();
                }
            }
        }
    }

    /// Current buffer length and whether it is frozen.
    pub fn len(&self) -> (u64, bool) {
        let inner = self.slot.inner.lock().unwrap();
        (inner.buf.len() as u64, inner.phase == SlotPhase::Ready)
    }
}

impl Drop for VdfHandle {
    fn drop(&mut self) {
        let mut slots = self.shared.slots.lock().unwrap();
        let mut inner = self.slot.inner.lock().unwrap();
        inner.readers = inner.readers.saturating_sub(1);
        let evict = inner.readers == 0 && inner.phase == SlotPhase::Failed;
        drop(inner);
        if evict {
            slots.remove(&self.key);
        }
    }
}

fn run_build(
    shared: Arc<CacheShared>,
    slot: Arc<Slot>,
    key: String,
    derivation: Derivation,
    on_spawn: impl FnOnce(i32) + Send,
    on_complete: impl FnOnce(&BuildReport) + Send,
) {
    let started = now_ts();
    tracing::debug!("building vdf {key}: {:?}", derivation.argv);

    let fail = |slot: &Slot, msg: String| {
        let mut inner = slot.inner.lock().unwrap();
        inner.phase = SlotPhase::Failed;
        inner.error = Some(msg);
        inner.buf.clear();
        slot.cond.notify_all();
    };

    if derivation.argv.is_empty() {
        let msg = "empty derivation command".to_string();
        fail(&slot, msg.clone());
        on_complete(&BuildReport {
            pid: None,
            exit: None,
            started,
            finished: now_ts(),
            bytes: 0,
            sha256: None,
            error: Some(msg),
        });
        return;
    }

    let mut cmd = Command::new(&derivation.argv[0]);
    cmd.args(&derivation.argv[1..])
        .current_dir(&derivation.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, val) in &derivation.env {
        cmd.env(key, val);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let msg = format!("spawn {}: {e}", derivation.argv[0]);
            fail(&slot, msg.clone());
            on_complete(&BuildReport {
                pid: None,
                exit: None,
                started,
                finished: now_ts(),
                bytes: 0,
                sha256: None,
                error: Some(msg),
            });
            return;
        }
    };

    let pid = child.id() as i32;
    on_spawn(pid);

    if let Some(timeout) = shared.timeout {
        std::thread::spawn(move || {
            std::thread::sleep(timeout);
            // Best effort; the child has usually exited by now.
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        });
    }

    let stderr_handle = child.stderr.take().map(|mut stderr| {
        std::thread::spawn(move || {
            let mut msg = String::new();
            stderr.read_to_string(&mut msg).ok();
            msg
        })
    });

    // Stream stdout into the buffer, waking waiters on every chunk.
    if let Some(mut stdout) = child.stdout.take() {
        let mut chunk = [0u8; 65536];
        loop {
            match stdout.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    let mut inner = slot.inner.lock().unwrap();
                    inner.buf.extend_from_slice(&chunk[..n]);
                    slot.cond.notify_all();
                }
                Err(_) => break,
            }
        }
    }

    let status = child.wait();
    let stderr_text = stderr_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let finished = now_ts();

    let exit = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            let msg = format!("wait {}: {e}", derivation.argv[0]);
            fail(&slot, msg.clone());
            on_complete(&BuildReport {
                pid: Some(pid),
                exit: None,
                started,
                finished,
                bytes: 0,
                sha256: None,
                error: Some(msg),
            });
            return;
        }
    };

    if exit == 0 {
        // File-output rules fill the buffer at completion instead.
        let staged = derivation
            .output
            .as_ref()
            .map(std::fs::read)
            .transpose()
            .unwrap_or(None);
        let mut inner = slot.inner.lock().unwrap();
        if let Some(bytes) = staged {
            inner.buf = bytes;
        }
        inner.phase = SlotPhase::Ready;
        inner.last_access = finished;
        let bytes = inner.buf.len() as u64;
        let sha256 = repeat_models::hash_bytes_sha256(&inner.buf);
        slot.cond.notify_all();
        drop(inner);
        sweep(&shared);
        on_complete(&BuildReport {
            pid: Some(pid),
            exit: Some(0),
            started,
            finished,
            bytes,
            sha256: Some(sha256),
            error: None,
        });
    } else {
        let msg = if stderr_text.trim().is_empty() {
            format!("{} exited with status {exit}", derivation.argv[0])
        } else {
            format!(
                "{} exited with status {exit}: {}",
                derivation.argv[0],
                stderr_text.trim()
            )
        };
        tracing::debug!("vdf {key} failed: {msg}");
        fail(&slot, msg.clone());
        on_complete(&BuildReport {
            pid: Some(pid),
            exit: Some(exit),
            started,
            finished,
            bytes: 0,
            sha256: None,
            error: Some(msg),
        });
    }
}

fn sweep(shared: &CacheShared) {
    let mut slots = shared.slots.lock().unwrap();

    // Failed entries are dropped on every sweep regardless of age.
    slots.retain(|_, slot| {
        let inner = slot.inner.lock().unwrap();
        !(inner.phase == SlotPhase::Failed && inner.readers == 0)
    });

    let mut total: u64 = 0;
    let mut candidates: Vec<(String, f64, u64)> = Vec::new();
    for (key, slot) in slots.iter() {
        let inner = slot.inner.lock().unwrap();
        if inner.phase == SlotPhase::Ready {
            total += inner.buf.len() as u64;
            if inner.readers == 0 {
                candidates.push((key.clone(), inner.last_access, inner.buf.len() as u64));
            }
        }
    }
    if total <= shared.high_water {
        return;
    }

    candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    for (key, _, len) in candidates {
        if total <= shared.high_water {
            break;
        }
        slots.remove(&key);
        total = total.saturating_sub(len);
        tracing::debug!("evicted vdf cache entry {key} ({len} bytes)");
    }
}
