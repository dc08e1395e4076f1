//! Canonical record types and stable identifiers for the provenance system.
//!
//! Every entity is addressed by a string ID that is byte-stable across hosts:
//! files as `hostname|dev|inode`, processes as `hostname|start|pid`, IO
//! intervals as `processID|fileID|dir|seq`. Timestamps are epoch seconds as
//! `f64`; where a timestamp participates in an ID it is rendered with exactly
//! three fractional digits so the rendering never varies between exports.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("malformed provenance document: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;

/// Current wall clock as epoch seconds.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Render a timestamp for use inside an identifier.
pub fn fmt_ts(ts: f64) -> String {
    format!("{ts:.3}")
}

/// SHA-256 of a byte slice, lowercase hex.
pub fn hash_bytes_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Streaming SHA-256 of a file's contents, lowercase hex.
pub fn hash_file_sha256(path: &Path) -> std::io::Result<String> {
    let mut handle = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = handle.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Stable synthetic inode for entities with no backing inode (VDF leaves).
pub fn synthetic_inode(virt_path: &str) -> u64 {
    let digest = Sha256::digest(virt_path.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

pub fn file_id(host: &str, dev: u64, inode: u64) -> String {
    format!("{host}|{dev}|{inode}")
}

pub fn process_id(host: &str, pstart: f64, pid: i32) -> String {
    format!("{host}|{}|{pid}", fmt_ts(pstart))
}

pub fn io_id(process_id: &str, file_id: &str, direction: IoDirection, seq: u64) -> String {
    format!("{process_id}|{file_id}|{}|{seq}", direction.as_str())
}

/// Direction of an IO interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoDirection {
    Read,
    Write,
}

impl IoDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            _ => None,
        }
    }
}

/// A file observed under the mount.
///
/// Essential identity is (host, dev, inode); `path` is the display identity,
/// the absolute real path at the moment of recording. Records are never
/// deleted: unlink and escape-from-mount only stamp timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub host: String,
    pub dev: u64,
    pub inode: u64,
    pub path: String,
    pub size: u64,
    pub mtime: f64,
    /// Content hash, recomputed only on close-after-write.
    pub hash: Option<String>,
    pub vdf: bool,
    /// First observation time.
    pub created: f64,
    pub unlinked: Option<f64>,
    pub escaped: Option<f64>,
}

impl FileRecord {
    pub fn id(&self) -> String {
        file_id(&self.host, self.dev, self.inode)
    }

    /// ID under which a dead entity is archived when its inode is reused.
    pub fn archived_id(&self) -> String {
        format!("{}|{}", self.id(), fmt_ts(self.created))
    }
}

/// A process observed doing IO under the mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub phost: String,
    pub pstart: f64,
    pub pid: i32,
    pub parent_start: f64,
    pub parent_pid: i32,
    /// Command-line argument vector.
    pub cmd: Vec<String>,
    pub exe: String,
    /// SHA-256 of the executable's bytes at first observation.
    pub hash: String,
    pub cwd: String,
    /// Environment captured at first observation of the PID.
    pub env: BTreeMap<String, String>,
    /// Link targets of fds 0-2 at first observation.
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    /// Terminal status, set at most once when observed.
    pub exit_status: Option<i32>,
}

impl ProcessRecord {
    pub fn id(&self) -> String {
        process_id(&self.phost, self.pstart, self.pid)
    }

    /// Parent identity, when the parent exists (pid 0 means "no parent").
    pub fn parent_id(&self) -> Option<String> {
        if self.parent_pid <= 0 {
            return None;
        }
        Some(process_id(&self.phost, self.parent_start, self.parent_pid))
    }
}

/// One open..close interval of a process against a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoRecord {
    pub process_id: String,
    pub file_id: String,
    pub direction: IoDirection,
    /// Per-FD open sequence number, disambiguates repeated opens.
    pub seq: u64,
    pub open_time: f64,
    pub close_time: f64,
    pub bytes: Option<u64>,
    /// Close was not observed before unmount; close_time is the unmount time.
    pub truncated: bool,
}

impl IoRecord {
    pub fn id(&self) -> String {
        io_id(&self.process_id, &self.file_id, self.direction, self.seq)
    }
}

/// Parent/child edge between two recorded processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkRecord {
    pub parent_id: String,
    pub child_id: String,
}

/// Exported provenance for one target file: the transitive predecessors of
/// `target` by IO and fork, keyed by stable ID. Field order and BTreeMap keys
/// make serialization byte-stable, which replication portability requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceDoc {
    /// Mount root path of the recording session.
    pub mount: String,
    /// File ID of the artifact this document was exported for.
    pub target: String,
    pub file: BTreeMap<String, FileRecord>,
    pub process: BTreeMap<String, ProcessRecord>,
    pub read: BTreeMap<String, IoRecord>,
    pub write: BTreeMap<String, IoRecord>,
}

impl ProvenanceDoc {
    pub fn new(mount: &str, target: &str) -> Self {
        Self {
            mount: mount.to_string(),
            target: target.to_string(),
            file: BTreeMap::new(),
            process: BTreeMap::new(),
            read: BTreeMap::new(),
            write: BTreeMap::new(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}
