//! Provenance tracker.
//!
//! Correlates filesystem events with process snapshots and emits records to
//! the store. The hot path (read/write) touches only the per-FD entry; store
//! writes happen at open and close, grouped into one transaction per event.
//! Store failures never block filesystem operations: batches are buffered in
//! memory for a bounded window and then dropped with a warning.

use proc_probe::ProcessInspector;
use prov_store::{ProvStore, RecordBatch, StoreError};
use repeat_models::{
    hash_file_sha256, io_id, now_ts, FileRecord, ForkRecord, IoDirection, IoRecord, ProcessRecord,
};
use std::collections::{HashMap, VecDeque};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Batches held while the store is unreachable, and for how long.
const BUFFER_MAX: usize = 4096;
const BUFFER_WINDOW_SECS: u64 = 60;

#[derive(Debug, Default)]
struct Accum {
    active: bool,
    bytes: u64,
}

struct FdEntry {
    file: FileRecord,
    /// Backing path for rehash on close-after-write; None for synthetic files.
    real_path: Option<PathBuf>,
    process_id: String,
    seq: u64,
    open_time: f64,
    may_read: bool,
    may_write: bool,
    read: Accum,
    write: Accum,
}

pub struct Tracker {
    store: Arc<ProvStore>,
    probe: Arc<dyn ProcessInspector>,
    host: String,
    enabled: bool,
    fds: RwLock<HashMap<u64, Arc<Mutex<FdEntry>>>>,
    seq: AtomicU64,
    pending: Mutex<VecDeque<(Instant, RecordBatch)>>,
}

impl Tracker {
    pub fn new(store: Arc<ProvStore>, probe: Arc<dyn ProcessInspector>) -> Self {
        let enabled = probe.available();
        if !enabled {
            tracing::warn!("process introspection unavailable, running in VDF-only mode");
        }
        Self {
            store,
            probe,
            host: proc_probe::system_hostname(),
            enabled,
            fds: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// False in degraded (VDF-only) mode: no provenance is recorded.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn probe(&self) -> &Arc<dyn ProcessInspector> {
        &self.probe
    }

    /// Open event: resolve File and Process (creating either if absent),
    /// persist open-state intervals for the directions the flags allow, and
    /// record fork edges along the caller's ancestor chain.
    pub fn on_open(
        &self,
        real_path: &Path,
        fd: u64,
        may_read: bool,
        may_write: bool,
        caller_pid: i32,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let file = self.resolve_file(real_path, now_ts(), false)?;
        self.register_open(file, Some(real_path.to_path_buf()), fd, may_read, may_write, caller_pid)
    }

    /// Open event for a synthetic file (a VDF leaf): the caller supplies the
    /// File record since there is no backing inode to stat.
    pub fn on_open_synthetic(
        &self,
        file: FileRecord,
        fd: u64,
        may_read: bool,
        may_write: bool,
        caller_pid: i32,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.register_open(file, None, fd, may_read, may_write, caller_pid)
    }

    fn register_open(
        &self,
        file: FileRecord,
        real_path: Option<PathBuf>,
        fd: u64,
        may_read: bool,
        may_write: bool,
        caller_pid: i32,
    ) -> Result<()> {
        let open_time = now_ts();
        let mut batch = RecordBatch::default();

        let lineage = self
            .probe
            .lineage(caller_pid)
            .unwrap_or_default();
        if lineage.is_empty() {
            // Caller vanished between the kernel call and our probe.
            tracing::debug!("pid {caller_pid} exited before introspection");
            return Ok(());
        }
        let process_id = lineage[0].id();
        for pair in lineage.windows(2) {
            batch.forks.push(ForkRecord {
                parent_id: pair[1].id(),
                child_id: pair[0].id(),
            });
        }
        for record in lineage {
            if !self.store.has_process(&record.id()).unwrap_or(false) {
                batch.processes.push(record);
            }
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let entry = FdEntry {
            file: file.clone(),
            real_path,
            process_id: process_id.clone(),
            seq,
            open_time,
            may_read,
            may_write,
            read: Accum::default(),
            write: Accum::default(),
        };

        batch.files.push(file.clone());
        for (allowed, direction) in [(may_read, IoDirection::Read), (may_write, IoDirection::Write)]
        {
            if allowed {
                batch.ios.push(IoRecord {
                    process_id: process_id.clone(),
                    file_id: file.id(),
                    direction,
                    seq,
                    open_time,
                    // Sentinel: interval is still open.
                    close_time: -1.0,
                    bytes: None,
                    truncated: false,
                });
            }
        }

        self.persist(batch);
        self.fds
            .write()
            .unwrap()
            .insert(fd, Arc::new(Mutex::new(entry)));
        Ok(())
    }

    /// Read event. No store writes: bytes accumulate on the FD entry.
    pub fn on_read(&self, fd: u64, bytes: u64) {
        if let Some(entry) = self.fd_entry(fd) {
            let mut entry = entry.lock().unwrap();
            entry.read.active = true;
            entry.read.bytes += bytes;
        }
    }

    /// Write event. No store writes: bytes accumulate on the FD entry.
    pub fn on_write(&self, fd: u64, bytes: u64) {
        if let Some(entry) = self.fd_entry(fd) {
            let mut entry = entry.lock().unwrap();
            entry.write.active = true;
            entry.write.bytes += bytes;
        }
    }

    /// Close event: finalize active intervals, drop inactive ones, and on
    /// close-after-write recompute the file's content hash from the backing
    /// bytes.
    pub fn on_close(&self, fd: u64) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let Some(entry) = self.fds.write().unwrap().remove(&fd) else {
            return Ok(());
        };
        let entry = Arc::try_unwrap(entry)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_else(|arc| {
                let guard = arc.lock().unwrap();
                FdEntry {
                    file: guard.file.clone(),
                    real_path: guard.real_path.clone(),
                    process_id: guard.process_id.clone(),
                    seq: guard.seq,
                    open_time: guard.open_time,
                    may_read: guard.may_read,
                    may_write: guard.may_write,
                    read: Accum {
                        active: guard.read.active,
                        bytes: guard.read.bytes,
                    },
                    write: Accum {
                        active: guard.write.active,
                        bytes: guard.write.bytes,
                    },
                }
            });

        let close_time = now_ts();
        let mut batch = RecordBatch::default();
        let mut file = entry.file.clone();

        for (allowed, accum, direction) in [
            (entry.may_read, &entry.read, IoDirection::Read),
            (entry.may_write, &entry.write, IoDirection::Write),
        ] {
            if !allowed {
                continue;
            }
            if accum.active {
                batch.ios.push(IoRecord {
                    process_id: entry.process_id.clone(),
                    file_id: file.id(),
                    direction,
                    seq: entry.seq,
                    open_time: entry.open_time,
                    close_time,
                    bytes: Some(accum.bytes),
                    truncated: false,
                });
            } else {
                batch
                    .io_deletes
                    .push(io_id(&entry.process_id, &file.id(), direction, entry.seq));
            }
        }

        if entry.write.active {
            if let Some(real_path) = &entry.real_path {
                match hash_file_sha256(real_path) {
                    Ok(hash) => file.hash = Some(hash),
                    Err(e) => {
                        tracing::debug!("could not rehash {} on close: {e}", real_path.display())
                    }
                }
                if let Ok(meta) = std::fs::symlink_metadata(real_path) {
                    file.size = meta.size();
                    file.mtime = meta.mtime() as f64 + meta.mtime_nsec() as f64 * 1e-9;
                }
            }
            batch.files.push(file);
        }

        self.persist(batch);
        Ok(())
    }

    /// Rename: the inode is followed, so File identity is preserved and only
    /// the display path changes.
    pub fn on_rename(&self, new_real: &Path) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let meta = std::fs::symlink_metadata(new_real)?;
        if let Some(mut file) = self
            .store
            .file_by_identity(&self.host, meta.dev(), meta.ino())?
        {
            file.path = new_real.to_string_lossy().into_owned();
            self.persist(RecordBatch {
                files: vec![file],
                ..Default::default()
            });
        }
        Ok(())
    }

    /// Rename that moved the inode out of the mount: keep the record, mark it.
    pub fn on_escape(&self, dev: u64, inode: u64) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(mut file) = self.store.file_by_identity(&self.host, dev, inode)? {
            file.escaped = Some(now_ts());
            self.persist(RecordBatch {
                files: vec![file],
                ..Default::default()
            });
        }
        Ok(())
    }

    /// Unlink: mark the File, never remove its records.
    pub fn on_unlink(&self, dev: u64, inode: u64) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(mut file) = self.store.file_by_identity(&self.host, dev, inode)? {
            file.unlinked = Some(now_ts());
            self.persist(RecordBatch {
                files: vec![file],
                ..Default::default()
            });
        }
        Ok(())
    }

    /// Record a VDF derivation exactly as if a user had run it: the child
    /// process, a write interval onto the leaf, and its exit status.
    pub fn record_derivation(
        &self,
        process: ProcessRecord,
        exit_status: i32,
        leaf: FileRecord,
        open_time: f64,
        close_time: f64,
        bytes: u64,
    ) {
        if !self.enabled {
            return;
        }
        let process_id = process.id();
        let io = IoRecord {
            process_id: process_id.clone(),
            file_id: leaf.id(),
            direction: IoDirection::Write,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            open_time,
            close_time,
            bytes: Some(bytes),
            truncated: false,
        };
        self.persist(RecordBatch {
            files: vec![leaf],
            processes: vec![process],
            ios: vec![io],
            exits: vec![(process_id, exit_status)],
            ..Default::default()
        });
    }

    /// Unmount: every still-open interval is closed at unmount time and
    /// flagged truncated.
    pub fn finalize_unmount(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let unmount_time = now_ts();
        let entries: Vec<_> = self.fds.write().unwrap().drain().collect();
        let mut batch = RecordBatch::default();
        for (_, entry) in entries {
            let entry = entry.lock().unwrap();
            for (allowed, accum, direction) in [
                (entry.may_read, &entry.read, IoDirection::Read),
                (entry.may_write, &entry.write, IoDirection::Write),
            ] {
                if !allowed {
                    continue;
                }
                if accum.active {
                    batch.ios.push(IoRecord {
                        process_id: entry.process_id.clone(),
                        file_id: entry.file.id(),
                        direction,
                        seq: entry.seq,
                        open_time: entry.open_time,
                        close_time: unmount_time,
                        bytes: Some(accum.bytes),
                        truncated: true,
                    });
                } else {
                    batch.io_deletes.push(io_id(
                        &entry.process_id,
                        &entry.file.id(),
                        direction,
                        entry.seq,
                    ));
                }
            }
        }
        self.persist(batch);
        self.store.finalize_unmount(unmount_time)?;
        Ok(())
    }

    /// Resolve the live File entity for a path, archiving a dead predecessor
    /// when the inode was reused after an unlink.
    fn resolve_file(&self, real_path: &Path, observed: f64, vdf: bool) -> Result<FileRecord> {
        let meta = std::fs::symlink_metadata(real_path)?;
        let (dev, inode) = (meta.dev(), meta.ino());

        if let Some(existing) = self.store.file_by_identity(&self.host, dev, inode)? {
            if existing.unlinked.is_none() {
                let mut file = existing;
                file.path = real_path.to_string_lossy().into_owned();
                return Ok(file);
            }
            // Inode reuse: the dead entity keeps its history under an
            // archived ID, and this observation starts a new one.
            self.store.archive_file(&existing.id())?;
        }

        Ok(FileRecord {
            host: self.host.clone(),
            dev,
            inode,
            path: real_path.to_string_lossy().into_owned(),
            size: meta.size(),
            mtime: meta.mtime() as f64 + meta.mtime_nsec() as f64 * 1e-9,
            hash: None,
            vdf,
            created: observed,
            unlinked: None,
            escaped: None,
        })
    }

    fn fd_entry(&self, fd: u64) -> Option<Arc<Mutex<FdEntry>>> {
        self.fds.read().unwrap().get(&fd).cloned()
    }

    /// Commit with store-failure buffering. Filesystem operations are never
    /// blocked: on persistent store errors the batch is queued, and the queue
    /// is bounded in both size and age.
    fn persist(&self, batch: RecordBatch) {
        if batch.is_empty() {
            return;
        }
        let mut pending = self.pending.lock().unwrap();

        // Retry anything buffered first so ordering is preserved.
        while let Some((queued_at, queued)) = pending.front() {
            if queued_at.elapsed().as_secs() > BUFFER_WINDOW_SECS {
                tracing::warn!("dropping provenance batch older than {BUFFER_WINDOW_SECS}s");
                pending.pop_front();
                continue;
            }
            match self.store.commit(queued) {
                Ok(()) => {
                    pending.pop_front();
                }
                Err(_) => break,
            }
        }

        if pending.is_empty() {
            match self.store.commit(&batch) {
                Ok(()) => return,
                Err(StoreError::Unavailable(e)) => {
                    tracing::warn!("provenance store unavailable, buffering: {e}");
                }
                Err(e) => {
                    tracing::warn!("provenance commit failed, buffering: {e}");
                }
            }
        }

        if pending.len() >= BUFFER_MAX {
            tracing::warn!("provenance buffer full, dropping oldest batch");
            pending.pop_front();
        }
        pending.push_back((Instant::now(), batch));
    }
}

#[cfg(test)]
#[cfg(target_os = "linux")]
mod tests {
    use super::*;
    use repeat_models::hash_bytes_sha256;
    use tempfile::TempDir;

    fn tracker(store: &Arc<ProvStore>) -> Tracker {
        let probe: Arc<dyn ProcessInspector> =
            Arc::from(proc_probe::ProcProbe::new().expect("probe"));
        Tracker::new(Arc::clone(store), probe)
    }

    fn self_pid() -> i32 {
        std::process::id() as i32
    }

    #[test]
    fn write_close_records_interval_and_hash() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, b"hello\n").expect("write");

        let store = Arc::new(ProvStore::open_in_memory().expect("store"));
        let tracker = tracker(&store);

        tracker
            .on_open(&path, 3, false, true, self_pid())
            .expect("open");
        tracker.on_write(3, 6);
        tracker.on_close(3).expect("close");

        let meta = std::fs::symlink_metadata(&path).expect("stat");
        let file = store
            .file_by_identity(tracker.host(), meta.dev(), meta.ino())
            .expect("lookup")
            .expect("file recorded");
        assert_eq!(file.hash.as_deref(), Some(&hash_bytes_sha256(b"hello\n")[..]));

        let writes = store
            .ios_of_file(&file.id(), IoDirection::Write)
            .expect("ios");
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].bytes, Some(6));
        assert!(writes[0].open_time <= writes[0].close_time);
        assert!(!writes[0].truncated);

        // The recording process and its shell ancestry are present.
        let proc = store
            .get_process(&writes[0].process_id)
            .expect("get")
            .expect("process recorded");
        assert_eq!(proc.pid, self_pid());
        assert!(!proc.hash.is_empty());
    }

    #[test]
    fn copy_records_read_and_write_sides() {
        let tmp = TempDir::new().expect("tempdir");
        let src = tmp.path().join("a.txt");
        let dst = tmp.path().join("b.txt");
        std::fs::write(&src, b"hello\n").expect("write");
        std::fs::write(&dst, b"").expect("write");

        let store = Arc::new(ProvStore::open_in_memory().expect("store"));
        let tracker = tracker(&store);

        tracker.on_open(&src, 3, true, false, self_pid()).expect("open src");
        tracker.on_open(&dst, 4, false, true, self_pid()).expect("open dst");
        tracker.on_read(3, 6);
        std::fs::write(&dst, b"hello\n").expect("copy bytes");
        tracker.on_write(4, 6);
        tracker.on_close(3).expect("close src");
        tracker.on_close(4).expect("close dst");

        let src_meta = std::fs::symlink_metadata(&src).expect("stat");
        let dst_meta = std::fs::symlink_metadata(&dst).expect("stat");
        let src_file = store
            .file_by_identity(tracker.host(), src_meta.dev(), src_meta.ino())
            .expect("lookup")
            .expect("src recorded");
        let dst_file = store
            .file_by_identity(tracker.host(), dst_meta.dev(), dst_meta.ino())
            .expect("lookup")
            .expect("dst recorded");

        let reads = store.ios_of_file(&src_file.id(), IoDirection::Read).expect("ios");
        let writes = store.ios_of_file(&dst_file.id(), IoDirection::Write).expect("ios");
        assert_eq!(reads.len(), 1);
        assert_eq!(writes.len(), 1);
        assert_eq!(reads[0].process_id, writes[0].process_id);
        assert_eq!(dst_file.hash, Some(hash_bytes_sha256(b"hello\n")));
    }

    #[test]
    fn open_without_io_leaves_no_interval() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("quiet.txt");
        std::fs::write(&path, b"data").expect("write");

        let store = Arc::new(ProvStore::open_in_memory().expect("store"));
        let tracker = tracker(&store);

        tracker.on_open(&path, 5, true, true, self_pid()).expect("open");
        tracker.on_close(5).expect("close");

        let meta = std::fs::symlink_metadata(&path).expect("stat");
        let file = store
            .file_by_identity(tracker.host(), meta.dev(), meta.ino())
            .expect("lookup")
            .expect("file recorded");
        assert!(store.ios_of_file(&file.id(), IoDirection::Read).expect("ios").is_empty());
        assert!(store.ios_of_file(&file.id(), IoDirection::Write).expect("ios").is_empty());
    }

    #[test]
    fn rename_preserves_identity() {
        let tmp = TempDir::new().expect("tempdir");
        let old = tmp.path().join("old.txt");
        let new = tmp.path().join("new.txt");
        std::fs::write(&old, b"hello\n").expect("write");

        let store = Arc::new(ProvStore::open_in_memory().expect("store"));
        let tracker = tracker(&store);

        tracker.on_open(&old, 3, false, true, self_pid()).expect("open");
        tracker.on_write(3, 6);
        tracker.on_close(3).expect("close");

        let meta = std::fs::symlink_metadata(&old).expect("stat");
        std::fs::rename(&old, &new).expect("rename");
        tracker.on_rename(&new).expect("on_rename");

        let file = store
            .file_by_identity(tracker.host(), meta.dev(), meta.ino())
            .expect("lookup")
            .expect("still present");
        assert!(file.path.ends_with("new.txt"));
        assert!(file.unlinked.is_none());
    }

    #[test]
    fn escape_marks_record_and_keeps_it() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("stays.txt");
        std::fs::write(&path, b"hello\n").expect("write");

        let store = Arc::new(ProvStore::open_in_memory().expect("store"));
        let tracker = tracker(&store);

        tracker.on_open(&path, 3, false, true, self_pid()).expect("open");
        tracker.on_write(3, 6);
        tracker.on_close(3).expect("close");

        let meta = std::fs::symlink_metadata(&path).expect("stat");
        tracker.on_escape(meta.dev(), meta.ino()).expect("escape");

        let file = store
            .file_by_identity(tracker.host(), meta.dev(), meta.ino())
            .expect("lookup")
            .expect("record kept");
        assert!(file.escaped.is_some());
    }

    #[test]
    fn synthetic_open_records_reads_without_rehash() {
        let store = Arc::new(ProvStore::open_in_memory().expect("store"));
        let tracker = tracker(&store);

        let leaf = FileRecord {
            host: tracker.host().to_string(),
            dev: 0,
            inode: 42,
            path: "/mnt/x.fastq+/x.fastq.fasta".into(),
            size: 12,
            mtime: 0.0,
            hash: None,
            vdf: true,
            created: now_ts(),
            unlinked: None,
            escaped: None,
        };
        tracker
            .on_open_synthetic(leaf.clone(), 9, true, false, self_pid())
            .expect("open");
        tracker.on_read(9, 12);
        tracker.on_close(9).expect("close");

        let got = store.get_file(&leaf.id()).expect("get").expect("recorded");
        assert!(got.vdf);
        let reads = store.ios_of_file(&leaf.id(), IoDirection::Read).expect("ios");
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].bytes, Some(12));
    }

    #[test]
    fn unlink_marks_without_removing() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("gone.txt");
        std::fs::write(&path, b"x").expect("write");

        let store = Arc::new(ProvStore::open_in_memory().expect("store"));
        let tracker = tracker(&store);

        tracker.on_open(&path, 3, false, true, self_pid()).expect("open");
        tracker.on_write(3, 1);
        tracker.on_close(3).expect("close");

        let meta = std::fs::symlink_metadata(&path).expect("stat");
        std::fs::remove_file(&path).expect("unlink");
        tracker.on_unlink(meta.dev(), meta.ino()).expect("on_unlink");

        let file = store
            .file_by_identity(tracker.host(), meta.dev(), meta.ino())
            .expect("lookup")
            .expect("record kept");
        assert!(file.unlinked.is_some());
    }

    #[test]
    fn unmount_truncates_open_intervals() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("open.txt");
        std::fs::write(&path, b"x").expect("write");

        let store = Arc::new(ProvStore::open_in_memory().expect("store"));
        let tracker = tracker(&store);

        tracker.on_open(&path, 3, true, false, self_pid()).expect("open");
        tracker.on_read(3, 1);
        // No close before unmount.
        tracker.finalize_unmount().expect("unmount");

        let meta = std::fs::symlink_metadata(&path).expect("stat");
        let file = store
            .file_by_identity(tracker.host(), meta.dev(), meta.ino())
            .expect("lookup")
            .expect("present");
        let reads = store.ios_of_file(&file.id(), IoDirection::Read).expect("ios");
        assert_eq!(reads.len(), 1);
        assert!(reads[0].truncated);
        assert!(reads[0].open_time <= reads[0].close_time);
    }
}
