//! Durable provenance store.
//!
//! SQLite-backed tables `file`, `process`, `io`, `fork` plus a `mount`
//! registry. Writes are grouped into transactions by the caller via
//! [`RecordBatch`]; a successful commit is durable before `commit` returns.
//! Commits are serialized on the connection; transient SQLITE_BUSY errors are
//! retried a bounded number of times before surfacing as `Unavailable`.

use repeat_models::{FileRecord, ForkRecord, IoDirection, IoRecord, ProcessRecord, ProvenanceDoc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("provenance store unavailable: {0}")]
    Unavailable(String),
    #[error("unknown entity: {0}")]
    NotFound(String),
    #[error(transparent)]
    Model(#[from] repeat_models::ModelError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const COMMIT_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 25;

/// One transaction's worth of writes.
#[derive(Debug, Default, Clone)]
pub struct RecordBatch {
    pub files: Vec<FileRecord>,
    pub processes: Vec<ProcessRecord>,
    pub ios: Vec<IoRecord>,
    pub forks: Vec<ForkRecord>,
    /// (process id, exit status), applied at most once per process.
    pub exits: Vec<(String, i32)>,
    /// IO rows to remove: open-state intervals whose direction saw no bytes.
    pub io_deletes: Vec<String>,
}

impl RecordBatch {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
            && self.processes.is_empty()
            && self.ios.is_empty()
            && self.forks.is_empty()
            && self.exits.is_empty()
            && self.io_deletes.is_empty()
    }
}

pub struct ProvStore {
    conn: Mutex<Connection>,
}

impl ProvStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        // The pragma reports the resulting mode as a row.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS mount (
                mid INTEGER PRIMARY KEY AUTOINCREMENT,
                root TEXT NOT NULL,
                mount TEXT NOT NULL,
                UNIQUE(root, mount)
            );

            CREATE TABLE IF NOT EXISTS file (
                id TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                dev INTEGER NOT NULL,
                inode INTEGER NOT NULL,
                path TEXT NOT NULL,
                size INTEGER NOT NULL,
                mtime REAL NOT NULL,
                hash TEXT,
                vdf INTEGER NOT NULL,
                created REAL NOT NULL,
                unlinked REAL,
                escaped REAL
            );

            CREATE INDEX IF NOT EXISTS idx_file_path ON file(path, created);

            CREATE TABLE IF NOT EXISTS process (
                id TEXT PRIMARY KEY,
                phost TEXT NOT NULL,
                pstart REAL NOT NULL,
                pid INTEGER NOT NULL,
                parent_start REAL NOT NULL,
                parent_pid INTEGER NOT NULL,
                cmd JSON NOT NULL,
                exe TEXT NOT NULL,
                hash TEXT NOT NULL,
                cwd TEXT NOT NULL,
                env JSON NOT NULL,
                stdin TEXT NOT NULL,
                stdout TEXT NOT NULL,
                stderr TEXT NOT NULL,
                exit_status INTEGER
            );

            CREATE TABLE IF NOT EXISTS io (
                id TEXT PRIMARY KEY,
                process_id TEXT NOT NULL,
                file_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                seq INTEGER NOT NULL,
                open_time REAL NOT NULL,
                close_time REAL NOT NULL,
                bytes INTEGER,
                truncated INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_io_file ON io(file_id, direction);
            CREATE INDEX IF NOT EXISTS idx_io_process ON io(process_id, direction);

            CREATE TABLE IF NOT EXISTS fork (
                parent_id TEXT NOT NULL,
                child_id TEXT NOT NULL,
                PRIMARY KEY (parent_id, child_id)
            );
            "#,
        )?;
        Ok(())
    }

    /// Register the (root, mount) pair of this recording session.
    pub fn register_mount(&self, root: &str, mount: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO mount (root, mount) VALUES (?1, ?2)",
            params![root, mount],
        )?;
        Ok(())
    }

    /// Commit a batch atomically. Retries transient failures internally.
    pub fn commit(&self, batch: &RecordBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut last_err = None;
        for attempt in 0..COMMIT_ATTEMPTS {
            match self.try_commit(batch) {
                Ok(()) => return Ok(()),
                Err(StoreError::Sqlite(e)) if is_transient(&e) => {
                    tracing::debug!("store commit attempt {attempt} hit busy database, retrying");
                    std::thread::sleep(std::time::Duration::from_millis(
                        RETRY_BACKOFF_MS << attempt,
                    ));
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Unavailable(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "commit retries exhausted".into()),
        ))
    }

    fn try_commit(&self, batch: &RecordBatch) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        for file in &batch.files {
            upsert_file(&tx, file)?;
        }
        for process in &batch.processes {
            tx.execute(
                "INSERT INTO process (id, phost, pstart, pid, parent_start, parent_pid, cmd, exe, hash, cwd, env, stdin, stdout, stderr, exit_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    process.id(),
                    process.phost,
                    process.pstart,
                    process.pid,
                    process.parent_start,
                    process.parent_pid,
                    serde_json::to_string(&process.cmd).unwrap_or_else(|_| "[]".into()),
                    process.exe,
                    process.hash,
                    process.cwd,
                    serde_json::to_string(&process.env).unwrap_or_else(|_| "{}".into()),
                    process.stdin,
                    process.stdout,
                    process.stderr,
                    process.exit_status,
                ],
            )?;
        }
        for io in &batch.ios {
            tx.execute(
                "INSERT OR REPLACE INTO io (id, process_id, file_id, direction, seq, open_time, close_time, bytes, truncated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    io.id(),
                    io.process_id,
                    io.file_id,
                    io.direction.as_str(),
                    io.seq as i64,
                    io.open_time,
                    io.close_time,
                    io.bytes.map(|b| b as i64),
                    io.truncated as i64,
                ],
            )?;
        }
        for fork in &batch.forks {
            tx.execute(
                "INSERT OR IGNORE INTO fork (parent_id, child_id) VALUES (?1, ?2)",
                params![fork.parent_id, fork.child_id],
            )?;
        }
        for id in &batch.io_deletes {
            tx.execute("DELETE FROM io WHERE id = ?1", params![id])?;
        }
        for (process_id, status) in &batch.exits {
            // Terminal status is recorded exactly once.
            tx.execute(
                "UPDATE process SET exit_status = ?2 WHERE id = ?1 AND exit_status IS NULL",
                params![process_id, status],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_file(&self, id: &str) -> Result<Option<FileRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT host, dev, inode, path, size, mtime, hash, vdf, created, unlinked, escaped
             FROM file WHERE id = ?1",
            params![id],
            file_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Live entity for an inode, if one has been observed.
    pub fn file_by_identity(&self, host: &str, dev: u64, inode: u64) -> Result<Option<FileRecord>> {
        self.get_file(&repeat_models::file_id(host, dev, inode))
    }

    /// Most recently created entity recorded under a display path.
    pub fn latest_file_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT host, dev, inode, path, size, mtime, hash, vdf, created, unlinked, escaped
             FROM file WHERE path = ?1 ORDER BY created DESC LIMIT 1",
            params![path],
            file_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Archive a dead entity so a reused inode becomes a fresh one.
    ///
    /// The row moves to its `archived_id`; IO rows follow it so historical
    /// edges keep pointing at the entity they were recorded against.
    pub fn archive_file(&self, id: &str) -> Result<()> {
        let record = self
            .get_file(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let archived = record.archived_id();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE file SET id = ?2 WHERE id = ?1",
            params![id, archived],
        )?;
        tx.execute(
            "UPDATE io SET file_id = ?2, id = replace(id, ?1, ?2) WHERE file_id = ?1",
            params![id, archived],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_process(&self, id: &str) -> Result<Option<ProcessRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT phost, pstart, pid, parent_start, parent_pid, cmd, exe, hash, cwd, env, stdin, stdout, stderr, exit_status
             FROM process WHERE id = ?1",
            params![id],
            process_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn has_process(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(1) FROM process WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    /// IO intervals on a file in one direction, ordered for traversal.
    pub fn ios_of_file(&self, file_id: &str, direction: IoDirection) -> Result<Vec<IoRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT process_id, file_id, direction, seq, open_time, close_time, bytes, truncated
             FROM io WHERE file_id = ?1 AND direction = ?2
             ORDER BY open_time ASC, process_id ASC, seq ASC",
        )?;
        let rows = stmt
            .query_map(params![file_id, direction.as_str()], io_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn ios_of_process(&self, process_id: &str, direction: IoDirection) -> Result<Vec<IoRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT process_id, file_id, direction, seq, open_time, close_time, bytes, truncated
             FROM io WHERE process_id = ?1 AND direction = ?2
             ORDER BY open_time ASC, file_id ASC, seq ASC",
        )?;
        let rows = stmt
            .query_map(params![process_id, direction.as_str()], io_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn forks_of_child(&self, child_id: &str) -> Result<Vec<ForkRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT parent_id, child_id FROM fork WHERE child_id = ?1 ORDER BY parent_id")?;
        let rows = stmt
            .query_map(params![child_id], |r| {
                Ok(ForkRecord {
                    parent_id: r.get(0)?,
                    child_id: r.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Flag still-open IO rows as truncated at unmount time.
    pub fn finalize_unmount(&self, unmount_time: f64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE io SET close_time = ?1, truncated = 1 WHERE close_time < open_time",
            params![unmount_time],
        )?;
        Ok(n)
    }

    /// Export the transitive predecessors of `target_file_id` by IO and fork.
    pub fn export(&self, target_file_id: &str, mount: &str) -> Result<ProvenanceDoc> {
        if self.get_file(target_file_id)?.is_none() {
            return Err(StoreError::NotFound(target_file_id.to_string()));
        }

        let mut doc = ProvenanceDoc::new(mount, target_file_id);
        let mut file_queue = VecDeque::new();
        file_queue.push_back(target_file_id.to_string());

        while let Some(file_id) = file_queue.pop_front() {
            if doc.file.contains_key(&file_id) {
                continue;
            }
            let Some(file) = self.get_file(&file_id)? else {
                continue;
            };
            doc.file.insert(file_id.clone(), file);

            for write in self.ios_of_file(&file_id, IoDirection::Write)? {
                let process_id = write.process_id.clone();
                doc.write.insert(write.id(), write);
                self.export_process(&process_id, &mut doc, &mut file_queue)?;
            }
        }

        Ok(doc)
    }

    /// Pull a process, its reads, and its recorded ancestor chain into `doc`.
    fn export_process(
        &self,
        process_id: &str,
        doc: &mut ProvenanceDoc,
        file_queue: &mut VecDeque<String>,
    ) -> Result<()> {
        let mut queue = VecDeque::new();
        queue.push_back(process_id.to_string());

        while let Some(pid) = queue.pop_front() {
            if doc.process.contains_key(&pid) {
                continue;
            }
            let Some(process) = self.get_process(&pid)? else {
                continue;
            };

            for read in self.ios_of_process(&pid, IoDirection::Read)? {
                file_queue.push_back(read.file_id.clone());
                doc.read.insert(read.id(), read);
            }

            if let Some(parent_id) = process.parent_id() {
                queue.push_back(parent_id);
            }
            for fork in self.forks_of_child(&pid)? {
                queue.push_back(fork.parent_id);
            }

            doc.process.insert(pid, process);
        }
        Ok(())
    }

    /// Import a document, merging into existing records.
    ///
    /// On ID conflict the imported entry wins only when its timestamp is
    /// strictly older than the stored one; ties keep the existing record.
    pub fn import(&self, doc: &ProvenanceDoc) -> Result<ImportStats> {
        let mut stats = ImportStats::default();
        let mut batch = RecordBatch::default();

        for (id, file) in &doc.file {
            match self.get_file(id)? {
                Some(existing) if existing.created <= file.created => stats.kept += 1,
                existing => {
                    if existing.is_some() {
                        stats.replaced += 1;
                    } else {
                        stats.added += 1;
                    }
                    batch.files.push(file.clone());
                }
            }
        }
        for (id, process) in &doc.process {
            match self.get_process(id)? {
                Some(existing) if existing.pstart <= process.pstart => stats.kept += 1,
                Some(_) => {
                    // Same ID implies same pstart rendering; a strictly older
                    // import replaces via delete-then-insert.
                    stats.replaced += 1;
                    let conn = self.conn.lock().unwrap();
                    conn.execute("DELETE FROM process WHERE id = ?1", params![id])?;
                    drop(conn);
                    batch.processes.push(process.clone());
                }
                None => {
                    stats.added += 1;
                    batch.processes.push(process.clone());
                }
            }
        }
        for io in doc.read.values().chain(doc.write.values()) {
            match self.get_io(&io.id())? {
                Some(existing) if existing.open_time <= io.open_time => stats.kept += 1,
                existing => {
                    if existing.is_some() {
                        stats.replaced += 1;
                    } else {
                        stats.added += 1;
                    }
                    batch.ios.push(io.clone());
                }
            }
        }
        // Fork edges recoverable from process parent fields.
        for process in doc.process.values() {
            if let Some(parent_id) = process.parent_id() {
                if doc.process.contains_key(&parent_id) {
                    batch.forks.push(ForkRecord {
                        parent_id,
                        child_id: process.id(),
                    });
                }
            }
        }

        self.commit(&batch)?;
        Ok(stats)
    }

    pub fn get_io(&self, id: &str) -> Result<Option<IoRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT process_id, file_id, direction, seq, open_time, close_time, bytes, truncated
             FROM io WHERE id = ?1",
            params![id],
            io_from_row,
        )
        .optional()
        .map_err(Into::into)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub added: usize,
    pub replaced: usize,
    pub kept: usize,
}

fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

fn upsert_file(tx: &rusqlite::Transaction<'_>, file: &FileRecord) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO file (id, host, dev, inode, path, size, mtime, hash, vdf, created, unlinked, escaped)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(id) DO UPDATE SET
             path = excluded.path,
             size = excluded.size,
             mtime = excluded.mtime,
             hash = COALESCE(excluded.hash, file.hash),
             vdf = excluded.vdf,
             created = excluded.created,
             unlinked = excluded.unlinked,
             escaped = excluded.escaped",
        params![
            file.id(),
            file.host,
            file.dev as i64,
            file.inode as i64,
            file.path,
            file.size as i64,
            file.mtime,
            file.hash,
            file.vdf as i64,
            file.created,
            file.unlinked,
            file.escaped,
        ],
    )?;
    Ok(())
}

fn file_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        host: r.get(0)?,
        dev: r.get::<_, i64>(1)? as u64,
        inode: r.get::<_, i64>(2)? as u64,
        path: r.get(3)?,
        size: r.get::<_, i64>(4)? as u64,
        mtime: r.get(5)?,
        hash: r.get(6)?,
        vdf: r.get::<_, i64>(7)? != 0,
        created: r.get(8)?,
        unlinked: r.get(9)?,
        escaped: r.get(10)?,
    })
}

fn process_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessRecord> {
    Ok(ProcessRecord {
        phost: r.get(0)?,
        pstart: r.get(1)?,
        pid: r.get(2)?,
        parent_start: r.get(3)?,
        parent_pid: r.get(4)?,
        cmd: serde_json::from_str(&r.get::<_, String>(5)?).unwrap_or_default(),
        exe: r.get(6)?,
        hash: r.get(7)?,
        cwd: r.get(8)?,
        env: serde_json::from_str(&r.get::<_, String>(9)?).unwrap_or_default(),
        stdin: r.get(10)?,
        stdout: r.get(11)?,
        stderr: r.get(12)?,
        exit_status: r.get(13)?,
    })
}

fn io_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<IoRecord> {
    let direction: String = r.get(2)?;
    Ok(IoRecord {
        process_id: r.get(0)?,
        file_id: r.get(1)?,
        direction: IoDirection::from_str(&direction).unwrap_or(IoDirection::Read),
        seq: r.get::<_, i64>(3)? as u64,
        open_time: r.get(4)?,
        close_time: r.get(5)?,
        bytes: r.get::<_, Option<i64>>(6)?.map(|b| b as u64),
        truncated: r.get::<_, i64>(7)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use repeat_models::{hash_bytes_sha256, IoDirection};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn file(host: &str, inode: u64, path: &str, created: f64) -> FileRecord {
        FileRecord {
            host: host.into(),
            dev: 1,
            inode,
            path: path.into(),
            size: 6,
            mtime: created,
            hash: Some(hash_bytes_sha256(b"hello\n")),
            vdf: false,
            created,
            unlinked: None,
            escaped: None,
        }
    }

    fn process(host: &str, pid: i32, pstart: f64, cmd: &[&str]) -> ProcessRecord {
        ProcessRecord {
            phost: host.into(),
            pstart,
            pid,
            parent_start: 0.0,
            parent_pid: 0,
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            exe: format!("/usr/bin/{}", cmd.first().copied().unwrap_or("sh")),
            hash: "ab".repeat(32),
            cwd: "/data".into(),
            env: BTreeMap::new(),
            stdin: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            exit_status: None,
        }
    }

    fn io(process: &ProcessRecord, file: &FileRecord, dir: IoDirection, t: f64) -> IoRecord {
        IoRecord {
            process_id: process.id(),
            file_id: file.id(),
            direction: dir,
            seq: 0,
            open_time: t,
            close_time: t + 1.0,
            bytes: Some(6),
            truncated: false,
        }
    }

    #[test]
    fn batch_commit_round_trips() {
        let tmp = TempDir::new().expect("tempdir");
        let store = ProvStore::open(&tmp.path().join("prov.db")).expect("open");

        let f = file("h", 10, "/data/a.txt", 100.0);
        let p = process("h", 42, 99.0, &["echo", "hello"]);
        let i = io(&p, &f, IoDirection::Write, 100.0);

        let batch = RecordBatch {
            files: vec![f.clone()],
            processes: vec![p.clone()],
            ios: vec![i.clone()],
            exits: vec![(p.id(), 0)],
            ..Default::default()
        };
        store.commit(&batch).expect("commit");

        let got = store.get_file(&f.id()).expect("get").expect("present");
        assert_eq!(got.path, "/data/a.txt");
        assert_eq!(got.hash, f.hash);

        let got = store.get_process(&p.id()).expect("get").expect("present");
        assert_eq!(got.cmd, vec!["echo", "hello"]);
        assert_eq!(got.exit_status, Some(0));

        let writes = store.ios_of_file(&f.id(), IoDirection::Write).expect("ios");
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].id(), i.id());

        let by_path = store
            .latest_file_by_path("/data/a.txt")
            .expect("lookup")
            .expect("present");
        assert_eq!(by_path.id(), f.id());
    }

    #[test]
    fn exit_status_recorded_once() {
        let store = ProvStore::open_in_memory().expect("open");
        let p = process("h", 1, 1.0, &["true"]);
        store
            .commit(&RecordBatch {
                processes: vec![p.clone()],
                exits: vec![(p.id(), 0)],
                ..Default::default()
            })
            .expect("commit");
        store
            .commit(&RecordBatch {
                exits: vec![(p.id(), 7)],
                ..Default::default()
            })
            .expect("commit");
        let got = store.get_process(&p.id()).expect("get").expect("present");
        assert_eq!(got.exit_status, Some(0));
    }

    #[test]
    fn archive_rotates_reused_inode() {
        let store = ProvStore::open_in_memory().expect("open");
        let mut dead = file("h", 5, "/data/old.txt", 50.0);
        dead.unlinked = Some(60.0);
        let p = process("h", 9, 40.0, &["touch", "old.txt"]);
        let i = io(&p, &dead, IoDirection::Write, 50.0);
        store
            .commit(&RecordBatch {
                files: vec![dead.clone()],
                processes: vec![p],
                ios: vec![i],
                ..Default::default()
            })
            .expect("commit");

        store.archive_file(&dead.id()).expect("archive");
        assert!(store.get_file(&dead.id()).expect("get").is_none());

        let archived = store
            .get_file(&dead.archived_id())
            .expect("get")
            .expect("archived present");
        assert_eq!(archived.path, "/data/old.txt");

        let ios = store
            .ios_of_file(&dead.archived_id(), IoDirection::Write)
            .expect("ios");
        assert_eq!(ios.len(), 1, "IO rows follow the archived entity");
    }

    #[test]
    fn export_walks_transitive_predecessors() {
        // echo > a.txt; cp a.txt b.txt: b's provenance includes both steps.
        let store = ProvStore::open_in_memory().expect("open");
        let a = file("h", 10, "/data/a.txt", 100.0);
        let b = file("h", 11, "/data/b.txt", 200.0);
        let echo = process("h", 42, 99.0, &["echo", "hello"]);
        let cp = process("h", 43, 199.0, &["cp", "a.txt", "b.txt"]);

        store
            .commit(&RecordBatch {
                files: vec![a.clone(), b.clone()],
                processes: vec![echo.clone(), cp.clone()],
                ios: vec![
                    io(&echo, &a, IoDirection::Write, 100.0),
                    io(&cp, &a, IoDirection::Read, 200.0),
                    io(&cp, &b, IoDirection::Write, 200.0),
                ],
                ..Default::default()
            })
            .expect("commit");

        let doc = store.export(&b.id(), "/mnt/data").expect("export");
        assert_eq!(doc.target, b.id());
        assert!(doc.file.contains_key(&a.id()));
        assert!(doc.file.contains_key(&b.id()));
        assert!(doc.process.contains_key(&echo.id()));
        assert!(doc.process.contains_key(&cp.id()));
        assert_eq!(doc.write.len(), 2);
        assert_eq!(doc.read.len(), 1);
    }

    #[test]
    fn export_import_reexport_is_structurally_equal() {
        let store = ProvStore::open_in_memory().expect("open");
        let a = file("h", 10, "/data/a.txt", 100.0);
        let b = file("h", 11, "/data/b.txt", 200.0);
        let echo = process("h", 42, 99.0, &["echo", "hello"]);
        let cp = process("h", 43, 199.0, &["cp", "a.txt", "b.txt"]);
        store
            .commit(&RecordBatch {
                files: vec![a.clone(), b.clone()],
                processes: vec![echo.clone(), cp.clone()],
                ios: vec![
                    io(&echo, &a, IoDirection::Write, 100.0),
                    io(&cp, &a, IoDirection::Read, 200.0),
                    io(&cp, &b, IoDirection::Write, 200.0),
                ],
                ..Default::default()
            })
            .expect("commit");

        let doc = store.export(&b.id(), "/mnt/data").expect("export");

        let empty = ProvStore::open_in_memory().expect("open");
        let stats = empty.import(&doc).expect("import");
        assert_eq!(stats.replaced, 0);
        assert!(stats.added > 0);

        let doc2 = empty.export(&b.id(), "/mnt/data").expect("re-export");
        assert_eq!(
            doc.to_json().expect("json"),
            doc2.to_json().expect("json"),
            "round-trip must be byte-stable"
        );
    }

    #[test]
    fn import_conflict_keeps_newer_existing() {
        let store = ProvStore::open_in_memory().expect("open");
        let newer = file("h", 10, "/data/newer.txt", 100.0);
        store
            .commit(&RecordBatch {
                files: vec![newer.clone()],
                ..Default::default()
            })
            .expect("commit");

        // Imported copy of the same entity observed strictly earlier wins.
        let mut older = newer.clone();
        older.created = 50.0;
        older.path = "/data/older.txt".into();
        let mut doc = ProvenanceDoc::new("/mnt", &older.id());
        doc.file.insert(older.id(), older.clone());
        let stats = store.import(&doc).expect("import");
        assert_eq!(stats.replaced, 1);

        let got = store.get_file(&newer.id()).expect("get").expect("present");
        assert_eq!(got.path, "/data/older.txt");

        // Re-importing something not older keeps the stored record.
        let mut doc = ProvenanceDoc::new("/mnt", &newer.id());
        doc.file.insert(newer.id(), newer.clone());
        let stats = store.import(&doc).expect("import");
        assert_eq!(stats.kept, 1);
    }

    #[test]
    fn finalize_unmount_truncates_open_intervals() {
        let store = ProvStore::open_in_memory().expect("open");
        let f = file("h", 10, "/data/a.txt", 100.0);
        let p = process("h", 1, 1.0, &["cat"]);
        let open_io = IoRecord {
            process_id: p.id(),
            file_id: f.id(),
            direction: IoDirection::Read,
            seq: 0,
            open_time: 100.0,
            close_time: -1.0,
            bytes: None,
            truncated: false,
        };
        store
            .commit(&RecordBatch {
                files: vec![f.clone()],
                processes: vec![p],
                ios: vec![open_io.clone()],
                ..Default::default()
            })
            .expect("commit");

        let n = store.finalize_unmount(500.0).expect("finalize");
        assert_eq!(n, 1);
        let got = store.get_io(&open_io.id()).expect("get").expect("present");
        assert!(got.truncated);
        assert_eq!(got.close_time, 500.0);
    }
}
