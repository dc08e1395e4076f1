//! Replication engine.
//!
//! Consumes an exported provenance document, computes a schedule of the
//! processes causally upstream of the target, re-executes them against a
//! replication root, and verifies executable hashes and exit statuses.
//! Verification discrepancies are collected as warnings; a process that
//! fails to execute at all aborts the schedule.

use repeat_models::{fmt_ts, hash_file_sha256, ProcessRecord, ProvenanceDoc};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};
use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicateError {
    #[error("provenance schedule contains a cycle involving {0}")]
    ScheduleCyclic(String),
    #[error("process failed to execute: {0}")]
    ProcessFailed(String),
    #[error("target {0} missing from provenance document")]
    MalformedDoc(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReplicateError>;

/// Writes happening within this window of a later read still count as its
/// cause (clock granularity across piped processes).
const IO_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Default)]
pub struct ReplicateOptions {
    /// Replication root the recorded mount is rewritten to.
    pub root: PathBuf,
    /// Process IDs split out individually and re-executed unconditionally.
    pub expand: BTreeSet<String>,
    /// Environment keys restored from the recorded environment.
    pub env_allow: Vec<String>,
    /// Redirect targets for the re-executed processes' stdio.
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

/// Result of a replication run.
#[derive(Debug, Default)]
pub struct ReplicationReport {
    pub executed: usize,
    /// Verification discrepancies, one `[warn]`-worthy line each.
    pub warnings: Vec<String>,
}

pub struct Replicator {
    doc: ProvenanceDoc,
    opts: ReplicateOptions,
}

impl Replicator {
    pub fn new(doc: ProvenanceDoc, opts: ReplicateOptions) -> Result<Self> {
        if !doc.file.contains_key(&doc.target) {
            return Err(ReplicateError::MalformedDoc(doc.target.clone()));
        }
        Ok(Self { doc, opts })
    }

    /// Processes causally upstream of the target (including its producer),
    /// plus anything explicitly expanded.
    fn upstream_set(&self) -> BTreeSet<String> {
        let mut processes = BTreeSet::new();
        let mut files = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(self.doc.target.clone());
        files.insert(self.doc.target.clone());

        while let Some(file_id) = queue.pop_front() {
            for write in self.doc.write.values().filter(|w| w.file_id == file_id) {
                if !processes.insert(write.process_id.clone()) {
                    continue;
                }
                for read in self
                    .doc
                    .read
                    .values()
                    .filter(|r| r.process_id == write.process_id)
                {
                    if files.insert(read.file_id.clone()) {
                        queue.push_back(read.file_id.clone());
                    }
                }
            }
        }

        for id in &self.opts.expand {
            if self.doc.process.contains_key(id) {
                processes.insert(id.clone());
            }
        }
        processes.retain(|id| self.doc.process.contains_key(id));
        processes
    }

    /// Topological order over the upstream set respecting write-before-read
    /// and parent-before-child, ties broken by original pstart then pid.
    pub fn schedule(&self) -> Result<Vec<String>> {
        let set = self.upstream_set();
        let mut successors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut indegree: BTreeMap<String, usize> = set.iter().map(|id| (id.clone(), 0)).collect();

        let add_edge = |from: &str, to: &str,
                            successors: &mut BTreeMap<String, Vec<String>>,
                            indegree: &mut BTreeMap<String, usize>| {
            if from == to {
                return;
            }
            let entry = successors.entry(from.to_string()).or_default();
            if !entry.contains(&to.to_string()) {
                entry.push(to.to_string());
                *indegree.get_mut(to).expect("node present") += 1;
            }
        };

        // (a) a process runs after every process whose output it reads.
        for read in self.doc.read.values() {
            if !set.contains(&read.process_id) {
                continue;
            }
            for write in self
                .doc
                .write
                .values()
                .filter(|w| w.file_id == read.file_id && set.contains(&w.process_id))
            {
                if write.close_time <= read.open_time + IO_EPSILON {
                    add_edge(
                        &write.process_id,
                        &read.process_id,
                        &mut successors,
                        &mut indegree,
                    );
                }
            }
        }

        // (b) a process runs after its parent starts.
        for id in &set {
            if let Some(parent_id) = self.doc.process[id].parent_id() {
                if set.contains(&parent_id) {
                    add_edge(&parent_id, id, &mut successors, &mut indegree);
                }
            }
        }

        // (c) ties broken by original pstart then pid.
        let sort_key = |id: &str| {
            let p = &self.doc.process[id];
            (OrderedF64(p.pstart), p.pid, id.to_string())
        };

        let mut heap: BinaryHeap<Reverse<(OrderedF64, i32, String)>> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| Reverse(sort_key(id)))
            .collect();

        let mut order = Vec::with_capacity(set.len());
        while let Some(Reverse((_, _, id))) = heap.pop() {
            for succ in successors.get(&id).cloned().unwrap_or_default() {
                let deg = indegree.get_mut(&succ).expect("node present");
                *deg -= 1;
                if *deg == 0 {
                    heap.push(Reverse(sort_key(&succ)));
                }
            }
            order.push(id);
        }

        if order.len() < set.len() {
            // IO happens-before induces a DAG; a leftover node means the
            // document is corrupted.
            let stuck = set
                .iter()
                .find(|id| !order.contains(id))
                .cloned()
                .unwrap_or_default();
            return Err(ReplicateError::ScheduleCyclic(stuck));
        }
        Ok(order)
    }

    /// Human-readable listing of the schedule without executing anything:
    /// `[host|start|pid]` headers, command lines, and `mkdir` steps preceding
    /// the first use of each working directory.
    pub fn list(&self) -> Result<Vec<String>> {
        let order = self.schedule()?;
        let mut lines = Vec::new();
        let mut seen_dirs: BTreeSet<PathBuf> = BTreeSet::new();

        for id in order {
            let record = &self.doc.process[&id];
            let cwd = self.rewrite_cwd(record);
            if cwd != self.opts.root && seen_dirs.insert(cwd.clone()) {
                lines.push(format!("mkdir -p {}", cwd.display()));
            }
            let mut line = format!(
                "[{}|{}|{}] {}",
                record.phost,
                fmt_ts(record.pstart),
                record.pid,
                shell_join(&self.rewrite_argv(record)),
            );
            // Recorded file redirections are part of the command line.
            for (stream, op) in [(&record.stdin, "<"), (&record.stdout, ">"), (&record.stderr, "2>")]
            {
                if self.is_mount_file(stream) {
                    line.push_str(&format!(" {op} {}", self.rewrite_str(stream)));
                }
            }
            lines.push(line);
        }
        Ok(lines)
    }

    /// Re-execute the schedule and verify each process against its record.
    pub fn run(&self) -> Result<ReplicationReport> {
        let order = self.schedule()?;
        let mut report = ReplicationReport::default();
        std::fs::create_dir_all(&self.opts.root)?;

        for id in order {
            let record = &self.doc.process[&id];
            let argv = self.rewrite_argv(record);
            if argv.is_empty() {
                return Err(ReplicateError::ProcessFailed(format!(
                    "{id} has no recorded command line"
                )));
            }

            let cwd = self.rewrite_cwd(record);
            std::fs::create_dir_all(&cwd)?;

            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]).current_dir(&cwd);
            for key in &self.opts.env_allow {
                if let Some(val) = record.env.get(key) {
                    cmd.env(key, self.rewrite_str(val));
                }
            }
            self.redirect(&mut cmd)?;

            tracing::info!("replicating [{id}] {}", shell_join(&argv));
            let status = match cmd.status() {
                Ok(status) => status,
                Err(e) => {
                    return Err(ReplicateError::ProcessFailed(format!(
                        "{}: {e}",
                        argv[0]
                    )));
                }
            };
            report.executed += 1;

            // Pipelines are not reconstructed: each member runs on its own.
            if [&record.stdin, &record.stdout, &record.stderr]
                .iter()
                .any(|s| s.starts_with("pipe:"))
            {
                report.warnings.push(format!(
                    "{}: recorded stdio was a pipe, ran standalone",
                    shell_join(&argv)
                ));
            }

            self.verify(record, &argv, status.code(), &mut report);
        }
        Ok(report)
    }

    /// Whether a recorded stdio link names a file under the recorded mount.
    fn is_mount_file(&self, stream: &str) -> bool {
        !self.doc.mount.is_empty()
            && stream
                .strip_prefix(&self.doc.mount)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    fn verify(
        &self,
        record: &ProcessRecord,
        argv: &[String],
        exit: Option<i32>,
        report: &mut ReplicationReport,
    ) {
        let label = shell_join(argv);

        let exe = self.rewrite_str(&record.exe);
        if exe.is_empty() || !Path::new(&exe).exists() {
            report
                .warnings
                .push(format!("{label}: recorded executable {exe:?} not found"));
        } else if !record.hash.is_empty() {
            match hash_file_sha256(Path::new(&exe)) {
                Ok(hash) if hash == record.hash => {}
                Ok(_) => report.warnings.push(format!(
                    "{label}: executable hash differs from recorded version"
                )),
                Err(e) => report
                    .warnings
                    .push(format!("{label}: could not hash executable: {e}")),
            }
        }

        if let (Some(recorded), Some(actual)) = (record.exit_status, exit) {
            if recorded != actual {
                report.warnings.push(format!(
                    "{label}: exit status {actual} differs from recorded {recorded}"
                ));
            }
        }
    }

    fn redirect(&self, cmd: &mut Command) -> Result<()> {
        if let Some(path) = &self.opts.stdout {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            cmd.stdout(Stdio::from(file));
        }
        if let Some(path) = &self.opts.stderr {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            cmd.stderr(Stdio::from(file));
        }
        Ok(())
    }

    /// Rewrite the recorded spawn-time cwd relative to the replication root.
    fn rewrite_cwd(&self, record: &ProcessRecord) -> PathBuf {
        let mount = Path::new(&self.doc.mount);
        match Path::new(&record.cwd).strip_prefix(mount) {
            Ok(rel) if rel.as_os_str().is_empty() => self.opts.root.clone(),
            Ok(rel) => self.opts.root.join(rel),
            // Recorded cwd was outside the mount; fall back to the root.
            Err(_) => self.opts.root.clone(),
        }
    }

    fn rewrite_argv(&self, record: &ProcessRecord) -> Vec<String> {
        record.cmd.iter().map(|arg| self.rewrite_str(arg)).collect()
    }

    /// Rewrite a token naming a path under the recorded mount. Only a leading
    /// mount followed by a separator (or the mount itself) counts; paths that
    /// merely share the mount as a string prefix are left intact.
    fn rewrite_str(&self, s: &str) -> String {
        let mount = self.doc.mount.as_str();
        if mount.is_empty() {
            return s.to_string();
        }
        let root = self.opts.root.to_string_lossy();
        if s == mount {
            return root.into_owned();
        }
        match s.strip_prefix(mount) {
            Some(rest) if rest.starts_with('/') => format!("{root}{rest}"),
            _ => s.to_string(),
        }
    }
}

/// f64 wrapper with a total order for use in schedule keys.
#[derive(Debug, Clone, PartialEq)]
struct OrderedF64(f64);

impl Eq for OrderedF64 {}

impl PartialOrd for OrderedF64 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(' ') || arg.contains('"') {
                format!("'{}'", arg.replace('\'', r"'\''"))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
