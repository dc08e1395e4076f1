//! Provenance graph query.
//!
//! Reverse breadth-first traversal of the store's IO and fork edge multiset
//! for a target file, bounded by an optional depth (in process hops).
//! Traversal order is deterministic: write edges into a file are visited
//! sorted by (process start time, process ID, IO sequence), so a bounded
//! query always selects the same sub-graph.

use prov_store::{ProvStore, StoreError};
use repeat_models::{FileRecord, IoDirection, IoRecord, ProcessRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no such file in store: {0}")]
    NoSuchFile(String),
    #[error("render error: {0}")]
    Render(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// The provenance sub-graph for one target file. Node sets are deduplicated;
/// the IO maps carry edge multiplicities via their (process, file, direction,
/// sequence) keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubGraph {
    pub target: String,
    pub files: BTreeMap<String, FileRecord>,
    pub processes: BTreeMap<String, ProcessRecord>,
    pub reads: BTreeMap<String, IoRecord>,
    pub writes: BTreeMap<String, IoRecord>,
    pub forks: BTreeSet<(String, String)>,
}

/// Build the reverse sub-graph for `target`, following write edges into each
/// file, read edges out of each producing process, and fork edges up the
/// process tree. `max_depth` bounds the number of process hops.
pub fn build_subgraph(
    store: &ProvStore,
    target: &str,
    max_depth: Option<u32>,
) -> Result<SubGraph> {
    let target_file = store
        .get_file(target)?
        .ok_or_else(|| GraphError::NoSuchFile(target.to_string()))?;

    let mut graph = SubGraph {
        target: target.to_string(),
        files: BTreeMap::new(),
        processes: BTreeMap::new(),
        reads: BTreeMap::new(),
        writes: BTreeMap::new(),
        forks: BTreeSet::new(),
    };
    graph.files.insert(target.to_string(), target_file);

    let mut queue: VecDeque<(String, u32)> = VecDeque::new();
    let mut visited_files: BTreeSet<String> = BTreeSet::new();
    queue.push_back((target.to_string(), 0));
    visited_files.insert(target.to_string());

    while let Some((file_id, depth)) = queue.pop_front() {
        if let Some(max) = max_depth {
            if depth >= max {
                continue;
            }
        }

        let mut writes = store.ios_of_file(&file_id, IoDirection::Write)?;
        sort_edges(&mut writes);

        for write in writes {
            let process_id = write.process_id.clone();
            graph.writes.insert(write.id(), write);

            for pid in process_with_lineage(store, &process_id, &mut graph)? {
                let mut reads = store.ios_of_process(&pid, IoDirection::Read)?;
                sort_edges(&mut reads);
                for read in reads {
                    let upstream = read.file_id.clone();
                    graph.reads.insert(read.id(), read);
                    if visited_files.insert(upstream.clone()) {
                        if let Some(file) = store.get_file(&upstream)? {
                            graph.files.insert(upstream.clone(), file);
                        }
                        queue.push_back((upstream, depth + 1));
                    }
                }
            }
        }
    }

    Ok(graph)
}

/// Add a process and its recorded ancestor chain to the graph, returning the
/// IDs newly added (whose reads still need traversal).
fn process_with_lineage(
    store: &ProvStore,
    process_id: &str,
    graph: &mut SubGraph,
) -> Result<Vec<String>> {
    let mut added = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(process_id.to_string());

    while let Some(pid) = queue.pop_front() {
        if graph.processes.contains_key(&pid) {
            continue;
        }
        let Some(process) = store.get_process(&pid)? else {
            continue;
        };

        if let Some(parent_id) = process.parent_id() {
            graph.forks.insert((parent_id.clone(), pid.clone()));
            queue.push_back(parent_id);
        }
        for fork in store.forks_of_child(&pid)? {
            graph.forks.insert((fork.parent_id.clone(), pid.clone()));
            queue.push_back(fork.parent_id);
        }

        graph.processes.insert(pid.clone(), process);
        added.push(pid);
    }
    Ok(added)
}

/// Order edges by (process start time, process ID, IO sequence). The start
/// time is the middle field of the process ID and is rendered with fixed
/// precision, so parsing it back is exact.
fn sort_edges(edges: &mut [IoRecord]) {
    edges.sort_by(|a, b| {
        let ka = (pstart_of(&a.process_id), a.process_id.clone(), a.seq);
        let kb = (pstart_of(&b.process_id), b.process_id.clone(), b.seq);
        ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn pstart_of(process_id: &str) -> f64 {
    process_id
        .split('|')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

/// Formatting pass over a sub-graph. The HTML+SVG renderer is an external
/// collaborator implementing this trait; JSON ships here.
pub trait GraphRenderer {
    fn render(&self, graph: &SubGraph, out: &mut dyn std::io::Write) -> std::io::Result<()>;
}

pub struct JsonRenderer;

impl GraphRenderer for JsonRenderer {
    fn render(&self, graph: &SubGraph, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        let data = serde_json::to_vec_pretty(graph)?;
        out.write_all(&data)
    }
}

/// Render a sub-graph to an in-memory JSON buffer.
pub fn render_json(graph: &SubGraph) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    JsonRenderer.render(graph, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prov_store::RecordBatch;
    use repeat_models::ForkRecord;
    use std::collections::BTreeMap as Map;

    fn file(inode: u64, path: &str, created: f64) -> FileRecord {
        FileRecord {
            host: "h".into(),
            dev: 1,
            inode,
            path: path.into(),
            size: 1,
            mtime: created,
            hash: None,
            vdf: false,
            created,
            unlinked: None,
            escaped: None,
        }
    }

    fn process(pid: i32, pstart: f64, parent: Option<(i32, f64)>, cmd: &[&str]) -> ProcessRecord {
        ProcessRecord {
            phost: "h".into(),
            pstart,
            pid,
            parent_start: parent.map(|(_, s)| s).unwrap_or(0.0),
            parent_pid: parent.map(|(p, _)| p).unwrap_or(0),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            exe: format!("/bin/{}", cmd[0]),
            hash: "cd".repeat(32),
            cwd: "/data".into(),
            env: Map::new(),
            stdin: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            exit_status: Some(0),
        }
    }

    fn io(p: &ProcessRecord, f: &FileRecord, dir: IoDirection, t: f64) -> IoRecord {
        IoRecord {
            process_id: p.id(),
            file_id: f.id(),
            direction: dir,
            seq: 0,
            open_time: t,
            close_time: t + 1.0,
            bytes: Some(1),
            truncated: false,
        }
    }

    /// shell forks cp; echo > a.txt; cp a.txt b.txt.
    fn seeded_store() -> (ProvStore, FileRecord, FileRecord) {
        let store = ProvStore::open_in_memory().expect("store");
        let a = file(10, "/data/a.txt", 100.0);
        let b = file(11, "/data/b.txt", 200.0);
        let shell = process(40, 50.0, None, &["bash"]);
        let echo = process(42, 99.0, Some((40, 50.0)), &["echo", "hi"]);
        let cp = process(43, 199.0, Some((40, 50.0)), &["cp", "a.txt", "b.txt"]);

        store
            .commit(&RecordBatch {
                files: vec![a.clone(), b.clone()],
                processes: vec![shell.clone(), echo.clone(), cp.clone()],
                ios: vec![
                    io(&echo, &a, IoDirection::Write, 100.0),
                    io(&cp, &a, IoDirection::Read, 200.0),
                    io(&cp, &b, IoDirection::Write, 200.0),
                ],
                forks: vec![
                    ForkRecord {
                        parent_id: shell.id(),
                        child_id: echo.id(),
                    },
                    ForkRecord {
                        parent_id: shell.id(),
                        child_id: cp.id(),
                    },
                ],
                ..Default::default()
            })
            .expect("commit");
        (store, a, b)
    }

    #[test]
    fn traversal_reaches_transitive_producers() {
        let (store, a, b) = seeded_store();
        let graph = build_subgraph(&store, &b.id(), None).expect("subgraph");

        assert_eq!(graph.files.len(), 2);
        assert!(graph.files.contains_key(&a.id()));
        assert_eq!(graph.processes.len(), 3, "echo, cp, and their shell");
        assert_eq!(graph.writes.len(), 2);
        assert_eq!(graph.reads.len(), 1);
        assert_eq!(graph.forks.len(), 2);
    }

    #[test]
    fn depth_bound_stops_the_walk() {
        let (store, a, b) = seeded_store();
        let graph = build_subgraph(&store, &b.id(), Some(1)).expect("subgraph");

        // One process hop: cp and its lineage, file a discovered but not
        // expanded, so echo's write is absent.
        assert!(graph.files.contains_key(&a.id()));
        assert_eq!(graph.writes.len(), 1);
        let writers: Vec<_> = graph
            .writes
            .values()
            .map(|w| w.file_id.clone())
            .collect();
        assert_eq!(writers, vec![b.id()]);
    }

    #[test]
    fn repeated_builds_render_identically() {
        let (store, _, b) = seeded_store();
        let one = render_json(&build_subgraph(&store, &b.id(), None).expect("subgraph"))
            .expect("render");
        let two = render_json(&build_subgraph(&store, &b.id(), None).expect("subgraph"))
            .expect("render");
        assert_eq!(one, two);
    }

    #[test]
    fn unknown_target_errors() {
        let store = ProvStore::open_in_memory().expect("store");
        let err = build_subgraph(&store, "h|9|9", None).expect_err("missing file");
        assert!(matches!(err, GraphError::NoSuchFile(_)));
    }
}
