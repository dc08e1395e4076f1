//! The mount engine value.
//!
//! All mount state lives here and is threaded explicitly through the
//! operation handlers and plugins; there is no ambient singleton. The
//! engine owns the provenance store and tracker, the VDF engine, the open
//! descriptor table, and the plugin registry.

use crate::config::Config;
use crate::plugins::PluginRegistry;
use crate::{FsError, FsResult};
use proc_probe::{NullProbe, ProcessInspector};
use prov_graph::GraphRenderer;
use prov_store::ProvStore;
use prov_tracker::Tracker;
use repeat_models::{synthetic_inode, FileRecord, ProcessRecord};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use vdf_engine::{BuildReport, VdfEngine, VdfHandle, VdfLeaf};

#[derive(Debug, Error)]
pub enum MountError {
    #[error(transparent)]
    Store(#[from] prov_store::StoreError),
    #[error(transparent)]
    Vdf(#[from] vdf_engine::VdfError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// VDF-only mode: serve the synthetic namespace, record nothing.
    pub disable_provenance: bool,
    /// Passed through to the FUSE bridge (`-o allow_other`).
    pub allow_other: bool,
}

/// One open descriptor.
pub(crate) enum Handle {
    Real { file: std::fs::File },
    Vdf { handle: VdfHandle },
    Buf { data: Arc<Vec<u8>> },
}

pub struct Engine {
    root: PathBuf,
    mount: PathBuf,
    opts: MountOptions,
    config: Config,
    store: Arc<ProvStore>,
    tracker: Arc<Tracker>,
    vdf: VdfEngine,
    plugins: PluginRegistry,
    pub(crate) handles: RwLock<HashMap<u64, Arc<Handle>>>,
    next_fd: AtomicU64,
    html_renderer: RwLock<Option<Box<dyn GraphRenderer + Send + Sync>>>,
    stopping: AtomicBool,
}

impl Engine {
    /// Build the engine for a (target, mount) pair. The store and VDF
    /// staging area live under `config_dir`.
    pub fn mount(
        root: &Path,
        mount: &Path,
        config_dir: &Path,
        config: Config,
        opts: MountOptions,
    ) -> Result<Arc<Self>, MountError> {
        let root = root.canonicalize()?;
        std::fs::create_dir_all(config_dir)?;

        let store = Arc::new(ProvStore::open(&config_dir.join("provenance.db"))?);
        store.register_mount(&root.to_string_lossy(), &mount.to_string_lossy())?;

        let probe: Arc<dyn ProcessInspector> = if opts.disable_provenance {
            Arc::new(NullProbe)
        } else {
            Arc::from(proc_probe::detect())
        };
        let tracker = Arc::new(Tracker::new(Arc::clone(&store), probe));
        if !tracker.enabled() {
            tracing::info!("serving VDF-only: no provenance will be recorded");
        }

        let rules = vdf_engine::RuleSet::from_entries(config.entries.clone())?;
        let vdf = VdfEngine::new(
            &root,
            mount,
            rules,
            &config_dir.join("cache"),
            config.store_size,
            config.max_chain_depth,
            config.derivation_timeout,
        )?;

        let plugins = PluginRegistry::from_config(&config.plugins, &config.plugin_settings);

        let engine = Arc::new(Self {
            root,
            mount: mount.to_path_buf(),
            opts,
            config,
            store,
            tracker,
            vdf,
            plugins,
            handles: RwLock::new(HashMap::new()),
            next_fd: AtomicU64::new(1),
            html_renderer: RwLock::new(None),
            stopping: AtomicBool::new(false),
        });
        engine.install_vdf_hooks();
        Ok(engine)
    }

    /// Wire derivation completion into the tracker so every VDF build is
    /// recorded exactly as if a user had run it.
    fn install_vdf_hooks(self: &Arc<Self>) {
        let snapshots: Arc<Mutex<HashMap<i32, ProcessRecord>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let probe = Arc::clone(self.tracker.probe());
        let stash = Arc::clone(&snapshots);
        let spawn_hook: vdf_engine::SpawnHook = Arc::new(move |_leaf: &VdfLeaf, pid: i32| {
            if let Ok(record) = probe.snapshot(pid) {
                stash.lock().unwrap().insert(pid, record);
            }
        });

        let engine = Arc::downgrade(self);
        let complete_hook: vdf_engine::CompleteHook =
            Arc::new(move |leaf: &VdfLeaf, report: &BuildReport| {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                let (Some(pid), Some(exit)) = (report.pid, report.exit) else {
                    return;
                };
                if exit != 0 {
                    return;
                }
                let process = snapshots
                    .lock()
                    .unwrap()
                    .remove(&pid)
                    .unwrap_or_else(|| derivation_fallback_record(&engine, leaf, pid, report));
                let file = engine.leaf_file_record(
                    leaf,
                    report.bytes,
                    report.finished,
                    report.sha256.clone(),
                    report.started,
                );
                engine.tracker.record_derivation(
                    process,
                    exit,
                    file,
                    report.started,
                    report.finished,
                    report.bytes,
                );
            });

        self.vdf.set_hooks(spawn_hook, complete_hook);
    }

    /// Install the external HTML renderer collaborator. Without one, the
    /// `.provenance.html` leaf serves the JSON rendering.
    pub fn set_html_renderer(&self, renderer: Box<dyn GraphRenderer + Send + Sync>) {
        *self.html_renderer.write().unwrap() = Some(renderer);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount
    }

    /// Options the FUSE bridge reads when attaching (`allow_other` etc).
    pub fn mount_options(&self) -> &MountOptions {
        &self.opts
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<ProvStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub(crate) fn vdf(&self) -> &VdfEngine {
        &self.vdf
    }

    pub(crate) fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub(crate) fn alloc_fd(&self) -> u64 {
        self.next_fd.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn handle(&self, fd: u64) -> FsResult<Arc<Handle>> {
        self.handles
            .read()
            .unwrap()
            .get(&fd)
            .cloned()
            .ok_or(FsError::BadDescriptor)
    }

    /// The File entity a VDF leaf is recorded under: no backing inode, so
    /// identity is synthesized from the canonical virtual path.
    pub(crate) fn leaf_file_record(
        &self,
        leaf: &VdfLeaf,
        size: u64,
        mtime: f64,
        hash: Option<String>,
        created: f64,
    ) -> FileRecord {
        FileRecord {
            host: self.tracker.host().to_string(),
            dev: 0,
            inode: synthetic_inode(&leaf.virt_path),
            path: self.mount.join(&leaf.virt_path).to_string_lossy().into_owned(),
            size,
            mtime,
            hash,
            vdf: true,
            created,
            unlinked: None,
            escaped: None,
        }
    }

    /// Export the provenance document for a mount-relative virtual path.
    pub fn export_provenance(&self, virt: &str) -> FsResult<repeat_models::ProvenanceDoc> {
        let file_id = self.file_id_of_virt(virt)?;
        self.store
            .export(&file_id, &self.mount.to_string_lossy())
            .map_err(|e| match e {
                prov_store::StoreError::NotFound(_) => FsError::NotFound,
                other => FsError::Io(other.to_string()),
            })
    }

    /// The store identity for a virtual path: real files by (dev, inode),
    /// VDF leaves by synthetic identity.
    pub(crate) fn file_id_of_virt(&self, virt: &str) -> FsResult<String> {
        use std::os::unix::fs::MetadataExt;
        match self.vdf.resolve(virt)? {
            vdf_engine::Resolved::Real(real) => {
                let meta = std::fs::symlink_metadata(&real)?;
                Ok(repeat_models::file_id(
                    self.tracker.host(),
                    meta.dev(),
                    meta.ino(),
                ))
            }
            vdf_engine::Resolved::VdfLeaf(leaf) => Ok(repeat_models::file_id(
                self.tracker.host(),
                0,
                synthetic_inode(&leaf.virt_path),
            )),
            _ => Err(FsError::NotFound),
        }
    }

    /// Render a provenance leaf for a source path. The JSON leaf serves the
    /// portable export document; the HTML leaf goes through the installed
    /// renderer collaborator (JSON graph rendering when none is attached).
    pub(crate) fn render_provenance(
        &self,
        source_virt: &str,
        html: bool,
    ) -> FsResult<Vec<u8>> {
        if !html {
            return match self.export_provenance(source_virt) {
                Ok(doc) => {
                    let json = doc.to_json().map_err(|e| FsError::Io(e.to_string()))?;
                    Ok(json.into_bytes())
                }
                // Nothing recorded yet for this file.
                Err(FsError::NotFound) => Ok(b"{}\n".to_vec()),
                Err(e) => Err(e),
            };
        }

        let file_id = self.file_id_of_virt(source_virt)?;
        let graph = match prov_graph::build_subgraph(&self.store, &file_id, None) {
            Ok(graph) => graph,
            Err(prov_graph::GraphError::NoSuchFile(_)) => return Ok(b"{}\n".to_vec()),
            Err(e) => return Err(FsError::Io(e.to_string())),
        };
        let mut buf = Vec::new();
        let html_renderer = self.html_renderer.read().unwrap();
        let renderer: &dyn GraphRenderer = match html_renderer.as_ref() {
            Some(renderer) => renderer.as_ref(),
            None => &prov_graph::JsonRenderer,
        };
        renderer
            .render(&graph, &mut buf)
            .map_err(|e| FsError::Io(e.to_string()))?;
        Ok(buf)
    }

    /// Unmount: finalize open IO intervals and stop accepting control
    /// commands.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("unmounting {}", self.mount.display());
        if let Err(e) = self.tracker.finalize_unmount() {
            tracing::warn!("unmount finalization failed: {e}");
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

/// When the derivation exits before the probe can see it, fall back to a
/// record built from what the executor knows.
fn derivation_fallback_record(
    engine: &Engine,
    leaf: &VdfLeaf,
    pid: i32,
    report: &BuildReport,
) -> ProcessRecord {
    let rule = leaf.rule();
    let argv = rule.build_argv(&leaf.base_real, None);
    ProcessRecord {
        phost: engine.tracker.host().to_string(),
        pstart: report.started,
        pid,
        parent_start: 0.0,
        parent_pid: std::process::id() as i32,
        cmd: argv.clone(),
        exe: argv.first().cloned().unwrap_or_default(),
        hash: String::new(),
        cwd: engine.mount.to_string_lossy().into_owned(),
        env: rule.env.clone(),
        stdin: String::new(),
        stdout: String::new(),
        stderr: String::new(),
        exit_status: None,
    }
}
