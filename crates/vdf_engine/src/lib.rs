//! Virtual dynamic files.
//!
//! Three pieces layered over the real directory: the path translator
//! (recognizes the reserved `+` suffix and resolves chained suffixes), the
//! rule resolver (matches configured derivation rules against effective
//! filenames), and the executor/cache (runs derivation commands on first
//! access, multiplexes concurrent readers over one in-memory buffer, and
//! evicts under memory pressure).

mod cache;
mod resolve;
pub mod rules;

pub use cache::{BuildReport, CacheStats, Derivation, SlotPhase, VdfCache, VdfHandle};
pub use resolve::{ProvFormat, ProvLeaf, Resolved, Resolver, VdfDir, VdfLeaf, DEFAULT_MAX_CHAIN};
pub use rules::{RuleEntry, RuleSet, VdfRule, PROVENANCE_HTML_EXT, PROVENANCE_JSON_EXT};

use repeat_models::synthetic_inode;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VdfError {
    #[error("no such virtual path: {0}")]
    NotFound(String),
    #[error("vdf chain at {path} exceeds depth {max}")]
    ChainTooDeep { path: String, max: u32 },
    #[error("derivation failed: {0}")]
    Derivation(String),
    #[error("invalid rule pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VdfError>;

/// Called with the derivation's child pid immediately after spawn, while the
/// process is guaranteed alive (we hold its wait handle).
pub type SpawnHook = Arc<dyn Fn(&VdfLeaf, i32) + Send + Sync>;

/// Called once the derivation exits, successful or not.
pub type CompleteHook = Arc<dyn Fn(&VdfLeaf, &BuildReport) + Send + Sync>;

/// Front door for the synthetic namespace: translation, resolution, and
/// materialization behind one value.
pub struct VdfEngine {
    resolver: Resolver,
    cache: VdfCache,
    staging: PathBuf,
    mount: PathBuf,
    spawn_hook: RwLock<Option<SpawnHook>>,
    complete_hook: RwLock<Option<CompleteHook>>,
}

impl VdfEngine {
    pub fn new(
        root: &Path,
        mount: &Path,
        rules: RuleSet,
        staging: &Path,
        high_water: u64,
        max_chain: u32,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        std::fs::create_dir_all(staging)?;
        Ok(Self {
            resolver: Resolver::new(root, rules).with_max_chain(max_chain),
            cache: VdfCache::new(high_water, timeout),
            staging: staging.to_path_buf(),
            mount: mount.to_path_buf(),
            spawn_hook: RwLock::new(None),
            complete_hook: RwLock::new(None),
        })
    }

    pub fn with_hooks(self, spawn: SpawnHook, complete: CompleteHook) -> Self {
        self.set_hooks(spawn, complete);
        self
    }

    /// Install (or replace) the build observers after construction.
    pub fn set_hooks(&self, spawn: SpawnHook, complete: CompleteHook) {
        *self.spawn_hook.write().unwrap() = Some(spawn);
        *self.complete_hook.write().unwrap() = Some(complete);
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn cache(&self) -> &VdfCache {
        &self.cache
    }

    /// Classify a mount-relative virtual path.
    pub fn resolve(&self, virt: &str) -> Result<Resolved> {
        self.resolver.resolve(virt)
    }

    /// Open a leaf for reading, triggering the derivation on first access.
    ///
    /// Chained leaves materialize their prerequisite first: the upstream
    /// leaf's frozen bytes are staged to a scratch file which becomes this
    /// derivation's `{input}` (under a kernel mount the virtual path itself
    /// would serve; staging keeps the bytes identical without one).
    pub fn open_leaf(&self, leaf: &VdfLeaf) -> Result<VdfHandle> {
        let input = if leaf.chain.len() == 1 {
            leaf.base_real.clone()
        } else {
            let parent = leaf.parent_leaf();
            let handle = self.open_leaf(&parent)?;
            let bytes = handle.read_to_end()?;
            let staged = self
                .staging
                .join(format!("{:x}", synthetic_inode(&parent.virt_path)));
            if !staged.exists() {
                std::fs::write(&staged, &bytes)?;
            }
            staged
        };

        let rule = leaf.rule().clone();
        let key = leaf.cache_key();
        let env = rule.env.clone();

        let output = if rule.cmd.contains("{output}") {
            Some(
                self.staging
                    .join(format!("{:x}.out", synthetic_inode(&leaf.virt_path))),
            )
        } else {
            None
        };

        let argv = rule.build_argv(&input, output.as_deref());
        // Derivations run inside the mount so they see the synthetic
        // namespace; when no kernel mount is attached the backing root
        // stands in.
        let cwd = if self.mount.is_dir() {
            self.mount.clone()
        } else {
            self.resolver.root().to_path_buf()
        };
        let spawn_hook = self.spawn_hook.read().unwrap().clone();
        let complete_hook = self.complete_hook.read().unwrap().clone();
        let leaf_for_spawn = leaf.clone();
        let leaf_for_complete = leaf.clone();

        self.cache.open(
            &key,
            cache::Derivation {
                argv,
                cwd,
                env,
                output,
            },
            move |pid| {
                if let Some(hook) = spawn_hook {
                    hook(&leaf_for_spawn, pid);
                }
            },
            move |report| {
                if let Some(hook) = complete_hook {
                    hook(&leaf_for_complete, report);
                }
            },
        )
    }

    /// Directory entries of a synthetic `X+` directory.
    pub fn dir_entries(&self, dir: &VdfDir) -> Vec<String> {
        self.resolver.dir_entries(dir)
    }
}
