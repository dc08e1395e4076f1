//! Plugin dispatch.
//!
//! Plugins declare the filesystem operations they handle as a capability
//! set; the dispatcher walks the ordered plugin list before the core handler
//! runs, and a plugin may intercept to short-circuit downstream dispatch and
//! the core handler itself.

use std::collections::BTreeMap;

/// The filesystem operations a plugin can claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FsOpKind {
    Getattr,
    Access,
    Readdir,
    Open,
    Read,
    Write,
    Release,
    Create,
    Mknod,
    Mkdir,
    Rmdir,
    Unlink,
    Rename,
    Symlink,
    Link,
    Readlink,
    Chmod,
    Chown,
    Truncate,
    Utimens,
    Statfs,
    Fsync,
}

impl FsOpKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Getattr => "getattr",
            Self::Access => "access",
            Self::Readdir => "readdir",
            Self::Open => "open",
            Self::Read => "read",
            Self::Write => "write",
            Self::Release => "release",
            Self::Create => "create",
            Self::Mknod => "mknod",
            Self::Mkdir => "mkdir",
            Self::Rmdir => "rmdir",
            Self::Unlink => "unlink",
            Self::Rename => "rename",
            Self::Symlink => "symlink",
            Self::Link => "link",
            Self::Readlink => "readlink",
            Self::Chmod => "chmod",
            Self::Chown => "chown",
            Self::Truncate => "truncate",
            Self::Utimens => "utimens",
            Self::Statfs => "statfs",
            Self::Fsync => "fsync",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginOutcome {
    /// Fall through to the next plugin, then the core handler.
    Continue,
    /// Stop dispatch; the core handler does not run.
    Intercept,
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Operations this plugin wants to see.
    fn capabilities(&self) -> &[FsOpKind];

    /// Observe (or intercept) one operation on a virtual path.
    fn handle(&self, op: FsOpKind, path: &str) -> PluginOutcome;
}

/// Ordered plugin list, walked per operation.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginRegistry {
    /// Instantiate the configured plugins by name. Unknown names are skipped
    /// with a warning so a stale config does not block mounting.
    pub fn from_config(
        names: &[String],
        settings: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Self {
        let mut registry = Self::default();
        for name in names {
            match name.as_str() {
                "oplog" => {
                    let empty = BTreeMap::new();
                    let opts = settings.get("oplog").unwrap_or(&empty);
                    registry.register(Box::new(OpLogPlugin::from_settings(opts)));
                }
                other => tracing::warn!("unknown plugin '{other}' in configuration, skipping"),
            }
        }
        registry
    }

    /// Names of plugins this build ships.
    pub fn available() -> &'static [&'static str] {
        &["oplog"]
    }

    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Walk the plugin list; true means some plugin intercepted.
    pub fn dispatch(&self, op: FsOpKind, path: &str) -> bool {
        for plugin in &self.plugins {
            if !plugin.capabilities().contains(&op) {
                continue;
            }
            if plugin.handle(op, path) == PluginOutcome::Intercept {
                return true;
            }
        }
        false
    }
}

/// Built-in plugin that logs operations through `tracing`.
pub struct OpLogPlugin {
    ops: Vec<FsOpKind>,
}

impl OpLogPlugin {
    pub fn from_settings(settings: &BTreeMap<String, String>) -> Self {
        // `oplog.ops=open,release` restricts logging to the named ops.
        let ops = match settings.get("ops") {
            Some(names) => ALL_OPS
                .iter()
                .copied()
                .filter(|op| names.split(',').any(|n| n.trim() == op.name()))
                .collect(),
            None => ALL_OPS.to_vec(),
        };
        Self { ops }
    }
}

const ALL_OPS: &[FsOpKind] = &[
    FsOpKind::Getattr,
    FsOpKind::Access,
    FsOpKind::Readdir,
    FsOpKind::Open,
    FsOpKind::Read,
    FsOpKind::Write,
    FsOpKind::Release,
    FsOpKind::Create,
    FsOpKind::Mknod,
    FsOpKind::Mkdir,
    FsOpKind::Rmdir,
    FsOpKind::Unlink,
    FsOpKind::Rename,
    FsOpKind::Symlink,
    FsOpKind::Link,
    FsOpKind::Readlink,
    FsOpKind::Chmod,
    FsOpKind::Chown,
    FsOpKind::Truncate,
    FsOpKind::Utimens,
    FsOpKind::Statfs,
    FsOpKind::Fsync,
];

impl Plugin for OpLogPlugin {
    fn name(&self) -> &str {
        "oplog"
    }

    fn capabilities(&self) -> &[FsOpKind] {
        &self.ops
    }

    fn handle(&self, op: FsOpKind, path: &str) -> PluginOutcome {
        tracing::debug!("fs op {} on /{path}", op.name());
        PluginOutcome::Continue
    }
}
