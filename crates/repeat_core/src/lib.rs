//! Mount engine.
//!
//! Ties the provenance tracker, the VDF engine, and the real-filesystem
//! passthrough together behind an explicit [`Engine`] value. The kernel FUSE
//! bridge is an external collaborator: it delivers the POSIX operation set
//! to [`Engine`]'s handlers and converts [`FsError`] to errnos via
//! [`FsError::errno`].

mod config;
mod control;
mod engine;
mod fsops;
mod plugins;

pub use config::{Config, ConfigError, CONFIG_FILE};
pub use control::{send_shutdown, ControlServer};
pub use engine::{Engine, MountOptions};
pub use fsops::{FileAttr, StatFs};
pub use plugins::{FsOpKind, OpLogPlugin, Plugin, PluginOutcome, PluginRegistry};

use thiserror::Error;

/// Filesystem-operation errors, one variant per POSIX outcome the bridge can
/// report. Provenance failures never surface here.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("not a directory")]
    NotDirectory,
    #[error("invalid argument")]
    Invalid,
    #[error("vdf chain too deep")]
    VdfChainTooDeep,
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("io error: {0}")]
    Io(String),
}

pub type FsResult<T> = std::result::Result<T, FsError>;

impl FsError {
    /// The errno the FUSE bridge hands back to the kernel.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::NotPermitted => libc::EPERM,
            Self::NotDirectory => libc::ENOTDIR,
            Self::Invalid => libc::EINVAL,
            Self::VdfChainTooDeep => libc::ELOOP,
            Self::BadDescriptor => libc::EBADF,
            Self::Io(_) => libc::EIO,
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io(e.to_string()),
        }
    }
}

impl From<vdf_engine::VdfError> for FsError {
    fn from(e: vdf_engine::VdfError) -> Self {
        match e {
            vdf_engine::VdfError::NotFound(_) => Self::NotFound,
            vdf_engine::VdfError::ChainTooDeep { .. } => Self::VdfChainTooDeep,
            vdf_engine::VdfError::Io(io) => Self::from(io),
            other => Self::Io(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_posix() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::NotPermitted.errno(), libc::EPERM);
        assert_eq!(FsError::VdfChainTooDeep.errno(), libc::ELOOP);
    }

    #[test]
    fn io_errors_map_by_kind() {
        let e = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(matches!(FsError::from(e), FsError::NotFound));
        let e = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(FsError::from(e), FsError::PermissionDenied));
    }
}
