//! Filesystem operation handlers.
//!
//! Each handler is passthrough to the backing directory, with `readdir`
//! augmented by the VDF resolver and `open`/`read`/`write`/`release`
//! augmented by the tracker. Mutating a virtual entry is EPERM. Provenance
//! failures are logged and never surface to the caller.

use crate::engine::{Engine, Handle};
use crate::plugins::FsOpKind;
use crate::{FsError, FsResult};
use repeat_models::synthetic_inode;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vdf_engine::Resolved;

/// Attributes in the shape the FUSE bridge needs for `getattr`.
#[derive(Debug, Clone, Copy)]
pub struct FileAttr {
    pub ino: u64,
    /// Full st_mode including the file type bits.
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub mtime: f64,
    pub uid: u32,
    pub gid: u32,
}

/// `statfs` result, straight from statvfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub namemax: u64,
}

impl Engine {
    pub fn getattr(&self, path: &str) -> FsResult<FileAttr> {
        if self.plugins().dispatch(FsOpKind::Getattr, path) {
            return Err(FsError::NotPermitted);
        }
        match self.vdf().resolve(path)? {
            Resolved::Real(real) => {
                let meta = std::fs::symlink_metadata(&real)?;
                Ok(FileAttr {
                    ino: meta.ino(),
                    mode: meta.mode(),
                    nlink: meta.nlink() as u32,
                    size: meta.size(),
                    mtime: meta.mtime() as f64 + meta.mtime_nsec() as f64 * 1e-9,
                    uid: meta.uid(),
                    gid: meta.gid(),
                })
            }
            Resolved::VdfDir(dir) => {
                let meta = std::fs::symlink_metadata(&dir.base_real)?;
                Ok(FileAttr {
                    ino: synthetic_inode(&dir.virt_path),
                    mode: libc::S_IFDIR | 0o555,
                    nlink: 2,
                    size: 0,
                    mtime: meta.mtime() as f64,
                    uid: meta.uid(),
                    gid: meta.gid(),
                })
            }
            Resolved::VdfLeaf(leaf) => {
                let size = self
                    .vdf()
                    .cache()
                    .peek(&leaf.cache_key())
                    .map(|(len, _)| len)
                    .unwrap_or(0);
                Ok(FileAttr {
                    ino: synthetic_inode(&leaf.virt_path),
                    mode: libc::S_IFREG | 0o444,
                    nlink: 1,
                    size,
                    mtime: 0.0,
                    uid: unsafe { libc::geteuid() },
                    gid: unsafe { libc::getegid() },
                })
            }
            Resolved::Provenance(leaf) => Ok(FileAttr {
                ino: synthetic_inode(&leaf.virt_path),
                mode: libc::S_IFREG | 0o444,
                nlink: 1,
                size: 0,
                mtime: 0.0,
                uid: unsafe { libc::geteuid() },
                gid: unsafe { libc::getegid() },
            }),
        }
    }

    pub fn access(&self, path: &str, mode: i32) -> FsResult<()> {
        if self.plugins().dispatch(FsOpKind::Access, path) {
            return Ok(());
        }
        match self.vdf().resolve(path)? {
            Resolved::Real(real) => {
                let c_path = c_path(&real)?;
                if unsafe { libc::access(c_path.as_ptr(), mode) } != 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
                Ok(())
            }
            // Virtual entries are read-only.
            _ if mode & libc::W_OK != 0 => Err(FsError::PermissionDenied),
            _ => Ok(()),
        }
    }

    pub fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        if self.plugins().dispatch(FsOpKind::Readdir, path) {
            return Err(FsError::NotPermitted);
        }
        match self.vdf().resolve(path)? {
            Resolved::Real(real) => {
                if !real.is_dir() {
                    return Err(FsError::NotDirectory);
                }
                let mut entries = vec![".".to_string(), "..".to_string()];
                let mut names = Vec::new();
                for entry in std::fs::read_dir(&real)? {
                    let entry = entry?;
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names.sort();
                if self.config().list_virtual {
                    let mut augmented = Vec::new();
                    for name in &names {
                        augmented.push(name.clone());
                        if real.join(name).is_file() && self.vdf().resolver().has_rules_for(name) {
                            augmented.push(format!("{name}+"));
                        }
                    }
                    entries.extend(augmented);
                } else {
                    entries.extend(names);
                }
                Ok(entries)
            }
            Resolved::VdfDir(dir) => {
                let mut entries = vec![".".to_string(), "..".to_string()];
                entries.extend(self.vdf().dir_entries(&dir));
                Ok(entries)
            }
            _ => Err(FsError::NotDirectory),
        }
    }

    pub fn open(&self, path: &str, read: bool, write: bool, caller_pid: i32) -> FsResult<u64> {
        if self.plugins().dispatch(FsOpKind::Open, path) {
            return Err(FsError::NotPermitted);
        }
        match self.vdf().resolve(path)? {
            Resolved::Real(real) => {
                let file = std::fs::OpenOptions::new()
                    .read(read || !write)
                    .write(write)
                    .open(&real)?;
                let fd = self.alloc_fd();
                self.insert_handle(fd, Handle::Real { file });
                if let Err(e) = self.tracker().on_open(&real, fd, read || !write, write, caller_pid)
                {
                    tracing::debug!("provenance open failed for {path}: {e}");
                }
                Ok(fd)
            }
            Resolved::VdfLeaf(leaf) => {
                if write {
                    return Err(FsError::PermissionDenied);
                }
                let handle = self.vdf().open_leaf(&leaf)?;
                let fd = self.alloc_fd();
                let now = repeat_models::now_ts();
                let (len, _) = handle.len();
                let record = self.leaf_file_record(&leaf, len, now, None, now);
                self.insert_handle(fd, Handle::Vdf { handle });
                if let Err(e) = self
                    .tracker()
                    .on_open_synthetic(record, fd, true, false, caller_pid)
                {
                    tracing::debug!("provenance open failed for {path}: {e}");
                }
                Ok(fd)
            }
            Resolved::Provenance(leaf) => {
                if write {
                    return Err(FsError::PermissionDenied);
                }
                let html = leaf.format == vdf_engine::ProvFormat::Html;
                let data = Arc::new(self.render_provenance(&leaf.source_virt, html)?);
                let fd = self.alloc_fd();
                self.insert_handle(fd, Handle::Buf { data });
                Ok(fd)
            }
            Resolved::VdfDir(_) => Err(FsError::Invalid),
        }
    }

    pub fn create(&self, path: &str, mode: u32, caller_pid: i32) -> FsResult<u64> {
        if self.plugins().dispatch(FsOpKind::Create, path) {
            return Err(FsError::NotPermitted);
        }
        let Resolved::Real(real) = self.vdf().resolve(path)? else {
            return Err(FsError::NotPermitted);
        };
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(mode)
            .open(&real)?;
        let fd = self.alloc_fd();
        self.insert_handle(fd, Handle::Real { file });
        if let Err(e) = self.tracker().on_open(&real, fd, false, true, caller_pid) {
            tracing::debug!("provenance create failed for {path}: {e}");
        }
        Ok(fd)
    }

    pub fn read(&self, fd: u64, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let handle = self.handle(fd)?;
        let data = match handle.as_ref() {
            Handle::Real { file, .. } => {
                let mut buf = vec![0u8; size];
                let n = file.read_at(&mut buf, offset)?;
                buf.truncate(n);
                buf
            }
            Handle::Vdf { handle } => handle.read_at(offset, size).map_err(|e| match e {
                vdf_engine::VdfError::Derivation(msg) => FsError::Io(msg),
                other => other.into(),
            })?,
            Handle::Buf { data } => {
                let start = (offset as usize).min(data.len());
                let end = (start + size).min(data.len());
                data[start..end].to_vec()
            }
        };
        self.tracker().on_read(fd, data.len() as u64);
        Ok(data)
    }

    pub fn write(&self, fd: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        let handle = self.handle(fd)?;
        match handle.as_ref() {
            Handle::Real { file, .. } => {
                let n = file.write_at(data, offset)?;
                self.tracker().on_write(fd, n as u64);
                Ok(n)
            }
            _ => Err(FsError::NotPermitted),
        }
    }

    pub fn release(&self, fd: u64) -> FsResult<()> {
        let removed = self.handles.write().unwrap().remove(&fd);
        if removed.is_none() {
            return Err(FsError::BadDescriptor);
        }
        if let Err(e) = self.tracker().on_close(fd) {
            tracing::debug!("provenance close failed for fd {fd}: {e}");
        }
        Ok(())
    }

    pub fn mknod(&self, path: &str, mode: u32, dev: u64) -> FsResult<()> {
        if self.plugins().dispatch(FsOpKind::Mknod, path) {
            return Ok(());
        }
        let Resolved::Real(real) = self.vdf().resolve(path)? else {
            return Err(FsError::NotPermitted);
        };
        let c_path = c_path(&real)?;
        if unsafe { libc::mknod(c_path.as_ptr(), mode as libc::mode_t, dev as libc::dev_t) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        if self.plugins().dispatch(FsOpKind::Mkdir, path) {
            return Ok(());
        }
        let Resolved::Real(real) = self.vdf().resolve(path)? else {
            return Err(FsError::NotPermitted);
        };
        std::fs::create_dir(&real)?;
        std::fs::set_permissions(&real, std::fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        if self.plugins().dispatch(FsOpKind::Rmdir, path) {
            return Ok(());
        }
        let Resolved::Real(real) = self.vdf().resolve(path)? else {
            return Err(FsError::NotPermitted);
        };
        std::fs::remove_dir(&real)?;
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        if self.plugins().dispatch(FsOpKind::Unlink, path) {
            return Ok(());
        }
        let Resolved::Real(real) = self.vdf().resolve(path)? else {
            return Err(FsError::NotPermitted);
        };
        let meta = std::fs::symlink_metadata(&real)?;
        std::fs::remove_file(&real)?;
        if let Err(e) = self.tracker().on_unlink(meta.dev(), meta.ino()) {
            tracing::debug!("provenance unlink failed for {path}: {e}");
        }
        Ok(())
    }

    pub fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        if self.plugins().dispatch(FsOpKind::Rename, old) {
            return Ok(());
        }
        let Resolved::Real(old_real) = self.vdf().resolve(old)? else {
            return Err(FsError::NotPermitted);
        };
        let Resolved::Real(new_real) = self.vdf().resolve(new)? else {
            return Err(FsError::NotPermitted);
        };
        let meta = std::fs::symlink_metadata(&old_real)?;
        std::fs::rename(&old_real, &new_real)?;

        // The inode is followed: identity is preserved, only the display
        // path changes. A destination whose parent is a symlink out of the
        // backing tree means the inode escaped the mount.
        let escaped = new_real
            .parent()
            .and_then(|p| p.canonicalize().ok())
            .map(|p| !p.starts_with(self.root()))
            .unwrap_or(false);
        let result = if escaped {
            self.tracker().on_escape(meta.dev(), meta.ino())
        } else {
            self.tracker().on_rename(&new_real)
        };
        if let Err(e) = result {
            tracing::debug!("provenance rename failed for {old}: {e}");
        }
        Ok(())
    }

    pub fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        if self.plugins().dispatch(FsOpKind::Symlink, link) {
            return Ok(());
        }
        let Resolved::Real(link_real) = self.vdf().resolve(link)? else {
            return Err(FsError::NotPermitted);
        };
        std::os::unix::fs::symlink(target, link_real)?;
        Ok(())
    }

    pub fn link(&self, src: &str, dst: &str) -> FsResult<()> {
        if self.plugins().dispatch(FsOpKind::Link, dst) {
            return Ok(());
        }
        let Resolved::Real(src_real) = self.vdf().resolve(src)? else {
            return Err(FsError::NotPermitted);
        };
        let Resolved::Real(dst_real) = self.vdf().resolve(dst)? else {
            return Err(FsError::NotPermitted);
        };
        std::fs::hard_link(src_real, dst_real)?;
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> FsResult<PathBuf> {
        if self.plugins().dispatch(FsOpKind::Readlink, path) {
            return Err(FsError::NotPermitted);
        }
        match self.vdf().resolve(path)? {
            Resolved::Real(real) => Ok(std::fs::read_link(real)?),
            // Virtual entries are never symlinks.
            _ => Err(FsError::Invalid),
        }
    }

    pub fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        if self.plugins().dispatch(FsOpKind::Chmod, path) {
            return Ok(());
        }
        match self.vdf().resolve(path)? {
            Resolved::Real(real) => {
                std::fs::set_permissions(&real, std::fs::Permissions::from_mode(mode))?;
                Ok(())
            }
            _ => Err(FsError::NotPermitted),
        }
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        if self.plugins().dispatch(FsOpKind::Chown, path) {
            return Ok(());
        }
        match self.vdf().resolve(path)? {
            Resolved::Real(real) => {
                let c_path = c_path(&real)?;
                if unsafe { libc::chown(c_path.as_ptr(), uid, gid) } != 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
                Ok(())
            }
            _ => Err(FsError::NotPermitted),
        }
    }

    pub fn truncate(&self, path: &str, fd: Option<u64>, len: u64) -> FsResult<()> {
        if self.plugins().dispatch(FsOpKind::Truncate, path) {
            return Ok(());
        }
        if let Some(fd) = fd {
            let handle = self.handle(fd)?;
            let Handle::Real { file, .. } = handle.as_ref() else {
                return Err(FsError::NotPermitted);
            };
            file.set_len(len)?;
            self.tracker().on_write(fd, 0);
            return Ok(());
        }
        match self.vdf().resolve(path)? {
            Resolved::Real(real) => {
                let file = std::fs::OpenOptions::new().write(true).open(&real)?;
                file.set_len(len)?;
                Ok(())
            }
            _ => Err(FsError::NotPermitted),
        }
    }

    pub fn utimens(&self, path: &str, atime: f64, mtime: f64) -> FsResult<()> {
        if self.plugins().dispatch(FsOpKind::Utimens, path) {
            return Ok(());
        }
        match self.vdf().resolve(path)? {
            Resolved::Real(real) => {
                let c_path = c_path(&real)?;
                let times = [timespec(atime), timespec(mtime)];
                let rc = unsafe {
                    libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0)
                };
                if rc != 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
                Ok(())
            }
            // Timestamps of virtual entries are synthetic; accept silently.
            _ => Ok(()),
        }
    }

    pub fn statfs(&self, path: &str) -> FsResult<StatFs> {
        if self.plugins().dispatch(FsOpKind::Statfs, path) {
            return Err(FsError::NotPermitted);
        }
        let real = match self.vdf().resolve(path)? {
            Resolved::Real(real) => real,
            // Virtual paths report the backing filesystem's stats.
            _ => self.root().to_path_buf(),
        };
        let c_path = c_path(&real)?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(StatFs {
            bsize: stat.f_bsize as u64,
            frsize: stat.f_frsize as u64,
            blocks: stat.f_blocks as u64,
            bfree: stat.f_bfree as u64,
            bavail: stat.f_bavail as u64,
            files: stat.f_files as u64,
            ffree: stat.f_ffree as u64,
            namemax: stat.f_namemax as u64,
        })
    }

    pub fn fsync(&self, fd: u64) -> FsResult<()> {
        let handle = self.handle(fd)?;
        match handle.as_ref() {
            Handle::Real { file, .. } => {
                file.sync_all()?;
                Ok(())
            }
            // Nothing durable behind virtual files.
            _ => Ok(()),
        }
    }

    fn insert_handle(&self, fd: u64, handle: Handle) {
        self.handles.write().unwrap().insert(fd, Arc::new(handle));
    }
}

fn c_path(path: &Path) -> FsResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| FsError::Invalid)
}

fn timespec(seconds: f64) -> libc::timespec {
    libc::timespec {
        tv_sec: seconds as libc::time_t,
        tv_nsec: ((seconds.fract()) * 1e9) as libc::c_long,
    }
}

#[cfg(test)]
#[cfg(target_os = "linux")]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::MountOptions;
    use repeat_models::{hash_bytes_sha256, IoDirection};
    use tempfile::TempDir;

    fn caller() -> i32 {
        std::process::id() as i32
    }

    fn mount_engine(tmp: &TempDir, config: Config) -> Arc<Engine> {
        let root = tmp.path().join("target");
        let mount = tmp.path().join("mnt");
        let config_dir = tmp.path().join("conf");
        std::fs::create_dir_all(&root).expect("mkdir");
        Engine::mount(&root, &mount, &config_dir, config, MountOptions::default())
            .expect("mount")
    }

    fn fastq_config() -> Config {
        Config::parse(
            "[entry]\nmatch=\\.fastq$\next=.fasta\ncmd=sed -e s/^@/>/ {input}\n",
        )
        .expect("config")
    }

    #[test]
    fn passthrough_read_and_stat_match_backing_file() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = mount_engine(&tmp, Config::default());
        std::fs::write(engine.root().join("a.txt"), b"hello\n").expect("seed");

        let attr = engine.getattr("a.txt").expect("getattr");
        assert_eq!(attr.size, 6);
        assert_eq!(attr.mode & libc::S_IFMT, libc::S_IFREG);

        let fd = engine.open("a.txt", true, false, caller()).expect("open");
        let data = engine.read(fd, 0, 4096).expect("read");
        engine.release(fd).expect("release");
        assert_eq!(data, b"hello\n");

        let listing = engine.readdir("").expect("readdir");
        assert!(listing.contains(&"a.txt".to_string()));
    }

    #[test]
    fn write_through_engine_records_provenance() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = mount_engine(&tmp, Config::default());

        let fd = engine.create("out.txt", 0o644, caller()).expect("create");
        engine.write(fd, 0, b"hello\n").expect("write");
        engine.release(fd).expect("release");

        let file_id = engine.file_id_of_virt("out.txt").expect("file id");
        let file = engine
            .store()
            .get_file(&file_id)
            .expect("lookup")
            .expect("recorded");
        assert_eq!(file.hash, Some(hash_bytes_sha256(b"hello\n")));

        let writes = engine
            .store()
            .ios_of_file(&file_id, IoDirection::Write)
            .expect("ios");
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].bytes, Some(6));
    }

    #[test]
    fn vdf_leaf_reads_through_engine() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = mount_engine(&tmp, fastq_config());
        std::fs::write(engine.root().join("x.fastq"), b"@r\nACGT\n").expect("seed");

        let listing = engine.readdir("x.fastq+").expect("readdir");
        assert!(listing.contains(&"x.fastq.fasta".to_string()));
        assert!(listing.contains(&"x.fastq.provenance.json".to_string()));

        let fd = engine
            .open("x.fastq+/x.fastq.fasta", true, false, caller())
            .expect("open leaf");
        let data = engine.read(fd, 0, 4096).expect("read");
        assert_eq!(data, b">r\nACGT\n");

        // Once frozen, stat reports the buffer length.
        let attr = engine.getattr("x.fastq+/x.fastq.fasta").expect("getattr");
        assert_eq!(attr.size, 8);
        engine.release(fd).expect("release");
    }

    #[test]
    fn virtual_entries_reject_mutation() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = mount_engine(&tmp, fastq_config());
        std::fs::write(engine.root().join("x.fastq"), b"@r\n").expect("seed");

        let leaf = "x.fastq+/x.fastq.fasta";
        assert!(matches!(
            engine.open(leaf, false, true, caller()),
            Err(FsError::PermissionDenied)
        ));
        assert!(matches!(
            engine.chmod(leaf, 0o777),
            Err(FsError::NotPermitted)
        ));
        assert!(matches!(engine.unlink(leaf), Err(FsError::NotPermitted)));
        assert!(matches!(
            engine.access(leaf, libc::W_OK),
            Err(FsError::PermissionDenied)
        ));
    }

    #[test]
    fn provenance_json_leaf_serves_the_subgraph() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = mount_engine(&tmp, Config::default());

        let fd = engine.create("a.txt", 0o644, caller()).expect("create");
        engine.write(fd, 0, b"hello\n").expect("write");
        engine.release(fd).expect("release");

        let fd = engine
            .open("a.txt+/a.txt.provenance.json", true, false, caller())
            .expect("open provenance");
        let data = engine.read(fd, 0, 1 << 20).expect("read");
        engine.release(fd).expect("release");

        let parsed: serde_json::Value = serde_json::from_slice(&data).expect("valid json");
        let file_id = engine.file_id_of_virt("a.txt").expect("file id");
        assert_eq!(parsed["target"], serde_json::json!(file_id));
    }

    #[test]
    fn rename_and_unlink_flow_through_tracker() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = mount_engine(&tmp, Config::default());

        let fd = engine.create("old.txt", 0o644, caller()).expect("create");
        engine.write(fd, 0, b"x").expect("write");
        engine.release(fd).expect("release");
        let file_id = engine.file_id_of_virt("old.txt").expect("file id");

        engine.rename("old.txt", "new.txt").expect("rename");
        let file = engine
            .store()
            .get_file(&file_id)
            .expect("lookup")
            .expect("identity preserved");
        assert!(file.path.ends_with("new.txt"));

        engine.unlink("new.txt").expect("unlink");
        let file = engine
            .store()
            .get_file(&file_id)
            .expect("lookup")
            .expect("record kept");
        assert!(file.unlinked.is_some());
    }

    #[test]
    fn readdir_augments_with_virtual_dirs_when_enabled() {
        let tmp = TempDir::new().expect("tempdir");
        let mut config = fastq_config();
        config.list_virtual = true;
        let engine = mount_engine(&tmp, config);
        std::fs::write(engine.root().join("x.fastq"), b"@r\n").expect("seed");
        std::fs::write(engine.root().join("plain.bin"), b"1").expect("seed");

        let listing = engine.readdir("").expect("readdir");
        assert!(listing.contains(&"x.fastq+".to_string()));
        assert!(!listing.contains(&"plain.bin+".to_string()));
    }

    #[test]
    fn exported_provenance_replays_in_list_mode() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = mount_engine(&tmp, Config::default());

        // cp-shaped session: read a.txt, write b.txt.
        std::fs::write(engine.root().join("a.txt"), b"hello\n").expect("seed");
        let src = engine.open("a.txt", true, false, caller()).expect("open src");
        let data = engine.read(src, 0, 4096).expect("read");
        let dst = engine.create("b.txt", 0o644, caller()).expect("create dst");
        engine.write(dst, 0, &data).expect("write");
        engine.release(src).expect("release src");
        engine.release(dst).expect("release dst");

        let doc = engine.export_provenance("b.txt").expect("export");
        assert!(doc.file.len() >= 2, "both sides of the copy exported");

        let rep = replicator::Replicator::new(
            doc,
            replicator::ReplicateOptions {
                root: tmp.path().join("repl"),
                ..Default::default()
            },
        )
        .expect("replicator");
        let lines = rep.list().expect("list");
        let commands: Vec<_> = lines.iter().filter(|l| l.starts_with('[')).collect();
        assert_eq!(commands.len(), 1, "one recording process: {lines:?}");
    }

    #[test]
    fn statfs_and_fsync_pass_through() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = mount_engine(&tmp, Config::default());
        std::fs::write(engine.root().join("a.txt"), b"x").expect("seed");

        let stat = engine.statfs("a.txt").expect("statfs");
        assert!(stat.bsize > 0);

        let fd = engine.open("a.txt", true, false, caller()).expect("open");
        engine.fsync(fd).expect("fsync");
        engine.release(fd).expect("release");
    }
}
