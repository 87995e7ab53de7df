//! Access to the local cache of a volume: stat conversion, descriptor
//! cache, attribute application and metadata record upkeep.

use std::fs::{File, Metadata, OpenOptions};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;

use moka::sync::Cache;

use crate::error::{Result, ZfsError};
use crate::fh::{Fattr, FileType, Sattr, ZfsFh};
use crate::metadata::record::MetadataRecord;
use crate::volume::Volume;

/// Most local descriptors kept open at once.
const FD_CACHE_CAPACITY: u64 = 256;

/// Bounded cache of open descriptors of locally cached files. Eviction
/// closes the descriptor; mutation paths invalidate explicitly when an
/// inode is replaced under a handle.
pub struct LocalFiles {
    cache: Cache<ZfsFh, Arc<File>>,
}

impl LocalFiles {
    pub fn new() -> LocalFiles {
        LocalFiles { cache: Cache::new(FD_CACHE_CAPACITY) }
    }

    /// Descriptor of `path` for `fh`, opened read-write without creation.
    pub fn open(&self, fh: &ZfsFh, path: &Path) -> Result<Arc<File>> {
        if let Some(file) = self.cache.get(fh) {
            return Ok(file);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .or_else(|_| OpenOptions::new().read(true).open(path))
            .map(Arc::new)?;
        self.cache.insert(*fh, file.clone());
        Ok(file)
    }

    /// Drop the cached descriptor after an unlink, rename or truncate.
    pub fn invalidate(&self, fh: &ZfsFh) {
        self.cache.invalidate(fh);
    }
}

impl Default for LocalFiles {
    fn default() -> Self {
        LocalFiles::new()
    }
}

/// Attributes of a stat result, with the version filled in by the caller.
pub fn fattr_from_stat(md: &Metadata, version: u64) -> Fattr {
    Fattr {
        ftype: FileType::from_mode_bits(md.mode()),
        mode: md.mode() & 0o7777,
        uid: md.uid(),
        gid: md.gid(),
        nlink: md.nlink() as u32,
        size: md.size(),
        blksize: md.blksize() as u32,
        blocks: md.blocks(),
        atime: md.atime(),
        mtime: md.mtime(),
        ctime: md.ctime(),
        version,
    }
}

/// `lstat` of a path in the local cache.
pub fn stat_path(path: &Path) -> Result<Metadata> {
    Ok(std::fs::symlink_metadata(path)?)
}

/// Apply an attribute change to a local path. Size changes truncate,
/// times go through `filetime`, mode and ownership through the usual
/// syscalls.
pub fn apply_sattr(path: &Path, attr: &Sattr) -> Result<()> {
    if let Some(size) = attr.size {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(size)?;
    }
    if let Some(mode) = attr.mode {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))?;
    }
    if attr.uid.is_some() || attr.gid.is_some() {
        let uid = attr.uid.map(|u| u as libc::uid_t).unwrap_or(u32::MAX);
        let gid = attr.gid.map(|g| g as libc::gid_t).unwrap_or(u32::MAX);
        let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| ZfsError::InvalidArgument)?;
        let rc = unsafe { libc::lchown(cpath.as_ptr(), uid, gid) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    if attr.atime.is_some() || attr.mtime.is_some() {
        let stat = stat_path(path)?;
        let atime = attr.atime.unwrap_or_else(|| stat.atime());
        let mtime = attr.mtime.unwrap_or_else(|| stat.mtime());
        filetime::set_symlink_file_times(
            path,
            filetime::FileTime::from_unix_time(atime, 0),
            filetime::FileTime::from_unix_time(mtime, 0),
        )?;
    }
    Ok(())
}

/// The metadata record of a local inode, creating a fresh one when the
/// store has an empty slot. A generation mismatch with a reused inode slot
/// is repaired by bumping the generation.
pub fn get_metadata(
    vol: &Volume,
    this_sid: u32,
    vid: u32,
    md: &Metadata,
    is_copy: bool,
) -> Result<MetadataRecord> {
    let dev = md.dev() as u32;
    let ino = md.ino() as u32;
    vol.metadata_op(|store| {
        if let Some(record) = store.lookup(dev, ino) {
            return Ok(record);
        }
        let mut record = MetadataRecord {
            dev,
            ino,
            gen: 1,
            flags: 0,
            local_version: 1,
            master_version: if is_copy { 0 } else { 1 },
            master_fh: ZfsFh::UNDEFINED,
        };
        if !is_copy {
            // the master's own handle doubles as the master handle
            record.master_fh = ZfsFh::new(this_sid, vid, dev, ino, 1);
            record.set_flag(crate::metadata::record::FLAG_COMPLETE, true);
        }
        store.flush(&record)?;
        Ok(record)
    })
}

/// The local handle of a stat'ed inode.
pub fn local_fh(this_sid: u32, vid: u32, md: &Metadata, record: &MetadataRecord) -> ZfsFh {
    ZfsFh::new(this_sid, vid, md.dev() as u32, md.ino() as u32, record.gen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_conversion_maps_type_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"xyz").unwrap();
        let md = stat_path(&path).unwrap();
        let attr = fattr_from_stat(&md, 5);
        assert_eq!(attr.ftype, FileType::Reg);
        assert_eq!(attr.size, 3);
        assert_eq!(attr.version, 5);

        let attr = fattr_from_stat(&stat_path(dir.path()).unwrap(), 1);
        assert_eq!(attr.ftype, FileType::Dir);
    }

    #[test]
    fn sattr_application() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"0123456789").unwrap();

        apply_sattr(
            &path,
            &Sattr {
                mode: Some(0o640),
                size: Some(4),
                mtime: Some(1_000_000),
                ..Default::default()
            },
        )
        .unwrap();

        let md = stat_path(&path).unwrap();
        assert_eq!(md.size(), 4);
        assert_eq!(md.mode() & 0o7777, 0o640);
        assert_eq!(md.mtime(), 1_000_000);
    }

    #[test]
    fn fd_cache_reuses_and_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        let files = LocalFiles::new();
        let fh = ZfsFh::new(1, 7, 1, 2, 1);

        let a = files.open(&fh, &path).unwrap();
        let b = files.open(&fh, &path).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        files.invalidate(&fh);
        let c = files.open(&fh, &path).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
